// src/transport.rs

use crate::config::{ProxySettings, Settings};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, RANGE};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("server responded with HTTP {0}")]
    Status(u16),
    #[error("transfer interrupted: {0}")]
    Interrupted(String),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl TransportError {
    /// Whether reopening with a resume offset may succeed.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TransportError::Interrupted(_))
    }
}

/// An open response body. Dropping it closes the connection.
pub struct Body {
    content_length: Option<u64>,
    resumed: bool,
    chunks: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl Body {
    pub fn new(
        content_length: Option<u64>,
        resumed: bool,
        chunks: BoxStream<'static, Result<Bytes, TransportError>>,
    ) -> Self {
        Self {
            content_length,
            resumed,
            chunks,
        }
    }

    /// Body of a fully buffered payload, handy for tests and small files.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len() as u64;
        let chunks = futures_util::stream::once(async move { Ok::<_, TransportError>(data) }).boxed();
        Self::new(Some(len), false, chunks)
    }

    /// Length of the bytes this body will deliver, when the server announced it.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length.filter(|len| *len > 0)
    }

    /// True when the server honoured the requested resume offset.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Next chunk, or `None` once the body is exhausted.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.chunks.next().await
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("content_length", &self.content_length)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Streaming GET used by the pipeline.
pub trait Transport: Send + Sync + 'static {
    /// Opens `url`, asking the server to start at byte `resume_from`.
    fn open(
        &self,
        url: &str,
        resume_from: u64,
    ) -> impl Future<Output = Result<Body, TransportError>> + Send;
}

/// reqwest-backed transport with a one-shot proxy fallback.
pub struct HttpTransport {
    direct: Client,
    proxied: Option<Client>,
    proxy_failed: AtomicBool,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, TransportError> {
        let direct = base_builder(settings).no_proxy().build()?;
        let proxied = match &settings.proxy {
            Some(proxy) => Some(
                base_builder(settings)
                    .proxy(build_proxy(proxy)?)
                    .build()?,
            ),
            None => None,
        };
        Ok(Self {
            direct,
            proxied,
            proxy_failed: AtomicBool::new(false),
        })
    }

    /// True once the proxy has been abandoned in favour of direct connections.
    pub fn proxy_failed(&self) -> bool {
        self.proxy_failed.load(Ordering::SeqCst)
    }

    fn active_client(&self) -> (&Client, bool) {
        match &self.proxied {
            Some(client) if !self.proxy_failed() => (client, true),
            _ => (&self.direct, false),
        }
    }

    async fn send(
        client: &Client,
        url: &str,
        resume_from: u64,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = client.get(url);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        }
        request.send().await
    }
}

impl Transport for HttpTransport {
    async fn open(&self, url: &str, resume_from: u64) -> Result<Body, TransportError> {
        let (client, via_proxy) = self.active_client();
        debug!(url, resume_from, via_proxy, "http get");

        let response = match Self::send(client, url, resume_from).await {
            Ok(response) => response,
            Err(e) if via_proxy && e.is_connect() => {
                // Requests already in flight through the proxy fall back too.
                if !self.proxy_failed.swap(true, Ordering::SeqCst) {
                    warn!("proxy connection failed ({}), falling back to direct", e);
                }
                Self::send(&self.direct, url, resume_from)
                    .await
                    .map_err(classify_send_error)?
            }
            Err(e) => return Err(classify_send_error(e)),
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let resumed = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let content_length = response.content_length();
        info!(url, status = status.as_u16(), ?content_length, resumed, "http response");

        let chunks = response
            .bytes_stream()
            .map_err(|e| TransportError::Interrupted(e.to_string()))
            .boxed();
        Ok(Body::new(content_length, resumed, chunks))
    }
}

fn base_builder(settings: &Settings) -> reqwest::ClientBuilder {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(headers)
        .connect_timeout(settings.connect_timeout())
        .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
        .tcp_nodelay(false)
}

fn build_proxy(proxy: &ProxySettings) -> Result<reqwest::Proxy, TransportError> {
    let mut built = reqwest::Proxy::all(&proxy.url)?;
    if let Some(user) = &proxy.username {
        built = built.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
    }
    Ok(built)
}

fn classify_send_error(e: reqwest::Error) -> TransportError {
    if e.is_connect() || e.is_timeout() {
        TransportError::Connect(e.to_string())
    } else if let Some(status) = e.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Client(e)
    }
}
