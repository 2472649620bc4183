#![allow(dead_code)]

use bytes::Bytes;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use futures_util::stream::{self, StreamExt};
use odm_catalog::config::Settings;
use odm_catalog::models::{CatalogItem, EntryId, EntrySnapshot, EntryStatus};
use odm_catalog::pipeline::{Pipeline, ProgressSink, SpaceProbe};
use odm_catalog::queue::DownloadQueue;
use odm_catalog::transport::{Body, Transport, TransportError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const CHUNK: usize = 4096;

/// Lets a test decide when a gated body delivers its remaining bytes.
#[derive(Clone)]
pub struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Gate(Arc::new(tx))
    }

    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone)]
pub enum MockResponse {
    Body {
        data: Vec<u8>,
        content_length: Option<u64>,
        resumed: bool,
    },
    /// Delivers `data` and then breaks the stream.
    Interrupted {
        data: Vec<u8>,
        content_length: Option<u64>,
    },
    /// Delivers `data[..head]` right away and the rest once the gate opens.
    Gated {
        data: Vec<u8>,
        head: usize,
        gate: Gate,
    },
    Refused,
    Status(u16),
    /// Panics inside `open`, as a bug in the transport would.
    Panic(&'static str),
}

impl MockResponse {
    pub fn ok(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        MockResponse::Body {
            content_length: Some(data.len() as u64),
            data,
            resumed: false,
        }
    }

    pub fn gated(data: impl Into<Vec<u8>>, head: usize, gate: &Gate) -> Self {
        MockResponse::Gated {
            data: data.into(),
            head,
            gate: gate.clone(),
        }
    }

    fn into_body(self) -> Result<Body, TransportError> {
        match self {
            MockResponse::Body {
                data,
                content_length,
                resumed,
            } => Ok(Body::new(content_length, resumed, chunked(data).boxed())),
            MockResponse::Interrupted {
                data,
                content_length,
            } => {
                let broken = stream::once(async {
                    Err(TransportError::Interrupted("connection reset".into()))
                });
                Ok(Body::new(content_length, false, chunked(data).chain(broken).boxed()))
            }
            MockResponse::Gated { data, head, gate } => {
                let len = data.len() as u64;
                let first = Bytes::from(data[..head].to_vec());
                let rest = Bytes::from(data[head..].to_vec());
                let mut rx = gate.0.subscribe();
                let head = stream::once(async move { Ok::<_, TransportError>(first) });
                let tail = stream::once(async move {
                    let _ = rx.wait_for(|open| *open).await.is_ok();
                    Ok::<_, TransportError>(rest)
                });
                Ok(Body::new(Some(len), false, head.chain(tail).boxed()))
            }
            MockResponse::Refused => Err(TransportError::Connect("connection refused".into())),
            MockResponse::Status(code) => Err(TransportError::Status(code)),
            MockResponse::Panic(message) => panic!("{}", message),
        }
    }
}

fn chunked(data: Vec<u8>) -> impl futures_util::Stream<Item = Result<Bytes, TransportError>> {
    let chunks: Vec<Result<Bytes, TransportError>> = data
        .chunks(CHUNK)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}

/// Scripted transport. Each URL answers with its queued responses in
/// order; the last one keeps answering once the others are used up.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    opens: Mutex<Vec<(String, u64)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, response: MockResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// Every `(url, resume_from)` pair `open` was called with.
    pub fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn opened(&self, url: &str) -> bool {
        self.opens().iter().any(|(u, _)| u == url)
    }
}

impl Transport for MockTransport {
    async fn open(&self, url: &str, resume_from: u64) -> Result<Body, TransportError> {
        self.opens
            .lock()
            .unwrap()
            .push((url.to_string(), resume_from));
        let response = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match response {
            Some(response) => response.into_body(),
            None => Err(TransportError::Connect(format!("no route to {}", url))),
        }
    }
}

/// Reports a fixed amount of free space.
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available(&self, _: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub progress: Mutex<Vec<(String, u64, u64)>>,
    pub extract: Mutex<Vec<(Option<String>, u64, u64)>>,
    pub extracting: Mutex<bool>,
}

impl RecordingSink {
    pub fn last_progress(&self) -> Option<(String, u64, u64)> {
        self.progress.lock().unwrap().last().cloned()
    }

    pub fn max_downloaded(&self) -> u64 {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d, _)| *d)
            .max()
            .unwrap_or(0)
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, status_text: &str, downloaded: u64, total: u64) {
        self.progress
            .lock()
            .unwrap()
            .push((status_text.to_string(), downloaded, total));
    }

    fn on_extract_progress(&self, entry: Option<&str>, extracted: u64, total: u64) {
        self.extract
            .lock()
            .unwrap()
            .push((entry.map(str::to_string), extracted, total));
    }

    fn on_extracting(&self) {
        *self.extracting.lock().unwrap() = true;
    }
}

/// Settings rooted in a scratch directory with unthrottled progress.
pub fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::with_root(root.join("install"), root.join("tmp"));
    settings.progress_interval_ms = 0;
    settings
}

/// Every regular file below `dir`, or nothing if `dir` does not exist.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(next) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&next) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}

pub fn item(id: &str, url: &str) -> Arc<CatalogItem> {
    Arc::new(CatalogItem::new(id, id, url, "nes", 0))
}

pub fn pipeline(transport: Arc<MockTransport>, settings: Settings) -> Pipeline<MockTransport> {
    Pipeline::new(transport, Arc::new(settings)).with_space_probe(Arc::new(FixedSpace(u64::MAX)))
}

pub fn queue(transport: Arc<MockTransport>, settings: Settings) -> DownloadQueue<MockTransport> {
    DownloadQueue::new(pipeline(transport, settings))
}

/// Polls `check` until it holds, failing the test after ten seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}

pub async fn wait_for_status(
    queue: &DownloadQueue<MockTransport>,
    id: EntryId,
    status: EntryStatus,
) -> EntrySnapshot {
    wait_until(move || async move { queue.get(id).await.map(|e| e.status) == Some(status) }).await;
    queue.get(id).await.unwrap()
}

pub async fn wait_for_downloaded(queue: &DownloadQueue<MockTransport>, id: EntryId, bytes: u64) {
    wait_until(move || async move { queue.get(id).await.map(|e| e.downloaded) == Some(bytes) }).await;
}

/// Checks the queue-wide invariants on a quiescent queue.
pub async fn assert_invariants(queue: &DownloadQueue<MockTransport>) {
    let entries = queue.snapshot().await;
    let active = entries.iter().filter(|e| e.status.is_active()).count();
    assert_eq!(queue.active_count().await, active);
    assert!(active <= queue.max_concurrent().await);
    for entry in &entries {
        if entry.total > 0 {
            assert!(entry.downloaded <= entry.total, "{:?}", entry);
        }
    }
}

/// Builds ZIP archives entry by entry.
#[derive(Default)]
pub struct ZipBuilder {
    buf: Vec<u8>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.raw(name, 0, crc(data), data, data.len() as u32)
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();
        self.raw(name, 8, crc(data), &compressed, data.len() as u32)
    }

    pub fn dir(self, name: &str) -> Self {
        self.raw(name, 0, 0, &[], 0)
    }

    /// Appends a local header followed by `payload` exactly as given.
    pub fn raw(mut self, name: &str, method: u16, crc32: u32, payload: &[u8], size: u32) -> Self {
        let buf = &mut self.buf;
        buf.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        buf.extend_from_slice(&20u16.to_le_bytes()); // version needed
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(&method.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // mod time
        buf.extend_from_slice(&0u16.to_le_bytes()); // mod date
        buf.extend_from_slice(&crc32.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // extra len
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(payload);
        self
    }

    /// Terminates with a central directory stub and the end record.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        self.buf.extend_from_slice(&[0u8; 42]);
        self.buf.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        self.buf.extend_from_slice(&[0u8; 18]);
        self.buf
    }
}

pub fn crc(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}
