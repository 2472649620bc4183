// src/pipeline.rs

use crate::config::Settings;
use crate::extract::{self, ExtractError};
use crate::integrity::{self, IntegrityError};
use crate::models::{CatalogItem, Presence};
use crate::transport::{Body, Transport, TransportError};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Numbers the scratch directory of every job started by this process.
static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

/// Custom errors for one download job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Connect(#[source] TransportError),
    #[error("{0}")]
    Transfer(#[source] TransportError),
    #[error("not enough free space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("disk error: {0}")]
    Disk(#[from] io::Error),
    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("extraction failed: {0}")]
    Extract(#[source] ExtractError),
    #[error("download cancelled")]
    Cancelled,
    #[error("worker crashed: {0}")]
    Worker(String),
}

/// Coarse failure classes shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connect,
    Transfer,
    Disk,
    Format,
    Memory,
    Integrity,
    Cancelled,
    Internal,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidUrl(_) | PipelineError::Connect(_) => ErrorKind::Connect,
            PipelineError::Transfer(_) => ErrorKind::Transfer,
            PipelineError::InsufficientSpace { .. } | PipelineError::Disk(_) => ErrorKind::Disk,
            PipelineError::Integrity(IntegrityError::Io(_)) => ErrorKind::Disk,
            PipelineError::Integrity(IntegrityError::Mismatch { .. }) => ErrorKind::Integrity,
            PipelineError::Extract(e) => match e {
                ExtractError::Open(_) | ExtractError::Read(_) | ExtractError::Write { .. } => {
                    ErrorKind::Disk
                }
                ExtractError::Format(_) | ExtractError::Decompress { .. } => ErrorKind::Format,
                ExtractError::Memory => ErrorKind::Memory,
                ExtractError::Cancelled => ErrorKind::Cancelled,
            },
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Worker(_) => ErrorKind::Internal,
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Extract(other),
        }
    }
}

/// Receives progress from a running job. Called from worker context.
pub trait ProgressSink: Send + Sync {
    /// `total == 0` means the size is not known.
    fn on_progress(&self, status_text: &str, downloaded: u64, total: u64);

    fn on_extract_progress(&self, entry: Option<&str>, extracted: u64, total: u64);

    /// The payload finished downloading and is about to be unpacked.
    fn on_extracting(&self) {}
}

/// Sink that drops every notification.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _: &str, _: u64, _: u64) {}
    fn on_extract_progress(&self, _: Option<&str>, _: u64, _: u64) {}
}

/// Reports free bytes on the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the real filesystem.
pub struct DiskSpace;

impl SpaceProbe for DiskSpace {
    fn available(&self, path: &Path) -> io::Result<u64> {
        let mut probe = path.to_path_buf();
        while !probe.exists() {
            if !probe.pop() {
                probe = PathBuf::from(".");
                break;
            }
        }
        fs2::available_space(&probe)
    }
}

/// Runs one catalog item through connect, stream, verify, extract or move.
pub struct Pipeline<T> {
    transport: Arc<T>,
    settings: Arc<Settings>,
    space: Arc<dyn SpaceProbe>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            space: self.space.clone(),
        }
    }
}

impl<T: Transport> Pipeline<T> {
    pub fn new(transport: Arc<T>, settings: Arc<Settings>) -> Self {
        Self {
            transport,
            settings,
            space: Arc::new(DiskSpace),
        }
    }

    pub fn with_space_probe(mut self, space: Arc<dyn SpaceProbe>) -> Self {
        self.space = space;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Downloads `item` and places it at its destination.
    ///
    /// Returns the installed file, or the destination folder for archives.
    /// Each run streams into its own scratch directory under `temp_dir`, so
    /// concurrent jobs with the same file name never share a temp file. The
    /// scratch directory is gone afterwards whatever the outcome.
    pub async fn run(
        &self,
        item: &CatalogItem,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PathBuf, PipelineError> {
        let url = resolve_url(item, &self.settings)?;
        let filename = filename_from_url(&url)?;
        let job_dir = self.job_dir();
        let temp_path = job_dir.join(&filename);

        info!(item = %item.name, %url, temp = %temp_path.display(), "downloading");
        sink.on_progress("Connecting...", 0, 0);

        let result = self
            .fetch_and_place(item, &url, &filename, &temp_path, cancel, &sink)
            .await;

        match &result {
            Ok(path) => {
                item.set_presence(Presence::Unknown);
                info!(item = %item.name, dest = %path.display(), "download complete");
            }
            Err(PipelineError::Cancelled) => info!(item = %item.name, "download cancelled"),
            Err(e) => warn!(item = %item.name, "download failed: {}", e),
        }
        remove_dir_if_present(&job_dir).await;
        result
    }

    fn job_dir(&self) -> PathBuf {
        let job = NEXT_JOB.fetch_add(1, Ordering::Relaxed);
        self.settings
            .temp_dir
            .join(format!("job-{}-{}", std::process::id(), job))
    }

    async fn fetch_and_place(
        &self,
        item: &CatalogItem,
        url: &str,
        filename: &str,
        temp_path: &Path,
        cancel: &CancellationToken,
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<PathBuf, PipelineError> {
        let total = self.download(url, temp_path, cancel, sink.as_ref()).await?;
        debug!(temp = %temp_path.display(), bytes = total, "stream finished");

        if let Some(expected) = item.sha256.as_deref() {
            integrity::verify_sha256(temp_path, expected).await?;
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let dest_dir = self.settings.destination_for(item);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let placed = if extract::is_archive(temp_path) {
            sink.on_extracting();
            sink.on_progress("Extracting...", total, total);
            let result = extract_blocking(temp_path, &dest_dir, cancel, sink.clone()).await;
            remove_if_present(temp_path).await;
            result?;
            dest_dir
        } else {
            let dest = dest_dir.join(filename);
            debug!(from = %temp_path.display(), to = %dest.display(), "moving");
            move_file(temp_path, &dest).await?;
            dest
        };

        sink.on_progress("Complete!", total, total);
        Ok(placed)
    }

    /// Streams the body into `temp_path`, resuming after interruptions.
    /// Returns the final size of the temporary file.
    async fn download(
        &self,
        url: &str,
        temp_path: &Path,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<u64, PipelineError> {
        let mut body = self.open(url, 0, cancel).await?;
        let mut total = body.content_length().unwrap_or(0);
        if total > 0 {
            self.ensure_space(total)?;
        }

        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(temp_path).await?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut written: u64 = 0;
        let mut retries_left = self.settings.transfer_retries;
        let mut throttle = Throttle::new(self.settings.progress_interval());

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                chunk = body.chunk() => chunk,
            };
            let next = match next {
                None if total > 0 && written < total => Some(Err(TransportError::Interrupted(
                    format!("body ended after {} of {} bytes", written, total),
                ))),
                other => other,
            };

            match next {
                Some(Ok(bytes)) => {
                    out.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                    throttle.report(sink, written, total, false);
                }
                Some(Err(e)) if e.is_interrupted() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(url, written, "{}; resuming", e);
                    out.flush().await?;
                    body = self.open(url, written, cancel).await?;
                    if !body.resumed() && written > 0 {
                        debug!(url, "server ignored the range request, starting over");
                        let file = out.get_mut();
                        file.set_len(0).await?;
                        file.seek(SeekFrom::Start(0)).await?;
                        written = 0;
                    }
                    if let Some(len) = body.content_length() {
                        total = written + len;
                    }
                }
                Some(Err(e)) => return Err(PipelineError::Transfer(e)),
                None => break,
            }
        }

        out.flush().await?;
        throttle.report(sink, written, total, true);
        Ok(written.max(total))
    }

    async fn open(
        &self,
        url: &str,
        resume_from: u64,
        cancel: &CancellationToken,
    ) -> Result<Body, PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            opened = self.transport.open(url, resume_from) => opened.map_err(PipelineError::Connect),
        }
    }

    fn ensure_space(&self, content_length: u64) -> Result<(), PipelineError> {
        let required = content_length.saturating_mul(self.settings.free_space_factor);
        match self.space.available(&self.settings.temp_dir) {
            Ok(available) if available < required => {
                Err(PipelineError::InsufficientSpace { required, available })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("could not determine free space: {}", e);
                Ok(())
            }
        }
    }
}

async fn extract_blocking(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    sink: Arc<dyn ProgressSink>,
) -> Result<(), PipelineError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let token = cancel.clone();

    let joined = tokio::task::spawn_blocking(move || {
        extract::extract_zip(&archive, &dest, &token, &mut |entry, done, total| {
            sink.on_extract_progress(entry, done, total)
        })
    })
    .await;

    match joined {
        Ok(Ok(summary)) => {
            debug!(entries = summary.entries, bytes = summary.bytes, "archive extracted");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(join_err) => Err(PipelineError::Worker(join_err.to_string())),
    }
}

/// Rate-limits progress callbacks and derives the speed text.
struct Throttle {
    interval: Duration,
    started: Instant,
    last: Option<Instant>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            last: None,
        }
    }

    fn report(&mut self, sink: &dyn ProgressSink, downloaded: u64, total: u64, force: bool) {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last {
                if now.duration_since(last) < self.interval {
                    return;
                }
            }
        }
        self.last = Some(now);

        let elapsed_ms = now.duration_since(self.started).as_millis() as u64;
        let text = if elapsed_ms > 0 && downloaded > 0 {
            format_speed(downloaded * 1000 / elapsed_ms)
        } else {
            "Downloading...".to_string()
        };
        let shown = if total > 0 { downloaded.min(total) } else { downloaded };
        sink.on_progress(&text, shown, total);
    }
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec > 1024 * 1024 {
        format!("{:.1} MB/s", bytes_per_sec as f64 / (1024.0 * 1024.0))
    } else if bytes_per_sec > 1024 {
        format!("{} KB/s", bytes_per_sec / 1024)
    } else {
        format!("{} B/s", bytes_per_sec)
    }
}

/// Absolute URLs pass through; relative ones are joined onto the category's base URL.
pub fn resolve_url(item: &CatalogItem, settings: &Settings) -> Result<String, PipelineError> {
    let raw = item.url.trim();
    if raw.is_empty() {
        return Err(PipelineError::InvalidUrl(format!("{} has no url", item.name)));
    }
    if has_http_scheme(raw) {
        return Ok(raw.to_string());
    }

    let base = settings.base_url(&item.category).ok_or_else(|| {
        PipelineError::InvalidUrl(format!(
            "relative url {} and no base url for category {}",
            raw, item.category
        ))
    })?;
    let base = reqwest::Url::parse(base)
        .map_err(|e| PipelineError::InvalidUrl(format!("{}: {}", base, e)))?;
    base.join(raw)
        .map(String::from)
        .map_err(|e| PipelineError::InvalidUrl(format!("{}: {}", raw, e)))
}

fn has_http_scheme(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .unwrap_or(false)
    })
}

/// Last path segment of `url`, percent-decoded and safe to use as a file name.
pub fn filename_from_url(url: &str) -> Result<String, PipelineError> {
    let path = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
    let raw = path.rsplit('/').next().unwrap_or(path);
    let decoded = urlencoding::decode(raw)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let name: String = decoded
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    if name.is_empty() || name == "." || name == ".." {
        return Err(PipelineError::InvalidUrl(format!("no file name in {}", url)));
    }
    Ok(name)
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename failed ({}), copying instead", e);
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "could not remove temporary file: {}", e);
        }
    }
}

async fn remove_dir_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "could not remove scratch directory: {}", e);
        }
    }
}
