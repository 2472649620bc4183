// src/queue.rs

//! Bounded-concurrency download queue.
//!
//! Every structural change and every status transition happens under one
//! mutex. Workers never touch the queue directly: they send
//! [`WorkerMessage`]s to a dispatcher task, which applies them under the
//! lock and promotes the next pending entry when a worker finishes.

use crate::config::{clamp_concurrency, DuplicatePolicy};
use crate::models::{CatalogItem, EntryId, EntrySnapshot, EntryStatus};
use crate::pipeline::{Pipeline, PipelineError, ProgressSink};
use crate::transport::Transport;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("entry {0} not found")]
    NotFound(EntryId),
    #[error("entry {0} is still running, cancel it first")]
    EntryActive(EntryId),
    #[error("entry {id} cannot do that while {status:?}")]
    InvalidState { id: EntryId, status: EntryStatus },
}

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    StatusChanged {
        id: EntryId,
        status: EntryStatus,
    },
    Progress {
        id: EntryId,
        status_text: String,
        downloaded: u64,
        total: u64,
    },
    ExtractProgress {
        id: EntryId,
        entry: Option<String>,
        extracted: u64,
        total: u64,
    },
    Removed {
        id: EntryId,
    },
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct QueueEntry {
    id: EntryId,
    item: Arc<CatalogItem>,
    status: EntryStatus,
    downloaded: u64,
    total: u64,
    speed: u64,
    status_text: String,
    error_message: String,
    started: Option<Instant>,
    /// Bumped for every worker started, so late messages from an old one are dropped.
    generation: u64,
    worker: Option<Worker>,
}

impl QueueEntry {
    fn new(id: EntryId, item: Arc<CatalogItem>) -> Self {
        Self {
            id,
            item,
            status: EntryStatus::Pending,
            downloaded: 0,
            total: 0,
            speed: 0,
            status_text: "Pending...".to_string(),
            error_message: String::new(),
            started: None,
            generation: 0,
            worker: None,
        }
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id,
            item_id: self.item.id.clone(),
            name: self.item.name.clone(),
            status: self.status,
            downloaded: self.downloaded,
            total: self.total,
            speed: self.speed,
            status_text: self.status_text.clone(),
            error_message: self.error_message.clone(),
        }
    }

    fn record_progress(&mut self, status_text: &str, downloaded: u64, total: u64) {
        if total > 0 {
            self.total = total;
        }
        self.downloaded = self.downloaded.max(downloaded);
        if self.total > 0 {
            self.downloaded = self.downloaded.min(self.total);
        }
        if let Some(started) = self.started {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms > 0 && self.downloaded > 0 {
                self.speed = self.downloaded * 1000 / elapsed_ms;
            }
        }
        if !status_text.is_empty() {
            self.status_text = status_text.to_string();
        }
    }

    fn reset_counters(&mut self) {
        self.downloaded = 0;
        self.total = 0;
        self.speed = 0;
        self.error_message.clear();
    }
}

struct QueueState {
    entries: BTreeMap<EntryId, QueueEntry>,
    active_count: usize,
    max_concurrent: usize,
}

impl QueueState {
    fn counted_active(&self) -> usize {
        self.entries.values().filter(|e| e.status.is_active()).count()
    }

    fn next_pending(&self) -> Option<EntryId> {
        self.entries
            .values()
            .find(|e| e.status == EntryStatus::Pending)
            .map(|e| e.id)
    }
}

enum WorkerEvent {
    Progress {
        status_text: String,
        downloaded: u64,
        total: u64,
    },
    Extracting,
    ExtractProgress {
        entry: Option<String>,
        extracted: u64,
        total: u64,
    },
    Finished(Result<PathBuf, PipelineError>),
}

struct WorkerMessage {
    id: EntryId,
    generation: u64,
    event: WorkerEvent,
}

/// Forwards pipeline callbacks of one worker to the dispatcher.
struct EntryReporter {
    id: EntryId,
    generation: u64,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl EntryReporter {
    fn send(&self, event: WorkerEvent) {
        // The receiver only goes away together with the queue.
        let _ = self.tx.send(WorkerMessage {
            id: self.id,
            generation: self.generation,
            event,
        });
    }
}

impl ProgressSink for EntryReporter {
    fn on_progress(&self, status_text: &str, downloaded: u64, total: u64) {
        self.send(WorkerEvent::Progress {
            status_text: status_text.to_string(),
            downloaded,
            total,
        });
    }

    fn on_extract_progress(&self, entry: Option<&str>, extracted: u64, total: u64) {
        self.send(WorkerEvent::ExtractProgress {
            entry: entry.map(str::to_string),
            extracted,
            total,
        });
    }

    fn on_extracting(&self) {
        self.send(WorkerEvent::Extracting);
    }
}

struct Shared<T> {
    state: Mutex<QueueState>,
    pipeline: Pipeline<T>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    events: broadcast::Sender<QueueEvent>,
    next_id: AtomicU64,
    duplicate_policy: DuplicatePolicy,
}

impl<T: Transport> Shared<T> {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, entry: &QueueEntry) {
        self.emit(QueueEvent::StatusChanged {
            id: entry.id,
            status: entry.status,
        });
    }

    /// Fills free worker slots with pending entries, oldest first.
    fn promote(&self, state: &mut QueueState) {
        while state.active_count < state.max_concurrent {
            match state.next_pending() {
                Some(id) => self.start_worker(state, id, "Starting..."),
                None => break,
            }
        }
    }

    fn start_worker(&self, state: &mut QueueState, id: EntryId, status_text: &str) {
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };

        entry.generation += 1;
        entry.status = EntryStatus::Downloading;
        entry.status_text = status_text.to_string();
        entry.started = Some(Instant::now());

        let cancel = CancellationToken::new();
        let reporter = Arc::new(EntryReporter {
            id,
            generation: entry.generation,
            tx: self.worker_tx.clone(),
        });
        let pipeline = self.pipeline.clone();
        let item = entry.item.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let sink: Arc<dyn ProgressSink> = reporter.clone();
            let result = AssertUnwindSafe(pipeline.run(&item, &token, sink))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(PipelineError::Worker(panic_message(panic.as_ref()))));
            reporter.send(WorkerEvent::Finished(result));
        });

        entry.worker = Some(Worker { cancel, handle });
        info!(entry = %id, item = %entry.item.name, "worker started");
        self.emit_status(entry);

        state.active_count += 1;
        debug_assert_eq!(state.active_count, state.counted_active());
    }

    async fn apply(&self, message: WorkerMessage) {
        let mut state = self.state.lock().await;
        let WorkerMessage {
            id,
            generation,
            event,
        } = message;

        let Some(entry) = state.entries.get_mut(&id) else {
            debug!(entry = %id, "message for a removed entry");
            return;
        };
        if entry.generation != generation || !entry.status.is_active() {
            debug!(entry = %id, generation, "stale worker message");
            return;
        }

        match event {
            WorkerEvent::Progress {
                status_text,
                downloaded,
                total,
            } => {
                entry.record_progress(&status_text, downloaded, total);
                self.emit(QueueEvent::Progress {
                    id,
                    status_text: entry.status_text.clone(),
                    downloaded: entry.downloaded,
                    total: entry.total,
                });
            }
            WorkerEvent::Extracting => {
                entry.status = EntryStatus::Extracting;
                entry.status_text = "Extracting...".to_string();
                self.emit_status(entry);
            }
            WorkerEvent::ExtractProgress {
                entry: name,
                extracted,
                total,
            } => {
                if let Some(name) = &name {
                    entry.status_text = name.clone();
                }
                self.emit(QueueEvent::ExtractProgress {
                    id,
                    entry: name,
                    extracted,
                    total,
                });
            }
            WorkerEvent::Finished(result) => {
                let cancel_requested = entry
                    .worker
                    .take()
                    .map(|w| w.cancel.is_cancelled())
                    .unwrap_or(false);
                finish_entry(entry, result, cancel_requested);
                self.emit_status(entry);

                state.active_count -= 1;
                self.promote(&mut state);
                debug_assert_eq!(state.active_count, state.counted_active());
            }
        }
    }
}

fn finish_entry(
    entry: &mut QueueEntry,
    result: Result<PathBuf, PipelineError>,
    cancel_requested: bool,
) {
    entry.speed = 0;
    match result {
        Ok(path) => {
            entry.status = EntryStatus::Completed;
            if entry.total > 0 {
                entry.downloaded = entry.total;
            } else {
                entry.total = entry.downloaded;
            }
            entry.status_text = "Completed".to_string();
            info!(entry = %entry.id, dest = %path.display(), "entry completed");
        }
        Err(PipelineError::Cancelled) => {
            entry.status = EntryStatus::Cancelled;
            entry.status_text = "Cancelled".to_string();
            info!(entry = %entry.id, "entry cancelled");
        }
        Err(e) if cancel_requested => {
            entry.status = EntryStatus::Cancelled;
            entry.status_text = "Cancelled".to_string();
            debug!(entry = %entry.id, "failed after cancellation: {}", e);
        }
        Err(e) => {
            entry.status = EntryStatus::Failed;
            entry.status_text = "Failed".to_string();
            entry.error_message = e.to_string();
            warn!(entry = %entry.id, kind = ?e.kind(), "entry failed: {}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker panicked".to_string()
    }
}

async fn dispatch<T: Transport>(
    shared: Weak<Shared<T>>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply(message).await;
    }
}

/// Owns the entries and the workers that download them.
pub struct DownloadQueue<T: Transport> {
    shared: Arc<Shared<T>>,
    dispatcher: JoinHandle<()>,
}

impl<T: Transport> DownloadQueue<T> {
    /// Creates an empty queue. Must be called from within a tokio runtime.
    pub fn new(pipeline: Pipeline<T>) -> Self {
        let settings = pipeline.settings();
        let max_concurrent = clamp_concurrency(settings.max_concurrent);
        let duplicate_policy = settings.duplicate_policy;

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                active_count: 0,
                max_concurrent,
            }),
            pipeline,
            worker_tx,
            events,
            next_id: AtomicU64::new(1),
            duplicate_policy,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&shared), worker_rx));

        Self { shared, dispatcher }
    }

    /// Adds a job for `item` and starts it right away if a slot is free.
    ///
    /// With [`DuplicatePolicy::ReuseActive`] an item that already has a
    /// pending or running entry gets that entry's id back instead.
    pub async fn enqueue(&self, item: Arc<CatalogItem>) -> EntryId {
        let mut state = self.shared.state.lock().await;

        if self.shared.duplicate_policy == DuplicatePolicy::ReuseActive {
            let existing = state
                .entries
                .values()
                .find(|e| e.item.id == item.id && !e.status.is_terminal());
            if let Some(existing) = existing {
                debug!(entry = %existing.id, item = %item.id, "item already queued");
                return existing.id;
            }
        }

        let id = EntryId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        info!(entry = %id, item = %item.name, "queued");
        let entry = QueueEntry::new(id, item);
        self.shared.emit_status(&entry);
        state.entries.insert(id, entry);

        self.shared.promote(&mut state);
        id
    }

    /// Stops an entry. Running entries turn `Cancelled` once their worker
    /// has observed the request and cleaned up; pending ones immediately.
    pub async fn cancel(&self, id: EntryId) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        match entry.status {
            EntryStatus::Pending => {
                entry.status = EntryStatus::Cancelled;
                entry.status_text = "Cancelled".to_string();
                info!(entry = %id, "pending entry cancelled");
                self.shared.emit_status(entry);
            }
            EntryStatus::Downloading | EntryStatus::Extracting => {
                if let Some(worker) = &entry.worker {
                    worker.cancel.cancel();
                }
                entry.status_text = "Cancelling...".to_string();
                debug!(entry = %id, "cancellation requested");
            }
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Cancelled => {}
        }
        Ok(())
    }

    /// Restarts a failed or cancelled entry from scratch.
    pub async fn retry(&self, id: EntryId) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if !matches!(entry.status, EntryStatus::Failed | EntryStatus::Cancelled) {
            return Err(QueueError::InvalidState {
                id,
                status: entry.status,
            });
        }

        entry.reset_counters();
        entry.status = EntryStatus::Pending;
        entry.status_text = "Retrying...".to_string();
        info!(entry = %id, "retrying");

        if state.active_count < state.max_concurrent {
            self.shared.start_worker(&mut state, id, "Retrying...");
        } else if let Some(entry) = state.entries.get(&id) {
            self.shared.emit_status(entry);
        }
        Ok(())
    }

    /// Drops an entry that is not running. Unknown ids yield `Ok(false)`.
    pub async fn remove(&self, id: EntryId) -> Result<bool, QueueError> {
        let mut state = self.shared.state.lock().await;
        match state.entries.get(&id) {
            None => return Ok(false),
            Some(entry) if entry.status.is_active() => return Err(QueueError::EntryActive(id)),
            Some(_) => {}
        }
        state.entries.remove(&id);
        debug!(entry = %id, "removed");
        self.shared.emit(QueueEvent::Removed { id });
        Ok(true)
    }

    /// All entries in submission order.
    pub async fn snapshot(&self) -> Vec<EntrySnapshot> {
        let state = self.shared.state.lock().await;
        state.entries.values().map(QueueEntry::snapshot).collect()
    }

    pub async fn get(&self, id: EntryId) -> Option<EntrySnapshot> {
        let state = self.shared.state.lock().await;
        state.entries.get(&id).map(QueueEntry::snapshot)
    }

    pub async fn count(&self) -> usize {
        self.shared.state.lock().await.entries.len()
    }

    pub async fn active_count(&self) -> usize {
        self.shared.state.lock().await.active_count
    }

    pub async fn max_concurrent(&self) -> usize {
        self.shared.state.lock().await.max_concurrent
    }

    /// Changes the worker limit (clamped to 1..=4). Running workers are never
    /// stopped by a lower limit; new ones start if it went up.
    pub async fn set_max_concurrent(&self, limit: usize) {
        let mut state = self.shared.state.lock().await;
        state.max_concurrent = clamp_concurrency(limit);
        info!(max_concurrent = state.max_concurrent, "concurrency changed");
        self.shared.promote(&mut state);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn pipeline(&self) -> &Pipeline<T> {
        &self.shared.pipeline
    }

    /// Cancels every worker, waits for them to clean up, then empties the queue.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = {
            let mut state = self.shared.state.lock().await;
            let workers: Vec<Worker> = state
                .entries
                .values_mut()
                .filter_map(|e| e.worker.take())
                .collect();
            for worker in &workers {
                worker.cancel.cancel();
            }
            state.entries.clear();
            state.active_count = 0;
            workers
        };

        info!(workers = workers.len(), "shutting down queue");
        for worker in workers {
            if let Err(e) = worker.handle.await {
                warn!("worker ended abnormally: {}", e);
            }
        }
    }
}

impl<T: Transport> Drop for DownloadQueue<T> {
    fn drop(&mut self) {
        if let Ok(state) = self.shared.state.try_lock() {
            for worker in state.entries.values().filter_map(|e| e.worker.as_ref()) {
                worker.cancel.cancel();
            }
        }
        self.dispatcher.abort();
    }
}
