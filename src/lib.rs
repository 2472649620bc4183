pub mod config;
pub mod extract;
pub mod integrity;
pub mod models;
pub mod pipeline;
pub mod presence;
pub mod queue;
pub mod transport;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{DuplicatePolicy, Settings};
    pub use crate::models::{CatalogItem, EntryId, EntrySnapshot, EntryStatus, Presence};
    pub use crate::pipeline::{format_speed, ErrorKind, Pipeline, PipelineError};
    pub use crate::presence::{check_presence, scan_all};
    pub use crate::queue::{DownloadQueue, QueueError, QueueEvent};
    pub use crate::transport::{HttpTransport, Transport};
}
