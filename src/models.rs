// src/models.rs

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Whether a catalog item's content already exists at its destination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Presence {
    #[default]
    Unknown,
    Installed,
    Missing,
}

impl Presence {
    fn to_u8(self) -> u8 {
        match self {
            Presence::Unknown => 0,
            Presence::Installed => 1,
            Presence::Missing => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Presence::Installed,
            2 => Presence::Missing,
            _ => Presence::Unknown,
        }
    }
}

/// Presence flag that can be flipped through a shared `Arc<CatalogItem>`.
#[derive(Debug, Default)]
pub struct PresenceCell(AtomicU8);

impl PresenceCell {
    pub fn get(&self) -> Presence {
        Presence::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, presence: Presence) {
        self.0.store(presence.to_u8(), Ordering::Release);
    }
}

impl Clone for PresenceCell {
    fn clone(&self) -> Self {
        let cell = PresenceCell::default();
        cell.set(self.get());
        cell
    }
}

/// A downloadable entry supplied by the catalog layer.
///
/// The core never mutates anything but the presence flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Selects the destination directory, see [`crate::config::Settings::destination_for`].
    pub category: String,
    /// Expected size in bytes as advertised by the catalog. Advisory only.
    #[serde(default)]
    pub size: u64,
    /// Optional lowercase hex SHA-256 of the downloaded payload.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(skip)]
    presence: PresenceCell,
}

impl CatalogItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        category: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            category: category.into(),
            size,
            sha256: None,
            presence: PresenceCell::default(),
        }
    }

    pub fn with_sha256(mut self, checksum: impl Into<String>) -> Self {
        self.sha256 = Some(checksum.into());
        self
    }

    pub fn presence(&self) -> Presence {
        self.presence.get()
    }

    pub fn set_presence(&self, presence: Presence) {
        self.presence.set(presence);
    }
}

/// Stable identifier of a queue entry. Ids grow with submission order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The status of a queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Downloading,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl EntryStatus {
    /// True while a worker owns the entry.
    pub fn is_active(self) -> bool {
        matches!(self, EntryStatus::Downloading | EntryStatus::Extracting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Cancelled
        )
    }
}

/// Read-only view of one queue entry, as handed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub item_id: String,
    pub name: String,
    pub status: EntryStatus,
    pub downloaded: u64,
    pub total: u64,
    /// Bytes per second since the worker started.
    pub speed: u64,
    pub status_text: String,
    pub error_message: String,
}

impl EntrySnapshot {
    /// Progress in percent, or `-1` while the total size is unknown.
    pub fn percent(&self) -> i32 {
        if self.total == 0 {
            -1
        } else {
            (self.downloaded.min(self.total) * 100 / self.total) as i32
        }
    }
}
