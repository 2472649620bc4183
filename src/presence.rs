// src/presence.rs

use crate::config::{sanitize_name, Settings};
use crate::models::{CatalogItem, Presence};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Looks for the item's sanitized name among the entries of its category
/// folder and records the result on the item.
///
/// A missing or unreadable folder counts as `Missing`.
pub async fn check_presence(item: &CatalogItem, settings: &Settings) -> Presence {
    let folder = settings.category_folder(&item.category);
    let needle = sanitize_name(&item.name).to_lowercase();

    let presence = match find_match(&folder, &needle).await {
        Ok(true) => Presence::Installed,
        Ok(false) => Presence::Missing,
        Err(e) => {
            debug!(folder = %folder.display(), "cannot list category folder: {}", e);
            Presence::Missing
        }
    };
    item.set_presence(presence);
    presence
}

async fn find_match(folder: &Path, needle: &str) -> std::io::Result<bool> {
    if needle.is_empty() {
        return Ok(false);
    }
    let mut dir = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if name.to_lowercase().contains(needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Checks every item, returning how many were found installed.
pub async fn scan_all(items: &[Arc<CatalogItem>], settings: &Settings) -> usize {
    let mut installed = 0;
    for item in items {
        if check_presence(item, settings).await == Presence::Installed {
            installed += 1;
        }
    }
    debug!(items = items.len(), installed, "presence scan finished");
    installed
}
