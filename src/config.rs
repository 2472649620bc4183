// src/config.rs

use crate::models::CatalogItem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling for simultaneously running workers.
pub const MAX_CONCURRENT_LIMIT: usize = 4;
pub const MAX_CONCURRENT_DEFAULT: usize = 3;

/// Scratch folder below `install_root` unless settings name another.
const TEMP_DIR_NAME: &str = ".tmp";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What `enqueue` does when the same catalog item already has a live entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Always create a new entry.
    #[default]
    Allow,
    /// Hand back the id of the pending or running entry for the same item.
    ReuseActive,
}

/// Where a category installs to and how its relative URLs resolve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategorySettings {
    /// Relative folders are taken from `Settings::install_root`.
    pub folder: PathBuf,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Install every item into its own `<folder>/<item name>` directory.
    #[serde(default)]
    pub per_item_folder: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Runtime settings for the queue, pipeline and transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent: usize,
    pub install_root: PathBuf,
    pub temp_dir: PathBuf,
    pub categories: HashMap<String, CategorySettings>,
    pub proxy: Option<ProxySettings>,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub max_redirects: usize,
    /// Resume attempts after the stream broke off mid-transfer.
    pub transfer_retries: u32,
    pub progress_interval_ms: u64,
    /// Required free space as a multiple of the advertised content length.
    pub free_space_factor: u64,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        let install_root = PathBuf::from("downloads");
        Self {
            max_concurrent: MAX_CONCURRENT_DEFAULT,
            temp_dir: install_root.join(TEMP_DIR_NAME),
            install_root,
            categories: default_categories(),
            proxy: None,
            user_agent: "Wget/1.24".to_string(),
            connect_timeout_secs: 20,
            max_redirects: 20,
            transfer_retries: 2,
            progress_interval_ms: 250,
            free_space_factor: 2,
            duplicate_policy: DuplicatePolicy::Allow,
        }
    }
}

fn default_categories() -> HashMap<String, CategorySettings> {
    let disc = [("psx", "PSXISO"), ("ps2", "PS2ISO"), ("ps3", "PS3ISO")];
    let carts = [
        ("nes", "NES"),
        ("snes", "SNES"),
        ("gb", "GB"),
        ("gbc", "GBC"),
        ("gba", "GBA"),
        ("genesis", "Genesis"),
        ("sms", "SMS"),
        ("mame", "MAME"),
    ];

    let mut categories = HashMap::new();
    for (name, folder) in disc {
        categories.insert(
            name.to_string(),
            CategorySettings {
                folder: PathBuf::from(folder),
                base_url: None,
                per_item_folder: true,
            },
        );
    }
    for (name, folder) in carts {
        categories.insert(
            name.to_string(),
            CategorySettings {
                folder: Path::new("ROMS").join(folder),
                base_url: None,
                per_item_folder: false,
            },
        );
    }
    categories
}

impl Settings {
    /// Reads settings from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let explicit_temp_dir = value.get("temp_dir").is_some();
        let mut settings: Settings = serde_json::from_value(value)?;
        if !explicit_temp_dir {
            settings.temp_dir = settings.install_root.join(TEMP_DIR_NAME);
        }
        Ok(settings.validated())
    }

    /// Settings rooted at `install_root`, with scratch files in `temp_dir`.
    pub fn with_root(install_root: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            temp_dir: temp_dir.into(),
            ..Self::default()
        }
        .validated()
    }

    /// Clamps values that would break queue invariants.
    pub fn validated(mut self) -> Self {
        self.max_concurrent = clamp_concurrency(self.max_concurrent);
        self.free_space_factor = self.free_space_factor.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn category(&self, name: &str) -> Option<&CategorySettings> {
        self.categories
            .get(name)
            .or_else(|| self.categories.get(&name.to_ascii_lowercase()))
    }

    /// Folder a category installs into, before any per-item subfolder.
    pub fn category_folder(&self, category: &str) -> PathBuf {
        match self.category(category) {
            Some(cat) => self.install_root.join(&cat.folder),
            None => self.install_root.join(category),
        }
    }

    /// Directory an item's payload is placed in (or extracted into).
    pub fn destination_for(&self, item: &CatalogItem) -> PathBuf {
        let folder = self.category_folder(&item.category);
        match self.category(&item.category) {
            Some(cat) if cat.per_item_folder => folder.join(sanitize_name(&item.name)),
            _ => folder,
        }
    }

    pub fn base_url(&self, category: &str) -> Option<&str> {
        self.category(category).and_then(|cat| cat.base_url.as_deref())
    }
}

pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, MAX_CONCURRENT_LIMIT)
}

/// Replaces characters most filesystems refuse in a file name. The result
/// is always a single path component below its parent.
pub fn sanitize_name(name: &str) -> String {
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return "_".to_string();
    }
    name.chars()
        .map(|c| match c {
            ':' | '?' | '*' | '"' | '<' | '>' | '|' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}
