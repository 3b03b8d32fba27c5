//! Import pipeline and version catalog configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Import pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Operations per bulk request
    pub batch_size: usize,
    /// Indexer worker pool size
    pub workers: usize,
    /// Capacity of the channels between stages
    pub channel_capacity: usize,
    /// Entries kept by the parent-resolution cache
    pub cache_capacity: usize,
    /// Always run a full import, even when a delta chain exists
    pub force_full: bool,
    /// Directory holding extracted archives, `<version id>/<full|delta>`
    pub archive_dir: PathBuf,
    /// Suppress progress bars
    pub quiet: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            workers: 5,
            channel_capacity: 10_000,
            cache_capacity: 100_000,
            force_full: false,
            archive_dir: PathBuf::from("archives"),
            quiet: true,
        }
    }
}

/// Published version catalog endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL of the JSON web service
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fias.nalog.ru/WebServices/Public".to_string(),
            timeout_secs: 30,
        }
    }
}
