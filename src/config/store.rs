//! Backing store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the embedded store keeps its files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data directory for the sled database
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: directories::ProjectDirs::from("", "", "fias-index")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".fias-index")),
        }
    }
}
