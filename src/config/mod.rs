//! Configuration for the address index

mod import;
mod logging;
mod store;

pub use import::{CatalogConfig, ImportConfig};
pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
pub use store::StoreConfig;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Import pipeline configuration
    #[serde(default)]
    pub import: ImportConfig,
    /// Version catalog configuration
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config = Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration fields, reporting every error at once
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Import validation
        if self.import.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.import.workers == 0 {
            errors.push("workers must be positive".to_string());
        }
        if self.import.channel_capacity == 0 {
            errors.push("channel_capacity must be positive".to_string());
        }
        if self.import.cache_capacity == 0 {
            errors.push("cache_capacity must be positive".to_string());
        }

        // Catalog validation
        if self.catalog.base_url.trim().is_empty() {
            errors.push("catalog base_url must not be empty".to_string());
        }
        if self.catalog.timeout_secs == 0 {
            errors.push("catalog timeout_secs must be positive".to_string());
        }

        // Store validation
        if self.store.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // ========================================================================
    // Config::validate
    // ========================================================================

    #[test]
    fn default_config_passes_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let mut cfg = Config::default();
        cfg.import.batch_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size must be positive"));
    }

    #[test]
    fn validate_rejects_empty_data_dir() {
        let mut cfg = Config::default();
        cfg.store.data_dir = PathBuf::from("");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("data_dir must not be empty"));
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let mut cfg = Config::default();
        cfg.import.workers = 0;
        cfg.import.cache_capacity = 0;
        cfg.catalog.timeout_secs = 0;
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("workers must be positive"));
        assert!(msg.contains("cache_capacity must be positive"));
        assert!(msg.contains("catalog timeout_secs must be positive"));
    }

    // ========================================================================
    // Loading
    // ========================================================================

    #[test]
    fn parse_partial_file_keeps_defaults() {
        let cfg = Config::parse(
            r#"
            [import]
            batch_size = 250
            force_full = true

            [logging]
            format = "json"
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.import.batch_size, 250);
        assert!(cfg.import.force_full);
        assert_eq!(cfg.import.workers, 5);
        assert_eq!(cfg.import.channel_capacity, 10_000);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, LogLevel::Debug);
        assert_eq!(cfg.catalog.timeout_secs, 30);
    }

    #[test]
    fn parse_rejects_invalid_values() {
        let err = Config::parse("[import]\nworkers = 0\n").unwrap_err();
        assert!(err.to_string().contains("workers must be positive"));
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fias.toml");
        std::fs::write(&path, "[store]\ndata_dir = \"/var/lib/fias\"\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.store.data_dir, PathBuf::from("/var/lib/fias"));
        assert!(Config::load(&tmp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn default_import_config_values() {
        let import = ImportConfig::default();
        assert_eq!(import.batch_size, 1000);
        assert_eq!(import.workers, 5);
        assert_eq!(import.cache_capacity, 100_000);
        assert!(!import.force_full);
        assert!(import.quiet);
    }
}
