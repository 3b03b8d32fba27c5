//! Published version catalog of the registry

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::source::ImportError;
use crate::config::CatalogConfig;

/// One published registry version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    pub version_id: u32,
    pub text_version: String,
    #[serde(default)]
    pub fias_complete_xml_url: String,
    #[serde(default)]
    pub fias_delta_xml_url: String,
    /// Publication date, when the catalog reports one
    #[serde(default)]
    pub date: Option<String>,
}

impl VersionInfo {
    pub fn has_delta(&self) -> bool {
        !self.fias_delta_xml_url.is_empty()
    }
}

/// Source of the published version list
#[async_trait]
pub trait VersionCatalog: Send + Sync {
    /// Newest published version
    async fn last_version(&self) -> Result<VersionInfo, ImportError>;

    /// Every published version, in any order
    async fn all_versions(&self) -> Result<Vec<VersionInfo>, ImportError>;
}

/// JSON web service client for the public catalog
pub struct HttpVersionCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVersionCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, ImportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("fias-index/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, method: &str) -> Result<T, ImportError> {
        let url = format!("{}/{}", self.base_url, method);
        debug!("Fetching version catalog: {}", url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl VersionCatalog for HttpVersionCatalog {
    async fn last_version(&self) -> Result<VersionInfo, ImportError> {
        self.fetch("GetLastDownloadFileInfo").await
    }

    async fn all_versions(&self) -> Result<Vec<VersionInfo>, ImportError> {
        self.fetch("GetAllDownloadFileInfo").await
    }
}

/// Fixed catalog, for offline runs against pre-downloaded archives
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    versions: Vec<VersionInfo>,
}

impl StaticCatalog {
    pub fn new(versions: Vec<VersionInfo>) -> Self {
        Self { versions }
    }
}

#[async_trait]
impl VersionCatalog for StaticCatalog {
    async fn last_version(&self) -> Result<VersionInfo, ImportError> {
        self.versions
            .iter()
            .max_by_key(|v| v.version_id)
            .cloned()
            .ok_or_else(|| ImportError::VersionCatalog("catalog is empty".to_string()))
    }

    async fn all_versions(&self) -> Result<Vec<VersionInfo>, ImportError> {
        Ok(self.versions.clone())
    }
}
