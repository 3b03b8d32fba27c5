//! Import pipeline for address registry dumps
//!
//! Registry versions are published as complete snapshots and as changesets
//! ("deltas"). The coordinator compares the local version with the published
//! catalog, streams the XML dumps of each needed version into the store, and
//! then rebuilds the denormalized address hierarchy.
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use fias_index::config::Config;
//! use fias_index::import::ImportCoordinator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(std::path::Path::new("fias.toml"))?;
//! let coordinator = ImportCoordinator::from_config(&config)?;
//!
//! let report = coordinator.run().await?;
//! println!("Applied versions {:?}", report.versions_applied);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Import Coordinator                          │
//! │           (catalog reconciliation, full / delta cycles)             │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                                              │
//!          ▼                                              ▼
//! ┌─────────────────┐                          ┌─────────────────────┐
//! │ VersionCatalog  │                          │   ArchiveSource     │
//! │ (HTTP / static) │                          │ (extracted dumps)   │
//! └─────────────────┘                          └─────────────────────┘
//!                                                         │
//!                      AS_ADDROBJ_*            AS_HOUSE_* │
//!                  ┌──────────────────────┬───────────────┘
//!                  ▼                      ▼
//! ┌──────────────────────────┐  ┌──────────────────────────┐
//! │ FiasXmlSource<Address>   │  │ FiasXmlSource<House>     │
//! │ → BatchWriter            │  │ → BatchWriter            │
//! └──────────────────────────┘  └──────────────────────────┘
//!                  │                      │
//!                  ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │          AddressIndexer (levels 1..=7) → HouseIndexer               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod archive;
pub mod catalog;
pub mod coordinator;
pub mod progress;
pub mod source;
pub mod xml;

// Re-export main types
pub use archive::{discover_files, ArchiveFiles, ArchiveKind, ArchiveSource, ExtractedDirArchive};
pub use catalog::{HttpVersionCatalog, StaticCatalog, VersionCatalog, VersionInfo};
pub use coordinator::{
    plan_import, ImportCoordinator, ImportCoordinatorBuilder, ImportKind, ImportPlan,
    ImportReport, ImportState,
};
pub use progress::ImportProgress;
pub use source::{ImportError, IngestStats, XmlRecord};
pub use xml::{ingest_file, FiasXmlSource};
