//! fias-index: import pipeline and search index for the FIAS address registry
//!
//! Builds a denormalized, searchable index of administrative areas, streets
//! and houses from the registry's XML dumps:
//! - Streaming XML ingestion with bounded memory (quick-xml)
//! - Batched persistence with lifecycle-based upsert/delete routing
//! - Level-ordered hierarchical denormalization on a worker pool
//! - Full and delta import cycles reconciled against the published catalog
//! - Embedded document store (sled) with a small query DSL
//! - Read-only address query façade

pub mod config;
pub mod import;
pub mod index;
pub mod query;
pub mod store;
pub mod types;
pub mod util;

pub use config::Config;
pub use types::*;
