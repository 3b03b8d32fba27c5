//! Indexing stages of the pipeline
//!
//! - [`writer`]: batch persistence of raw and enriched records
//! - [`indexer`]: level-ordered hierarchical denormalization
//! - [`houses`]: street addresses attached to houses
//! - [`cache`]: bounded parent-resolution cache

pub mod cache;
pub mod denormalize;
pub mod houses;
pub mod indexer;
pub mod writer;

pub use cache::ResolutionCache;
pub use houses::{HouseIndexer, HouseStats};
pub use indexer::{AddressIndexer, IndexStats, Selection};
pub use writer::{BatchWriter, CommitHook, WriteStats, WriterMsg};
