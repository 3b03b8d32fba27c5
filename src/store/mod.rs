//! Document store abstraction backing the address index
//!
//! The pipeline only talks to the store through [`DocumentStore`]. Documents
//! are JSON objects grouped into collections; writes go through bulk requests
//! that report failures per document so callers can fail fast.
//!
//! ```text
//! ┌──────────────┐   bulk(index/update/delete)   ┌──────────────────┐
//! │ BatchWriter  │ ─────────────────────────────▶│                  │
//! └──────────────┘                               │  DocumentStore   │
//! ┌──────────────┐   scan(query, after, limit)   │   (SledStore)    │
//! │ AddressIndexer│ ◀────────────────────────────│                  │
//! └──────────────┘                               └──────────────────┘
//! ```

pub mod query;
pub mod sled_store;

pub use query::{Query, SearchRequest, Sort};
pub use sled_store::SledStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Named group of documents with a fixed schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Addresses,
    Houses,
    Versions,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Addresses,
        Collection::Houses,
        Collection::Versions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Addresses => "addresses",
            Collection::Houses => "houses",
            Collection::Versions => "versions",
        }
    }
}

impl Collection {
    /// Field naming the owning address object; stores keep it indexed
    pub fn owner_field(&self) -> Option<&'static str> {
        match self {
            Collection::Houses => Some("ao_guid"),
            Collection::Addresses | Collection::Versions => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    /// Insert or fully replace a document
    Index { id: String, doc: Value },
    /// Merge top-level fields into an existing document
    Update { id: String, doc: Value },
    /// Remove a document; removing a missing document is not an error
    Delete { id: String },
}

impl BulkOp {
    pub fn id(&self) -> &str {
        match self {
            BulkOp::Index { id, .. } | BulkOp::Update { id, .. } | BulkOp::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BulkOp::Index { .. } => "index",
            BulkOp::Update { .. } => "update",
            BulkOp::Delete { .. } => "delete",
        }
    }
}

/// Outcome of one bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItem {
    pub id: String,
    pub op: String,
    pub error: Option<String>,
}

/// Per-document failure extracted from a bulk response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub id: String,
    pub op: String,
    pub reason: String,
}

impl fmt::Display for BulkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.op, self.id, self.reason)
    }
}

/// Response to a bulk request, one item per submitted operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|i| i.error.is_some())
    }

    pub fn failures(&self) -> Vec<BulkFailure> {
        self.items
            .iter()
            .filter_map(|item| {
                item.error.as_ref().map(|reason| BulkFailure {
                    id: item.id.clone(),
                    op: item.op.clone(),
                    reason: reason.clone(),
                })
            })
            .collect()
    }
}

/// One page of a cursor scan
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub docs: Vec<Value>,
    /// Cursor for the next page, `None` when the scan is exhausted
    pub next: Option<String>,
}

/// Errors reported by a store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository abstraction for persistence and search.
///
/// Implementations must be safe for concurrent use; the pipeline shares one
/// instance between the writer, the indexer workers and the query façade.
pub trait DocumentStore: Send + Sync {
    /// Create the collection if it does not exist
    fn ensure_collection(&self, collection: Collection) -> StoreResult<()>;

    /// Apply a batch of operations, reporting failures per document
    fn bulk(&self, collection: Collection, ops: Vec<BulkOp>) -> StoreResult<BulkResponse>;

    /// Fetch one document by id
    fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>>;

    /// Fetch several documents by id; missing ids are skipped
    fn mget(&self, collection: Collection, ids: &[String]) -> StoreResult<Vec<Value>> {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get(collection, id)? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Read matching documents in id order, starting after the `after` cursor
    fn scan(
        &self,
        collection: Collection,
        query: &Query,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Page>;

    /// Documents whose owner field equals `owner`.
    ///
    /// The default walks the whole collection; backends with an owner index
    /// answer from it.
    fn owned_by(&self, collection: Collection, owner: &str) -> StoreResult<Vec<Value>> {
        let Some(field) = collection.owner_field() else {
            return Ok(Vec::new());
        };
        let query = Query::term(field, owner);
        let mut docs = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.scan(collection, &query, cursor.as_deref(), 1000)?;
            docs.extend(page.docs);
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(docs),
            }
        }
    }

    /// Filtered, sorted and paginated lookup
    fn search(&self, collection: Collection, request: &SearchRequest) -> StoreResult<Vec<Value>>;

    /// Number of matching documents
    fn count(&self, collection: Collection, query: &Query) -> StoreResult<usize>;

    /// Make all writes durable
    fn refresh(&self) -> StoreResult<()>;
}
