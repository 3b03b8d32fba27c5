//! Sled-backed document store
//!
//! One sled tree per collection, keyed by document id, values are JSON bytes.
//! Scans walk the tree in key order so the cursor is simply the last id read.
//! Collections with an owner field also keep an `owner \0 id` tree, written in
//! the same transaction as the documents, so owned documents are found
//! without a scan.

use serde_json::Value;
use std::collections::HashMap;
use std::ops::Bound;
use std::path::Path;
use tracing::{debug, warn};

use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;

use super::{
    BulkItem, BulkOp, BulkResponse, Collection, DocumentStore, Page, Query, SearchRequest,
    StoreError, StoreResult,
};

/// Embedded store for address, house and version documents
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create the database under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = data_dir.as_ref().join("fias.sled");
        let db = sled::open(&db_path)?;
        let store = Self { db };
        for collection in Collection::ALL {
            store.ensure_collection(collection)?;
        }
        debug!("Opened store at {}", db_path.display());
        Ok(store)
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, collection: Collection) -> StoreResult<sled::Tree> {
        Ok(self.db.open_tree(collection.as_str())?)
    }

    /// Secondary tree mapping `owner \0 id` to nothing, for owned collections
    fn owner_tree(&self, collection: Collection) -> StoreResult<Option<sled::Tree>> {
        if collection.owner_field().is_none() {
            return Ok(None);
        }
        let name = format!("{}_by_owner", collection.as_str());
        Ok(Some(self.db.open_tree(name)?))
    }

    /// Document state as seen by the operations of the running request
    fn current(
        tree: &sled::Tree,
        staged: &HashMap<String, Option<Value>>,
        id: &str,
    ) -> StoreResult<Option<Value>> {
        if let Some(state) = staged.get(id) {
            return Ok(state.clone());
        }
        Ok(match tree.get(id.as_bytes())? {
            Some(bytes) => Self::decode(id.as_bytes(), &bytes),
            None => None,
        })
    }

    fn decode(key: &[u8], bytes: &[u8]) -> Option<Value> {
        match serde_json::from_slice(bytes) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(
                    "Skipping undecodable document {}: {}",
                    String::from_utf8_lossy(key),
                    e
                );
                None
            }
        }
    }

    fn documents(tree: &sled::Tree) -> impl Iterator<Item = Value> + '_ {
        tree.iter().filter_map(|entry| match entry {
            Ok((key, bytes)) => Self::decode(&key, &bytes),
            Err(e) => {
                warn!("Failed to read store entry: {}", e);
                None
            }
        })
    }
}

fn owner_of<'a>(doc: &'a Value, field: &str) -> Option<&'a str> {
    doc.get(field)
        .and_then(Value::as_str)
        .filter(|owner| !owner.is_empty())
}

fn owner_key(owner: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + id.len() + 1);
    key.extend_from_slice(owner.as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

fn item(id: String, op: &'static str, error: Option<String>) -> BulkItem {
    BulkItem {
        id,
        op: op.to_string(),
        error,
    }
}

impl DocumentStore for SledStore {
    fn ensure_collection(&self, collection: Collection) -> StoreResult<()> {
        self.tree(collection)?;
        self.owner_tree(collection)?;
        Ok(())
    }

    fn bulk(&self, collection: Collection, ops: Vec<BulkOp>) -> StoreResult<BulkResponse> {
        let tree = self.tree(collection)?;
        let owner_field = collection.owner_field();
        let mut batch = sled::Batch::default();
        let mut owner_batch = sled::Batch::default();
        let mut items = Vec::with_capacity(ops.len());
        // State of documents touched earlier in this request, so updates see
        // index and delete operations that precede them.
        let mut staged: HashMap<String, Option<Value>> = HashMap::new();

        for op in ops {
            let kind = op.kind();
            let (id, next) = match op {
                BulkOp::Index { id, doc } => {
                    if !doc.is_object() {
                        items.push(item(id, kind, Some("document must be a JSON object".into())));
                        continue;
                    }
                    (id, Some(doc))
                }
                BulkOp::Update { id, doc } => {
                    let (Some(Value::Object(mut existing)), Value::Object(partial)) =
                        (Self::current(&tree, &staged, &id)?, doc)
                    else {
                        items.push(item(id, kind, Some("document_missing".into())));
                        continue;
                    };
                    existing.extend(partial);
                    (id, Some(Value::Object(existing)))
                }
                BulkOp::Delete { id } => (id, None),
            };

            let bytes = match &next {
                Some(doc) => match serde_json::to_vec(doc) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        items.push(item(id, kind, Some(e.to_string())));
                        continue;
                    }
                },
                None => None,
            };

            if let Some(field) = owner_field {
                let previous = Self::current(&tree, &staged, &id)?;
                let old_owner = previous.as_ref().and_then(|d| owner_of(d, field));
                let new_owner = next.as_ref().and_then(|d| owner_of(d, field));
                if old_owner != new_owner {
                    if let Some(owner) = old_owner {
                        owner_batch.remove(owner_key(owner, &id));
                    }
                    if let Some(owner) = new_owner {
                        owner_batch.insert(owner_key(owner, &id), Vec::<u8>::new());
                    }
                }
            }

            match bytes {
                Some(bytes) => batch.insert(id.as_bytes(), bytes),
                None => batch.remove(id.as_bytes()),
            }
            staged.insert(id.clone(), next);
            items.push(item(id, kind, None));
        }

        match self.owner_tree(collection)? {
            Some(owners) => (&tree, &owners)
                .transaction(|(docs, index)| -> ConflictableTransactionResult<(), ()> {
                    docs.apply_batch(&batch)?;
                    index.apply_batch(&owner_batch)?;
                    Ok(())
                })
                .map_err(|e| match e {
                    TransactionError::Storage(e) => StoreError::Sled(e),
                    TransactionError::Abort(()) => {
                        StoreError::Unavailable(format!("bulk write to {} aborted", collection))
                    }
                })?,
            None => tree.apply_batch(batch)?,
        }
        Ok(BulkResponse { items })
    }

    fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        let tree = self.tree(collection)?;
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan(
        &self,
        collection: Collection,
        query: &Query,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Page> {
        let tree = self.tree(collection)?;
        let limit = limit.max(1);
        let start = match after {
            Some(cursor) => Bound::Excluded(cursor.as_bytes().to_vec()),
            None => Bound::Unbounded,
        };

        let mut docs = Vec::with_capacity(limit.min(1024));
        let mut last_key: Option<String> = None;
        for entry in tree.range::<Vec<u8>, _>((start, Bound::Unbounded)) {
            let (key, bytes) = entry?;
            if let Some(doc) = Self::decode(&key, &bytes) {
                if query.matches(&doc) {
                    docs.push(doc);
                }
            }
            last_key = Some(String::from_utf8_lossy(&key).into_owned());
            if docs.len() >= limit {
                break;
            }
        }

        let next = if docs.len() >= limit { last_key } else { None };
        Ok(Page { docs, next })
    }

    fn owned_by(&self, collection: Collection, owner: &str) -> StoreResult<Vec<Value>> {
        let (Some(field), Some(owners)) = (collection.owner_field(), self.owner_tree(collection)?)
        else {
            return Ok(Vec::new());
        };
        let tree = self.tree(collection)?;
        let prefix = owner_key(owner, "");
        let mut docs = Vec::new();
        for entry in owners.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let id = &key[prefix.len()..];
            let Some(bytes) = tree.get(id)? else {
                continue;
            };
            if let Some(doc) = Self::decode(id, &bytes) {
                if owner_of(&doc, field) == Some(owner) {
                    docs.push(doc);
                }
            }
        }
        Ok(docs)
    }

    fn search(&self, collection: Collection, request: &SearchRequest) -> StoreResult<Vec<Value>> {
        let tree = self.tree(collection)?;
        Ok(request.apply(Self::documents(&tree)))
    }

    fn count(&self, collection: Collection, query: &Query) -> StoreResult<usize> {
        let tree = self.tree(collection)?;
        Ok(Self::documents(&tree).filter(|d| query.matches(d)).count())
    }

    fn refresh(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
