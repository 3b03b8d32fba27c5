//! Batch Persistence Writer
//!
//! Consumes records from a bounded channel, classifies each one as an upsert
//! or a delete by its lifecycle status and commits them to the store in bulk
//! requests of `batch_size` operations. An inactive row deletes the stored
//! record only when the stored record is that same upstream row; historical
//! rows of a GUID whose current row is stored are dropped.
//!
//! Closing the channel is the end-of-stream signal: the remaining partial
//! batch is committed and the run returns its counters.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::import::ImportError;
use crate::store::{BulkOp, DocumentStore};
use crate::types::{now_millis, Document};

/// Messages accepted by a [`BatchWriter`]
pub enum WriterMsg<D> {
    /// A record to classify and buffer
    Record(D),
    /// Commit everything buffered so far, then acknowledge
    Flush(oneshot::Sender<()>),
}

/// Hook invoked after every successful bulk commit
pub type CommitHook = Arc<dyn Fn() + Send + Sync>;

/// Counters reported when the writer finishes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Records received
    pub processed: u64,
    pub upserts: u64,
    pub deletes: u64,
    /// Historical rows dropped because their GUID is stored under another row
    pub superseded: u64,
    /// Bulk requests issued
    pub batches: u64,
    /// Owners of upserted records, e.g. the streets of changed houses
    pub touched_parents: BTreeSet<String>,
}

impl WriteStats {
    pub fn merge(&mut self, other: WriteStats) {
        self.processed += other.processed;
        self.upserts += other.upserts;
        self.deletes += other.deletes;
        self.superseded += other.superseded;
        self.batches += other.batches;
        self.touched_parents.extend(other.touched_parents);
    }
}

/// Bulk writer for one collection
pub struct BatchWriter<D: Document> {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
    merge_stored: bool,
    on_commit: Option<CommitHook>,
    upserts: Vec<D>,
    /// Inactive rows as (GUID, row id)
    deletes: Vec<(String, String)>,
    stats: WriteStats,
}

/// Outcome of one committed batch
struct Committed {
    upserts: u64,
    deletes: u64,
    superseded: u64,
    owners: Vec<String>,
}

impl<D: Document> BatchWriter<D> {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            merge_stored: false,
            on_commit: None,
            upserts: Vec::with_capacity(batch_size),
            deletes: Vec::new(),
            stats: WriteStats::default(),
        }
    }

    /// Merge fields of the stored copy into incoming upserts before commit.
    /// Used by incremental cycles so raw delta rows keep denormalized fields.
    pub fn with_merge_stored(mut self, merge_stored: bool) -> Self {
        self.merge_stored = merge_stored;
        self
    }

    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.on_commit = Some(hook);
        self
    }

    /// Spawn the writer on the runtime, returning its input channel
    pub fn spawn(
        self,
        capacity: usize,
    ) -> (
        mpsc::Sender<WriterMsg<D>>,
        tokio::task::JoinHandle<Result<WriteStats, ImportError>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Drain the channel until it closes
    pub async fn run(mut self, mut rx: mpsc::Receiver<WriterMsg<D>>) -> Result<WriteStats, ImportError> {
        debug!(
            "Writer for {} started (batch_size={}, merge_stored={})",
            D::COLLECTION,
            self.batch_size,
            self.merge_stored
        );

        while let Some(msg) = rx.recv().await {
            match msg {
                WriterMsg::Record(record) => {
                    self.push(record);
                    if self.pending() >= self.batch_size {
                        self.commit().await?;
                    }
                }
                WriterMsg::Flush(ack) => {
                    self.commit().await?;
                    let _ = ack.send(());
                }
            }
        }

        // End of stream
        self.commit().await?;
        info!(
            "Writer for {} finished: {} records, {} upserts, {} deletes ({} superseded) in {} batches",
            D::COLLECTION,
            self.stats.processed,
            self.stats.upserts,
            self.stats.deletes,
            self.stats.superseded,
            self.stats.batches
        );
        Ok(self.stats)
    }

    fn pending(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }

    fn push(&mut self, record: D) {
        self.stats.processed += 1;
        if record.is_active() {
            self.upserts.push(record);
        } else {
            self.deletes
                .push((record.doc_id().to_string(), record.row_id().to_string()));
        }
    }

    async fn commit(&mut self) -> Result<(), ImportError> {
        if self.pending() == 0 {
            return Ok(());
        }
        let upserts = std::mem::take(&mut self.upserts);
        let deletes = std::mem::take(&mut self.deletes);
        let store = self.store.clone();
        let merge_stored = self.merge_stored;

        let committed = tokio::task::spawn_blocking(move || {
            commit_batch(store.as_ref(), upserts, deletes, merge_stored)
        })
        .await??;

        self.stats.upserts += committed.upserts;
        self.stats.deletes += committed.deletes;
        self.stats.superseded += committed.superseded;
        self.stats.batches += 1;
        self.stats.touched_parents.extend(committed.owners);
        if let Some(hook) = &self.on_commit {
            hook();
        }
        Ok(())
    }
}

/// Carry stored fields into the buffered upserts
fn merge_with_stored<D: Document>(
    store: &dyn DocumentStore,
    upserts: &mut [D],
) -> Result<(), ImportError> {
    let ids: Vec<String> = upserts.iter().map(|r| r.doc_id().to_string()).collect();
    let stored: HashMap<String, D> = store
        .mget(D::COLLECTION, &ids)?
        .into_iter()
        .filter_map(|value| serde_json::from_value::<D>(value).ok())
        .map(|doc| (doc.doc_id().to_string(), doc))
        .collect();

    for record in upserts.iter_mut() {
        if let Some(previous) = stored.get(record.doc_id()) {
            record.merge_stored(previous);
        }
    }
    Ok(())
}

/// Drop inactive rows whose GUID is stored under a different row.
///
/// Such a row is a historical version of a record whose current row was
/// written earlier; deleting by GUID would remove the live record.
fn retain_stored_rows<D: Document>(
    store: &dyn DocumentStore,
    deletes: Vec<(String, String)>,
) -> Result<(Vec<String>, u64), ImportError> {
    let ids: Vec<String> = deletes.iter().map(|(id, _)| id.clone()).collect();
    let stored_rows: HashMap<String, String> = store
        .mget(D::COLLECTION, &ids)?
        .into_iter()
        .filter_map(|value| serde_json::from_value::<D>(value).ok())
        .map(|doc| (doc.doc_id().to_string(), doc.row_id().to_string()))
        .collect();

    let mut kept = Vec::with_capacity(deletes.len());
    let mut superseded = 0u64;
    for (id, row) in deletes {
        match stored_rows.get(&id) {
            Some(stored) if !stored.is_empty() && !row.is_empty() && *stored != row => {
                debug!("Row {} of {} is historical, keeping stored row {}", row, id, stored);
                superseded += 1;
            }
            _ => kept.push(id),
        }
    }
    Ok((kept, superseded))
}

/// Build and submit one bulk request; runs on the blocking pool
fn commit_batch<D: Document>(
    store: &dyn DocumentStore,
    mut upserts: Vec<D>,
    deletes: Vec<(String, String)>,
    merge_stored: bool,
) -> Result<Committed, ImportError> {
    if merge_stored && !upserts.is_empty() {
        merge_with_stored(store, &mut upserts)?;
    }
    let (deletes, superseded) = if deletes.is_empty() {
        (Vec::new(), 0)
    } else {
        retain_stored_rows::<D>(store, deletes)?
    };

    let now = now_millis();
    let mut ops = Vec::with_capacity(upserts.len() + deletes.len());
    let mut owners = Vec::new();
    // Deletes first: a historical row and the current row of one GUID
    // in the same batch must leave the current row stored.
    let delete_count = deletes.len() as u64;
    for id in deletes {
        ops.push(BulkOp::Delete { id });
    }
    let upsert_count = upserts.len() as u64;
    for mut record in upserts {
        record.stamp(now);
        if let Some(owner) = record.owner_guid() {
            owners.push(owner.to_string());
        }
        let id = record.doc_id().to_string();
        let doc = serde_json::to_value(&record)?;
        ops.push(BulkOp::Index { id, doc });
    }

    debug!(
        "Committing {} upserts and {} deletes to {}",
        upsert_count,
        delete_count,
        D::COLLECTION
    );
    let response = store.bulk(D::COLLECTION, ops)?;
    if response.has_errors() {
        let failures = response.failures();
        error!(
            "Bulk commit to {} failed for {} document(s)",
            D::COLLECTION,
            failures.len()
        );
        for failure in &failures {
            error!("  {}", failure);
        }
        return Err(ImportError::BulkCommit {
            collection: D::COLLECTION,
            failures,
        });
    }

    Ok(Committed {
        upserts: upsert_count,
        deletes: delete_count,
        superseded,
        owners,
    })
}
