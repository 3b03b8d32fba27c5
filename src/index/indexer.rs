//! Hierarchical Denormalization Indexer
//!
//! Re-reads stored address objects level by level, from regions down to
//! streets, and rewrites each with its full address and inherited tiers.
//!
//! ```text
//!             ┌──────────┐  jobs   ┌──────────┐ records ┌──────────────┐
//!  store ───▶ │ producer │ ──────▶ │ workers  │ ──────▶ │ BatchWriter  │──▶ store
//!   scan      └──────────┘ (level) │  (pool)  │         └──────────────┘
//!                                  └────┬─────┘               │ on commit
//!                                       │ level 7             ▼
//!                                       ▼              ResolutionCache::clear
//!                                  house stage
//! ```
//!
//! A level is complete only when its workers have drained and the writer has
//! acknowledged a flush, so every parent is in the store before the next level
//! starts resolving it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::ResolutionCache;
use super::denormalize::denormalize;
use super::writer::{BatchWriter, WriteStats, WriterMsg};
use crate::import::ImportError;
use crate::store::{Collection, DocumentStore, Query};
use crate::types::{AddressObject, IndexObject, STREET_LEVEL};

/// Page size of the store scan feeding the workers
const SCAN_PAGE_SIZE: usize = 1000;

/// Which stored address objects a reindex pass covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every stored object
    All,
    /// Objects written at or after the cutoff (ms), excluding the root level
    Since(i64),
    /// An explicit set of GUIDs
    Guids(Vec<String>),
}

impl Selection {
    /// Selection for an `is_full` flag, a cutoff and an optional GUID set
    pub fn resolve(is_full: bool, cutoff_ms: i64, guids: Option<Vec<String>>) -> Self {
        match (is_full, guids) {
            (true, _) => Selection::All,
            (false, Some(guids)) => Selection::Guids(guids),
            (false, None) => Selection::Since(cutoff_ms),
        }
    }

    fn level_query(&self, level: u32) -> Option<Query> {
        match self {
            Selection::All => Some(Query::term("ao_level", level)),
            Selection::Since(_) if level <= 1 => None,
            Selection::Since(cutoff) => Some(Query::and(vec![
                Query::term("ao_level", level),
                Query::gte("bazis_update_date", *cutoff as f64),
            ])),
            Selection::Guids(_) => None,
        }
    }
}

/// Counters of one reindex pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Records selected and enriched
    pub indexed: u64,
    /// Streets handed to the house stage
    pub streets: u64,
    /// Records whose parent could not be found
    pub orphans: u64,
    /// Enriched record count per level
    pub per_level: BTreeMap<u32, u64>,
    /// Counters of the writer committing the enriched records
    pub write: WriteStats,
}

#[derive(Debug, Default)]
struct WorkerStats {
    indexed: u64,
    streets: u64,
    orphans: u64,
}

/// Level-ordered worker pool enriching address objects
pub struct AddressIndexer {
    store: Arc<dyn DocumentStore>,
    cache: Arc<ResolutionCache>,
    workers: usize,
    batch_size: usize,
    channel_capacity: usize,
}

impl AddressIndexer {
    pub fn new(store: Arc<dyn DocumentStore>, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: Arc::new(ResolutionCache::new(cache_capacity)),
            workers: 5,
            batch_size: 1000,
            channel_capacity: 10_000,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Denormalize the selected objects.
    ///
    /// Streets are announced on `houses` when given; the sender is dropped
    /// on return, which tells the house stage no more streets are coming.
    pub async fn reindex(
        &self,
        selection: Selection,
        houses: Option<mpsc::Sender<IndexObject>>,
    ) -> Result<IndexStats, ImportError> {
        info!("Indexing address hierarchy ({})", selection_kind(&selection));
        self.cache.clear();

        let cache = self.cache.clone();
        let (writer_tx, writer) = BatchWriter::<AddressObject>::new(self.store.clone(), self.batch_size)
            .with_commit_hook(Arc::new(move || cache.clear()))
            .spawn(self.channel_capacity);

        let mut explicit = match &selection {
            Selection::Guids(guids) => self.load_guids(guids)?,
            _ => BTreeMap::new(),
        };

        let mut stats = IndexStats::default();
        for level in 1..=STREET_LEVEL {
            let preselected = explicit.remove(&level).unwrap_or_default();
            let query = selection.level_query(level);
            if query.is_none() && preselected.is_empty() {
                continue;
            }

            let pass = self
                .run_level(level, query, preselected, &writer_tx, houses.as_ref())
                .await;
            let pass = match pass {
                Ok(pass) => pass,
                Err(e) => return Err(Self::writer_error(e, writer_tx, writer).await),
            };

            // Barrier: the level is committed before children resolve it
            let (ack_tx, ack_rx) = oneshot::channel();
            if writer_tx.send(WriterMsg::Flush(ack_tx)).await.is_err() || ack_rx.await.is_err() {
                let closed = ImportError::ChannelClosed("address writer stopped");
                return Err(Self::writer_error(closed, writer_tx, writer).await);
            }

            if pass.indexed > 0 {
                info!(
                    "Level {} indexed: {} records ({} orphans)",
                    level, pass.indexed, pass.orphans
                );
            }
            stats.indexed += pass.indexed;
            stats.streets += pass.streets;
            stats.orphans += pass.orphans;
            stats.per_level.insert(level, pass.indexed);
        }

        if !explicit.is_empty() {
            debug!(
                "Skipped selected objects on levels {:?}",
                explicit.keys().collect::<Vec<_>>()
            );
        }

        drop(writer_tx);
        stats.write = writer.await??;
        self.cache.clear();

        let (hits, misses) = self.cache.hit_stats();
        info!(
            "Address indexing complete: {} records, {} streets, cache {} hits / {} misses",
            stats.indexed, stats.streets, hits, misses
        );
        Ok(stats)
    }

    /// Prefer the writer's own error when it stopped first
    async fn writer_error(
        error: ImportError,
        writer_tx: mpsc::Sender<WriterMsg<AddressObject>>,
        writer: JoinHandle<Result<WriteStats, ImportError>>,
    ) -> ImportError {
        drop(writer_tx);
        match writer.await {
            Ok(Err(writer_error)) => writer_error,
            Err(join_error) => ImportError::TaskJoin(join_error),
            Ok(Ok(_)) => error,
        }
    }

    /// Fetch an explicit GUID set, grouped by level
    fn load_guids(&self, guids: &[String]) -> Result<BTreeMap<u32, Vec<AddressObject>>, ImportError> {
        let mut by_level: BTreeMap<u32, Vec<AddressObject>> = BTreeMap::new();
        for chunk in guids.chunks(SCAN_PAGE_SIZE) {
            for value in self.store.mget(Collection::Addresses, chunk)? {
                match serde_json::from_value::<AddressObject>(value) {
                    Ok(record) => by_level.entry(record.ao_level).or_default().push(record),
                    Err(e) => warn!("Skipping undecodable address object: {}", e),
                }
            }
        }
        Ok(by_level)
    }

    async fn run_level(
        &self,
        level: u32,
        query: Option<Query>,
        preselected: Vec<AddressObject>,
        writer_tx: &mpsc::Sender<WriterMsg<AddressObject>>,
        houses: Option<&mpsc::Sender<IndexObject>>,
    ) -> Result<WorkerStats, ImportError> {
        debug!("Indexing level {} with {} workers", level, self.workers);
        let (job_tx, job_rx) = mpsc::channel::<AddressObject>(self.channel_capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let worker = Worker {
                id: worker_id,
                store: self.store.clone(),
                cache: self.cache.clone(),
                jobs: job_rx.clone(),
                writer: writer_tx.clone(),
                houses: houses.cloned(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        let produced = self.produce(query, preselected, &job_tx).await;
        drop(job_tx);

        let mut stats = WorkerStats::default();
        let mut first_error = produced.err();
        for handle in handles {
            match handle.await {
                Ok(Ok(worker)) => {
                    stats.indexed += worker.indexed;
                    stats.streets += worker.streets;
                    stats.orphans += worker.orphans;
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ImportError::TaskJoin(e));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Feed the level's records to the workers
    async fn produce(
        &self,
        query: Option<Query>,
        preselected: Vec<AddressObject>,
        job_tx: &mpsc::Sender<AddressObject>,
    ) -> Result<(), ImportError> {
        for record in preselected {
            job_tx
                .send(record)
                .await
                .map_err(|_| ImportError::ChannelClosed("indexer workers stopped"))?;
        }

        let Some(query) = query else {
            return Ok(());
        };
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .scan(Collection::Addresses, &query, cursor.as_deref(), SCAN_PAGE_SIZE)?;
            for value in page.docs {
                match serde_json::from_value::<AddressObject>(value) {
                    Ok(record) => job_tx
                        .send(record)
                        .await
                        .map_err(|_| ImportError::ChannelClosed("indexer workers stopped"))?,
                    Err(e) => warn!("Skipping undecodable address object: {}", e),
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }
}

fn selection_kind(selection: &Selection) -> String {
    match selection {
        Selection::All => "full".to_string(),
        Selection::Since(cutoff) => format!("since {}", cutoff),
        Selection::Guids(guids) => format!("{} explicit GUIDs", guids.len()),
    }
}

/// One member of the worker pool
struct Worker {
    id: usize,
    store: Arc<dyn DocumentStore>,
    cache: Arc<ResolutionCache>,
    jobs: Arc<Mutex<mpsc::Receiver<AddressObject>>>,
    writer: mpsc::Sender<WriterMsg<AddressObject>>,
    houses: Option<mpsc::Sender<IndexObject>>,
}

impl Worker {
    async fn run(self) -> Result<WorkerStats, ImportError> {
        let mut stats = WorkerStats::default();
        loop {
            let next = self.jobs.lock().await.recv().await;
            let Some(mut record) = next else {
                break;
            };

            let parent = self.resolve_parent(&record.parent_guid)?;
            if !record.parent_guid.is_empty() && parent.is_none() {
                debug!(
                    "Parent {} of {} not found",
                    record.parent_guid, record.ao_guid
                );
                stats.orphans += 1;
            }
            denormalize(&mut record, parent.as_ref());

            if record.ao_level == STREET_LEVEL {
                if let Some(houses) = &self.houses {
                    let street = IndexObject {
                        ao_guid: record.ao_guid.clone(),
                        full_address: record.full_address.clone(),
                        address_suggest: record.address_suggest.clone(),
                    };
                    houses
                        .send(street)
                        .await
                        .map_err(|_| ImportError::ChannelClosed("house stage stopped"))?;
                }
                stats.streets += 1;
            } else {
                self.cache.insert(record.clone());
            }

            self.writer
                .send(WriterMsg::Record(record))
                .await
                .map_err(|_| ImportError::ChannelClosed("address writer stopped"))?;
            stats.indexed += 1;
        }
        debug!("Indexer worker {} done: {} records", self.id, stats.indexed);
        Ok(stats)
    }

    /// Cache first, then the store
    fn resolve_parent(&self, guid: &str) -> Result<Option<AddressObject>, ImportError> {
        if guid.is_empty() {
            return Ok(None);
        }
        if let Some(parent) = self.cache.get(guid) {
            return Ok(Some(parent));
        }
        let Some(value) = self.store.get(Collection::Addresses, guid)? else {
            return Ok(None);
        };
        let parent: AddressObject = serde_json::from_value(value)?;
        self.cache.insert(parent.clone());
        Ok(Some(parent))
    }
}
