//! House-indexing stage
//!
//! Receives denormalized streets from the address indexer and stamps the
//! street's full address onto every stored house the street owns. Houses are
//! found through the store's owner lookup; streets are buffered so one trip
//! to the blocking pool serves many of them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::import::ImportError;
use crate::store::{BulkOp, Collection, DocumentStore};
use crate::types::{HouseObject, IndexObject};
use crate::util::join_nonempty;

/// Counters of the house stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HouseStats {
    /// Streets received from the indexer
    pub streets: u64,
    /// Houses updated
    pub houses: u64,
    /// Bulk requests issued
    pub batches: u64,
}

/// Consumer of the street handoff channel
pub struct HouseIndexer {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
    street_buffer: usize,
}

impl HouseIndexer {
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            street_buffer: batch_size * 10,
        }
    }

    /// Streets collected before their houses are looked up
    pub fn with_street_buffer(mut self, streets: usize) -> Self {
        self.street_buffer = streets.max(1);
        self
    }

    pub fn spawn(
        self,
        capacity: usize,
    ) -> (
        mpsc::Sender<IndexObject>,
        JoinHandle<Result<HouseStats, ImportError>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, tokio::spawn(self.run(rx)))
    }

    /// Run until the handoff channel closes
    pub async fn run(self, mut rx: mpsc::Receiver<IndexObject>) -> Result<HouseStats, ImportError> {
        let mut stats = HouseStats::default();
        let mut pending: HashMap<String, IndexObject> = HashMap::new();

        while let Some(street) = rx.recv().await {
            stats.streets += 1;
            pending.insert(street.ao_guid.clone(), street);
            if pending.len() >= self.street_buffer {
                self.apply(&mut pending, &mut stats).await?;
            }
        }
        self.apply(&mut pending, &mut stats).await?;

        info!(
            "House indexing complete: {} houses on {} streets",
            stats.houses, stats.streets
        );
        Ok(stats)
    }

    async fn apply(
        &self,
        streets: &mut HashMap<String, IndexObject>,
        stats: &mut HouseStats,
    ) -> Result<(), ImportError> {
        if streets.is_empty() {
            return Ok(());
        }
        debug!("Updating houses of {} streets", streets.len());
        let buffered: Vec<IndexObject> = streets.drain().map(|(_, street)| street).collect();
        let store = self.store.clone();
        let batch_size = self.batch_size;
        let (houses, batches) =
            tokio::task::spawn_blocking(move || update_houses(store.as_ref(), buffered, batch_size))
                .await??;
        stats.houses += houses;
        stats.batches += batches;
        Ok(())
    }
}

/// Attach each street's address to the houses it owns, returning the number
/// of houses updated and bulk requests issued
fn update_houses(
    store: &dyn DocumentStore,
    streets: Vec<IndexObject>,
    batch_size: usize,
) -> Result<(u64, u64), ImportError> {
    let mut ops = Vec::with_capacity(batch_size);
    let mut houses = 0u64;
    let mut batches = 0u64;
    for street in &streets {
        for value in store.owned_by(Collection::Houses, &street.ao_guid)? {
            let house: HouseObject = match serde_json::from_value(value) {
                Ok(house) => house,
                Err(e) => {
                    warn!("Skipping undecodable house of {}: {}", street.ao_guid, e);
                    continue;
                }
            };
            ops.push(house_update(&house, street));
            if ops.len() >= batch_size {
                houses += commit(store, std::mem::take(&mut ops))?;
                batches += 1;
            }
        }
    }
    if !ops.is_empty() {
        houses += commit(store, ops)?;
        batches += 1;
    }
    Ok((houses, batches))
}

fn commit(store: &dyn DocumentStore, ops: Vec<BulkOp>) -> Result<u64, ImportError> {
    let count = ops.len() as u64;
    let response = store.bulk(Collection::Houses, ops)?;
    if response.has_errors() {
        let failures = response.failures();
        error!("House update failed for {} document(s)", failures.len());
        for failure in &failures {
            error!("  {}", failure);
        }
        return Err(ImportError::BulkCommit {
            collection: Collection::Houses,
            failures,
        });
    }
    Ok(count)
}

/// Partial update attaching the street address to a house
fn house_update(house: &HouseObject, street: &IndexObject) -> BulkOp {
    let designation = house.designation();
    let full_address = join_nonempty([street.full_address.as_str(), designation.as_str()]);
    let address_suggest =
        join_nonempty([street.address_suggest.as_str(), designation.as_str()]).to_lowercase();
    BulkOp::Update {
        id: house.house_guid.clone(),
        doc: json!({
            "full_address": full_address,
            "address_suggest": address_suggest,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BulkResponse, Page, Query, SearchRequest, SledStore, StoreResult};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn house(guid: &str, street: &str, num: &str, build: &str) -> HouseObject {
        HouseObject {
            house_guid: guid.to_string(),
            ao_guid: street.to_string(),
            house_num: num.to_string(),
            build_num: build.to_string(),
            ..Default::default()
        }
    }

    fn seed(store: &SledStore, houses: &[HouseObject]) {
        let ops = houses
            .iter()
            .map(|h| BulkOp::Index {
                id: h.house_guid.clone(),
                doc: serde_json::to_value(h).unwrap(),
            })
            .collect();
        store.bulk(Collection::Houses, ops).unwrap();
    }

    fn street(guid: &str, full: &str) -> IndexObject {
        IndexObject {
            ao_guid: guid.to_string(),
            full_address: full.to_string(),
            address_suggest: full.to_lowercase(),
        }
    }

    #[tokio::test]
    async fn test_houses_get_street_address() {
        let store = Arc::new(SledStore::temporary().unwrap());
        seed(
            &store,
            &[
                house("h1", "s1", "5", "1"),
                house("h2", "s1", "7", ""),
                house("h3", "other", "1", ""),
            ],
        );

        let (tx, handle) = HouseIndexer::new(store.clone(), 1)
            .with_street_buffer(1)
            .spawn(4);
        tx.send(street("s1", "г Москва, ул Арбат")).await.unwrap();
        drop(tx);
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.streets, 1);
        assert_eq!(stats.houses, 2);
        assert_eq!(stats.batches, 2);

        let h1: HouseObject =
            serde_json::from_value(store.get(Collection::Houses, "h1").unwrap().unwrap()).unwrap();
        assert_eq!(h1.full_address, "г Москва, ул Арбат, д 5 корп 1");
        assert_eq!(h1.address_suggest, "г москва, ул арбат, д 5 корп 1");
        assert_eq!(h1.house_num, "5");

        let h3: HouseObject =
            serde_json::from_value(store.get(Collection::Houses, "h3").unwrap().unwrap()).unwrap();
        assert!(h3.full_address.is_empty());
    }

    /// Store wrapper counting documents read by collection scans
    struct ScanCounter {
        inner: SledStore,
        scanned: AtomicUsize,
    }

    impl DocumentStore for ScanCounter {
        fn ensure_collection(&self, c: Collection) -> StoreResult<()> {
            self.inner.ensure_collection(c)
        }
        fn bulk(&self, c: Collection, ops: Vec<BulkOp>) -> StoreResult<BulkResponse> {
            self.inner.bulk(c, ops)
        }
        fn get(&self, c: Collection, id: &str) -> StoreResult<Option<Value>> {
            self.inner.get(c, id)
        }
        fn owned_by(&self, c: Collection, owner: &str) -> StoreResult<Vec<Value>> {
            self.inner.owned_by(c, owner)
        }
        fn scan(&self, c: Collection, q: &Query, a: Option<&str>, l: usize) -> StoreResult<Page> {
            let page = self.inner.scan(c, q, a, l)?;
            self.scanned.fetch_add(page.docs.len(), Ordering::SeqCst);
            Ok(page)
        }
        fn search(&self, c: Collection, r: &SearchRequest) -> StoreResult<Vec<Value>> {
            self.inner.search(c, r)
        }
        fn count(&self, c: Collection, q: &Query) -> StoreResult<usize> {
            self.inner.count(c, q)
        }
        fn refresh(&self) -> StoreResult<()> {
            self.inner.refresh()
        }
    }

    #[tokio::test]
    async fn test_houses_found_without_scanning_collection() {
        let inner = SledStore::temporary().unwrap();
        let houses: Vec<HouseObject> = (0..200)
            .map(|i| house(&format!("h{:03}", i), &format!("s{:02}", i % 50), "1", ""))
            .collect();
        seed(&inner, &houses);
        let store = Arc::new(ScanCounter {
            inner,
            scanned: AtomicUsize::new(0),
        });

        let (tx, handle) = HouseIndexer::new(store.clone(), 1).spawn(64);
        for i in 0..50 {
            let guid = format!("s{:02}", i);
            tx.send(street(&guid, &format!("ул {}", guid))).await.unwrap();
        }
        drop(tx);
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.streets, 50);
        assert_eq!(stats.houses, 200);
        assert_eq!(store.scanned.load(Ordering::SeqCst), 0);
        let h007: HouseObject =
            serde_json::from_value(store.get(Collection::Houses, "h007").unwrap().unwrap()).unwrap();
        assert_eq!(h007.full_address, "ул s07, д 1");
    }

    #[tokio::test]
    async fn test_street_without_houses() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let (tx, handle) = HouseIndexer::new(store, 10).spawn(4);
        tx.send(street("empty", "ул Пустая")).await.unwrap();
        drop(tx);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.houses, 0);
        assert_eq!(stats.batches, 0);
    }
}
