//! Integration tests for fias-index
//!
//! These tests drive the public API end to end against a real sled store and
//! XML dumps written to temporary directories.

use async_trait::async_trait;
use fias_index::{
    config::ImportConfig,
    import::{
        ingest_file, ArchiveFiles, ArchiveKind, ArchiveSource, ExtractedDirArchive,
        ImportCoordinator, ImportCoordinatorBuilder, ImportError, ImportKind, ImportProgress,
        StaticCatalog, VersionInfo,
    },
    index::{BatchWriter, WriterMsg},
    query::AddressQuery,
    store::{
        BulkOp, BulkResponse, Collection, DocumentStore, Page, Query, SearchRequest, SledStore,
        StoreError, StoreResult,
    },
    types::{AddressObject, HouseObject, Version},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

fn address_xml(objects: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<AddressObjects>\n{}\n</AddressObjects>\n",
        objects.join("\n")
    )
}

fn house_xml(houses: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<Houses>\n{}\n</Houses>\n",
        houses.join("\n")
    )
}

fn object(guid: &str, parent: &str, level: u32, short: &str, formal: &str, active: bool) -> String {
    let curr = if active { 0 } else { 1 };
    format!(
        r#"<Object AOID="{guid}-id" AOGUID="{guid}" PARENTGUID="{parent}" FORMALNAME="{formal}" SHORTNAME="{short}" AOLEVEL="{level}" CURRSTATUS="{curr}" ACTSTATUS="1" LIVESTATUS="1" REGIONCODE="50" />"#
    )
}

fn house(guid: &str, street: &str, num: &str, build: &str, end_date: &str) -> String {
    format!(
        r#"<House HOUSEID="{guid}-id" HOUSEGUID="{guid}" AOGUID="{street}" HOUSENUM="{num}" BUILDNUM="{build}" STARTDATE="2010-01-01" ENDDATE="{end_date}" />"#
    )
}

fn write_archive(root: &Path, id: u32, kind: ArchiveKind, addresses: &[String], houses: &[String]) {
    let dir = root.join(id.to_string()).join(kind.as_str());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("AS_ADDROBJ_{}.XML", id)), address_xml(addresses)).unwrap();
    std::fs::write(dir.join(format!("AS_HOUSE_{}.XML", id)), house_xml(houses)).unwrap();
}

fn version_info(id: u32) -> VersionInfo {
    VersionInfo {
        version_id: id,
        text_version: format!("БД ФИАС версия {}", id),
        fias_complete_xml_url: format!("https://example.org/{}/fias_xml.zip", id),
        fias_delta_xml_url: format!("https://example.org/{}/fias_delta_xml.zip", id),
        date: None,
    }
}

fn seed_version(store: &dyn DocumentStore, id: u32) {
    let version = Version {
        version_id: id,
        text_version: format!("v{}", id),
        update_date: String::new(),
        address_count: 0,
        house_count: 0,
        created_at: 0,
    };
    let op = BulkOp::Index {
        id: version.doc_id(),
        doc: serde_json::to_value(&version).unwrap(),
    };
    store.bulk(Collection::Versions, vec![op]).unwrap();
}

fn test_config() -> ImportConfig {
    ImportConfig {
        batch_size: 3,
        workers: 3,
        channel_capacity: 16,
        cache_capacity: 64,
        quiet: true,
        ..Default::default()
    }
}

fn coordinator(
    store: Arc<dyn DocumentStore>,
    catalog: Vec<VersionInfo>,
    archive: Arc<dyn ArchiveSource>,
) -> ImportCoordinator {
    ImportCoordinatorBuilder::new(store)
        .with_config(test_config())
        .with_catalog(Arc::new(StaticCatalog::new(catalog)))
        .with_archive(archive)
        .build()
        .unwrap()
}

fn load_address(store: &dyn DocumentStore, guid: &str) -> Option<AddressObject> {
    store
        .get(Collection::Addresses, guid)
        .unwrap()
        .map(|doc| serde_json::from_value(doc).unwrap())
}

fn load_house(store: &dyn DocumentStore, guid: &str) -> Option<HouseObject> {
    store
        .get(Collection::Houses, guid)
        .unwrap()
        .map(|doc| serde_json::from_value(doc).unwrap())
}

/// Archive source remembering which archives were requested
struct RecordingArchive {
    inner: ExtractedDirArchive,
    fetched: Mutex<Vec<(u32, ArchiveKind)>>,
}

impl RecordingArchive {
    fn new(root: &Path) -> Self {
        Self {
            inner: ExtractedDirArchive::new(root),
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn fetched(&self) -> Vec<(u32, ArchiveKind)> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl ArchiveSource for RecordingArchive {
    async fn fetch(&self, version: &VersionInfo, kind: ArchiveKind) -> Result<ArchiveFiles, ImportError> {
        self.fetched.lock().push((version.version_id, kind));
        self.inner.fetch(version, kind).await
    }
}

type FaultRule = Box<dyn Fn(Collection, &[BulkOp]) -> bool + Send + Sync>;

/// Store wrapper recording bulk calls and failing the ones a rule selects
struct FaultStore {
    inner: SledStore,
    rule: Mutex<Option<FaultRule>>,
    calls: Mutex<Vec<(Collection, Vec<BulkOp>)>>,
}

impl FaultStore {
    fn new() -> Self {
        Self {
            inner: SledStore::temporary().unwrap(),
            rule: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn fail_when(&self, rule: FaultRule) {
        *self.rule.lock() = Some(rule);
    }

    fn heal(&self) {
        *self.rule.lock() = None;
    }

    fn calls_for(&self, collection: Collection) -> Vec<Vec<BulkOp>> {
        self.calls
            .lock()
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, ops)| ops.clone())
            .collect()
    }
}

impl DocumentStore for FaultStore {
    fn ensure_collection(&self, collection: Collection) -> StoreResult<()> {
        self.inner.ensure_collection(collection)
    }

    fn bulk(&self, collection: Collection, ops: Vec<BulkOp>) -> StoreResult<BulkResponse> {
        if let Some(rule) = self.rule.lock().as_ref() {
            if rule(collection, &ops) {
                return Err(StoreError::Unavailable("injected crash".to_string()));
            }
        }
        self.calls.lock().push((collection, ops.clone()));
        self.inner.bulk(collection, ops)
    }

    fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        self.inner.get(collection, id)
    }

    fn owned_by(&self, collection: Collection, owner: &str) -> StoreResult<Vec<Value>> {
        self.inner.owned_by(collection, owner)
    }

    fn scan(
        &self,
        collection: Collection,
        query: &Query,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Page> {
        self.inner.scan(collection, query, after, limit)
    }

    fn search(&self, collection: Collection, request: &SearchRequest) -> StoreResult<Vec<Value>> {
        self.inner.search(collection, request)
    }

    fn count(&self, collection: Collection, query: &Query) -> StoreResult<usize> {
        self.inner.count(collection, query)
    }

    fn refresh(&self) -> StoreResult<()> {
        self.inner.refresh()
    }
}

// ============================================================================
// Ingestion and writer
// ============================================================================

/// One active and one inactive element give one bulk call with one upsert
/// and one delete
#[tokio::test]
async fn test_active_and_inactive_record_single_bulk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("AS_ADDROBJ_1.XML");
    std::fs::write(
        &path,
        address_xml(&[
            object("live", "", 1, "г", "Москва", true),
            object("dead", "", 1, "г", "Ленинград", false),
        ]),
    )
    .unwrap();

    let store = Arc::new(FaultStore::new());
    let (tx, writer) = BatchWriter::<AddressObject>::new(store.clone(), 1000).spawn(16);
    let reader_path = path.clone();
    let ingest = tokio::task::spawn_blocking(move || {
        let progress = ImportProgress::new(reader_path.clone(), true);
        ingest_file::<AddressObject>(&reader_path, &tx, &progress)
    });
    let ingested = ingest.await.unwrap().unwrap();
    let written = writer.await.unwrap().unwrap();

    assert_eq!(ingested.records, 2);
    let calls = store.calls_for(Collection::Addresses);
    assert_eq!(calls.len(), 1);
    let kinds: Vec<_> = calls[0].iter().map(|op| (op.kind(), op.id().to_string())).collect();
    assert_eq!(kinds, vec![("delete", "dead".to_string()), ("index", "live".to_string())]);
    assert_eq!(written.upserts, 1);
    assert_eq!(written.deletes, 1);
}

#[tokio::test]
async fn test_writer_flush_barrier() {
    let store = Arc::new(FaultStore::new());
    let (tx, writer) = BatchWriter::<AddressObject>::new(store.clone(), 100).spawn(4);
    tx.send(WriterMsg::Record(AddressObject {
        ao_guid: "a".to_string(),
        act_status: 1,
        live_status: 1,
        ..Default::default()
    }))
    .await
    .unwrap();

    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    tx.send(WriterMsg::Flush(ack_tx)).await.unwrap();
    ack_rx.await.unwrap();
    assert!(load_address(store.as_ref(), "a").is_some());

    drop(tx);
    assert_eq!(writer.await.unwrap().unwrap().batches, 1);
}

// ============================================================================
// Full import
// ============================================================================

fn full_snapshot(root: &Path) {
    write_archive(
        root,
        1,
        ArchiveKind::Full,
        &[
            object("s1", "r2", 7, "ул", "Ленина", true),
            object("r1", "", 1, "обл", "Московская", true),
            object("gone", "r2", 7, "ул", "Старая", true),
            object("r2", "r1", 2, "окр", "Северный", true),
            object("hist", "r2", 7, "ул", "Историческая", false),
        ],
        &[
            house("h1", "s1", "5", "1", "2079-06-06"),
            house("h2", "s1", "9", "", "2000-01-01"),
        ],
    );
}

#[tokio::test]
async fn test_full_import_builds_hierarchy() {
    let dir = TempDir::new().unwrap();
    full_snapshot(dir.path());
    let store: Arc<dyn DocumentStore> = Arc::new(SledStore::open(&dir.path().join("store")).unwrap());
    let archive = Arc::new(RecordingArchive::new(dir.path()));
    let coordinator = coordinator(store.clone(), vec![version_info(1)], archive.clone());

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.kind, ImportKind::Full);
    assert_eq!(report.versions_applied, vec![1]);
    assert_eq!(archive.fetched(), vec![(1, ArchiveKind::Full)]);
    assert_eq!(report.addresses.processed, 5);
    assert_eq!(report.addresses.deletes, 1);

    let street = load_address(store.as_ref(), "s1").unwrap();
    assert_eq!(street.full_address, "обл Московская, окр Северный, ул Ленина");
    assert_eq!(street.hierarchy.region.name, "Северный");
    assert_eq!(street.hierarchy.street.guid, "s1");
    assert!(load_address(store.as_ref(), "hist").is_none());

    let h1 = load_house(store.as_ref(), "h1").unwrap();
    assert_eq!(h1.full_address, "обл Московская, окр Северный, ул Ленина, д 5 корп 1");
    assert!(load_house(store.as_ref(), "h2").is_none());

    let latest = coordinator.latest_version().unwrap().unwrap();
    assert_eq!(latest.version_id, 1);
    assert_eq!(latest.address_count, 5);
    assert_eq!(latest.house_count, 2);

    let query = AddressQuery::new(store.clone());
    let found = query.search("ленина", None, 0, 10);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].ao_guid, "s1");
    assert_eq!(query.get_houses("s1", 0, 10).len(), 1);

    // A second run has nothing to do
    let again = coordinator.run().await.unwrap();
    assert_eq!(again.kind, ImportKind::UpToDate);
    assert!(again.versions_applied.is_empty());
}

// ============================================================================
// Delta import
// ============================================================================

#[tokio::test]
async fn test_delta_keeps_denormalized_fields_and_applies_changes() {
    let dir = TempDir::new().unwrap();
    full_snapshot(dir.path());
    let store: Arc<dyn DocumentStore> = Arc::new(SledStore::open(&dir.path().join("store")).unwrap());
    let archive = Arc::new(RecordingArchive::new(dir.path()));

    coordinator(store.clone(), vec![version_info(1)], archive.clone())
        .run_full_import()
        .await
        .unwrap();

    // Raw postal code change for s1, a new lane, a removed street, a new house
    let changed_s1 = object("s1", "r2", 7, "ул", "Ленина", true).replace(
        "REGIONCODE=\"50\"",
        "REGIONCODE=\"50\" POSTALCODE=\"141000\"",
    );
    write_archive(
        dir.path(),
        2,
        ArchiveKind::Delta,
        &[
            changed_s1,
            object("s2", "r2", 7, "пер", "Тихий", true),
            object("gone", "r2", 7, "ул", "Старая", false),
        ],
        &[house("h3", "s1", "7", "", "")],
    );

    let coordinator = coordinator(
        store.clone(),
        vec![version_info(1), version_info(2)],
        archive.clone(),
    );
    let report = coordinator.run_incremental_import().await.unwrap();

    assert_eq!(report.kind, ImportKind::Delta);
    assert_eq!(report.versions_applied, vec![2]);
    assert_eq!(archive.fetched().last(), Some(&(2, ArchiveKind::Delta)));

    let s1 = load_address(store.as_ref(), "s1").unwrap();
    assert_eq!(s1.postal_code, "141000");
    assert_eq!(s1.full_address, "обл Московская, окр Северный, ул Ленина");
    assert_eq!(s1.hierarchy.region.guid, "r2");

    let s2 = load_address(store.as_ref(), "s2").unwrap();
    assert_eq!(s2.full_address, "обл Московская, окр Северный, пер Тихий");
    assert!(load_address(store.as_ref(), "gone").is_none());

    let h3 = load_house(store.as_ref(), "h3").unwrap();
    assert_eq!(h3.full_address, "обл Московская, окр Северный, ул Ленина, д 7");
    // Untouched house keeps what the full import gave it
    let h1 = load_house(store.as_ref(), "h1").unwrap();
    assert_eq!(h1.full_address, "обл Московская, окр Северный, ул Ленина, д 5 корп 1");

    assert_eq!(coordinator.latest_version().unwrap().unwrap().version_id, 2);
}

#[tokio::test]
async fn test_deltas_applied_in_order_after_local() {
    let dir = TempDir::new().unwrap();
    for id in [5, 6, 7, 8] {
        write_archive(
            dir.path(),
            id,
            ArchiveKind::Delta,
            &[object(&format!("r{}", id), "", 1, "обл", &format!("Регион {}", id), true)],
            &[],
        );
    }
    let store: Arc<dyn DocumentStore> = Arc::new(SledStore::open(&dir.path().join("store")).unwrap());
    seed_version(store.as_ref(), 6);
    let archive = Arc::new(RecordingArchive::new(dir.path()));
    let catalog = vec![version_info(8), version_info(5), version_info(7), version_info(6)];
    let coordinator = coordinator(store.clone(), catalog, archive.clone());

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.kind, ImportKind::Delta);
    assert_eq!(report.versions_applied, vec![7, 8]);
    assert_eq!(
        archive.fetched(),
        vec![(7, ArchiveKind::Delta), (8, ArchiveKind::Delta)]
    );
    assert!(load_address(store.as_ref(), "r5").is_none());
    assert!(load_address(store.as_ref(), "r6").is_none());
    assert!(load_address(store.as_ref(), "r8").is_some());
    assert_eq!(coordinator.latest_version().unwrap().unwrap().version_id, 8);
}

/// A crash before version 4's row is saved makes the next run redo 4
#[tokio::test]
async fn test_crash_before_version_row_reprocesses_version() {
    let dir = TempDir::new().unwrap();
    for id in [4, 5] {
        write_archive(
            dir.path(),
            id,
            ArchiveKind::Delta,
            &[object(&format!("r{}", id), "", 1, "обл", &format!("Регион {}", id), true)],
            &[],
        );
    }
    let store = Arc::new(FaultStore::new());
    seed_version(store.as_ref(), 3);
    let version_4 = Version::id_for(4);
    store.fail_when(Box::new(move |collection, ops| {
        collection == Collection::Versions && ops.iter().any(|op| op.id() == version_4)
    }));

    let archive = Arc::new(RecordingArchive::new(dir.path()));
    let catalog = vec![version_info(3), version_info(4), version_info(5)];
    let coordinator = coordinator(store.clone(), catalog, archive.clone());

    let first = coordinator.run().await;
    assert!(matches!(first, Err(ImportError::Backend(_))));
    assert_eq!(coordinator.latest_version().unwrap().unwrap().version_id, 3);
    // Data of version 4 was written before the crash
    assert!(load_address(store.as_ref(), "r4").is_some());

    store.heal();
    let second = coordinator.run().await.unwrap();
    assert_eq!(second.versions_applied, vec![4, 5]);
    assert_eq!(
        archive.fetched(),
        vec![
            (4, ArchiveKind::Delta),
            (4, ArchiveKind::Delta),
            (5, ArchiveKind::Delta)
        ]
    );

    let versions: Vec<String> = store
        .calls_for(Collection::Versions)
        .into_iter()
        .flatten()
        .map(|op| op.id().to_string())
        .collect();
    assert_eq!(
        versions,
        vec![Version::id_for(3), Version::id_for(4), Version::id_for(5)]
    );
}

#[tokio::test]
async fn test_bulk_failure_aborts_without_version_row() {
    let dir = TempDir::new().unwrap();
    full_snapshot(dir.path());
    let store = Arc::new(FaultStore::new());
    store.fail_when(Box::new(|collection, _| collection == Collection::Houses));

    let archive = Arc::new(RecordingArchive::new(dir.path()));
    let coordinator = coordinator(store.clone(), vec![version_info(1)], archive);

    let result = coordinator.run().await;
    assert!(result.is_err());
    assert!(coordinator.latest_version().unwrap().is_none());
}

#[tokio::test]
async fn test_incremental_requires_local_version() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(SledStore::open(&dir.path().join("store")).unwrap());
    let archive = Arc::new(RecordingArchive::new(dir.path()));
    let coordinator = coordinator(store, vec![version_info(1)], archive.clone());

    let result = coordinator.run_incremental_import().await;
    assert!(matches!(result, Err(ImportError::VersionCatalog(_))));
    assert!(archive.fetched().is_empty());
}

/// Archive listing an address file that does not exist next to real dumps
struct MissingFileArchive {
    inner: ExtractedDirArchive,
}

#[async_trait]
impl ArchiveSource for MissingFileArchive {
    async fn fetch(&self, version: &VersionInfo, kind: ArchiveKind) -> Result<ArchiveFiles, ImportError> {
        let mut files = self.inner.fetch(version, kind).await?;
        let missing = files.root.join("AS_ADDROBJ_0_missing.XML");
        files.addresses.insert(0, missing);
        Ok(files)
    }
}

#[tokio::test]
async fn test_unreadable_file_does_not_stop_siblings() {
    let dir = TempDir::new().unwrap();
    full_snapshot(dir.path());
    let store: Arc<dyn DocumentStore> =
        Arc::new(SledStore::open(&dir.path().join("store")).unwrap());
    let archive = Arc::new(MissingFileArchive {
        inner: ExtractedDirArchive::new(dir.path()),
    });
    let coordinator = coordinator(store.clone(), vec![version_info(1)], archive);

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.versions_applied, vec![1]);
    assert_eq!(report.addresses.processed, 5);
    let street = load_address(store.as_ref(), "s1").unwrap();
    assert_eq!(street.full_address, "обл Московская, окр Северный, ул Ленина");
    assert!(load_house(store.as_ref(), "h1").is_some());
    assert_eq!(coordinator.latest_version().unwrap().unwrap().version_id, 1);
}

#[tokio::test]
async fn test_historical_row_in_later_batch_keeps_live_record() {
    let dir = TempDir::new().unwrap();
    let retired = object("s1", "r1", 7, "ул", "Ленина", false).replace("AOID=\"s1-id\"", "AOID=\"s1-old\"");
    write_archive(
        dir.path(),
        1,
        ArchiveKind::Full,
        &[
            object("r1", "", 1, "обл", "Тульская", true),
            object("s1", "r1", 7, "ул", "Ленина", true),
            object("f1", "r1", 7, "ул", "Мира", true),
            retired,
        ],
        &[],
    );
    let store: Arc<dyn DocumentStore> =
        Arc::new(SledStore::open(&dir.path().join("store")).unwrap());
    let archive = Arc::new(RecordingArchive::new(dir.path()));

    let report = coordinator(store.clone(), vec![version_info(1)], archive)
        .run()
        .await
        .unwrap();

    assert_eq!(report.addresses.superseded, 1);
    assert_eq!(report.addresses.deletes, 0);
    let street = load_address(store.as_ref(), "s1").unwrap();
    assert_eq!(street.ao_id, "s1-id");
    assert_eq!(street.full_address, "обл Тульская, ул Ленина");
}
