//! Version reconciliation coordinator that orchestrates import cycles

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::archive::{ArchiveFiles, ArchiveKind, ArchiveSource, ExtractedDirArchive};
use super::catalog::{HttpVersionCatalog, VersionCatalog, VersionInfo};
use super::progress::ImportProgress;
use super::source::{ImportError, IngestStats, XmlRecord};
use super::xml::ingest_file;
use crate::config::{Config, ImportConfig};
use crate::index::{
    AddressIndexer, BatchWriter, HouseIndexer, HouseStats, IndexStats, Selection, WriteStats,
};
use crate::store::{BulkOp, Collection, DocumentStore, Query, SearchRequest, SledStore, Sort};
use crate::types::{now_millis, AddressObject, Document, HouseObject, Version};

// ============================================================================
// Planning
// ============================================================================

/// What an import run has to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportPlan {
    /// Load the complete snapshot of this version
    Full(VersionInfo),
    /// Apply these changesets, oldest first
    Delta(Vec<VersionInfo>),
    /// Nothing newer than the local version is published
    UpToDate,
}

impl ImportPlan {
    pub fn kind(&self) -> ImportKind {
        match self {
            ImportPlan::Full(_) => ImportKind::Full,
            ImportPlan::Delta(_) => ImportKind::Delta,
            ImportPlan::UpToDate => ImportKind::UpToDate,
        }
    }
}

/// Decide between a full import, a delta chain and doing nothing.
///
/// A delta chain needs a local version, no force flag, a delta archive for
/// every pending version, and either the local id in the catalog or the
/// oldest pending id directly following it.
pub fn plan_import(
    local: Option<&Version>,
    catalog: &[VersionInfo],
    force: bool,
) -> Result<ImportPlan, ImportError> {
    let latest = catalog
        .iter()
        .max_by_key(|v| v.version_id)
        .ok_or_else(|| ImportError::VersionCatalog("catalog lists no versions".to_string()))?;

    let local = match local {
        Some(local) if !force => local,
        _ => return Ok(ImportPlan::Full(latest.clone())),
    };

    let mut pending: Vec<VersionInfo> = catalog
        .iter()
        .filter(|v| v.version_id > local.version_id)
        .cloned()
        .collect();
    if pending.is_empty() {
        return Ok(ImportPlan::UpToDate);
    }
    pending.sort_by_key(|v| v.version_id);
    pending.dedup_by_key(|v| v.version_id);

    let anchored = catalog.iter().any(|v| v.version_id == local.version_id)
        || pending[0].version_id == local.version_id + 1;
    if anchored && pending.iter().all(VersionInfo::has_delta) {
        Ok(ImportPlan::Delta(pending))
    } else {
        Ok(ImportPlan::Full(latest.clone()))
    }
}

// ============================================================================
// Run state and report
// ============================================================================

/// States of one coordinator run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    DeterminingStrategy,
    FullImport,
    DeltaImport(u32),
    Indexing,
    Done,
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportState::Idle => f.write_str("idle"),
            ImportState::DeterminingStrategy => f.write_str("determining strategy"),
            ImportState::FullImport => f.write_str("full import"),
            ImportState::DeltaImport(id) => write!(f, "delta import {}", id),
            ImportState::Indexing => f.write_str("indexing"),
            ImportState::Done => f.write_str("done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Full,
    Delta,
    UpToDate,
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub kind: ImportKind,
    /// Versions whose rows were written, in order
    pub versions_applied: Vec<u32>,
    pub addresses: WriteStats,
    pub houses: WriteStats,
    pub ingest: IngestStats,
    pub indexed: u64,
    pub houses_indexed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ImportReport {
    fn new(run_id: Uuid, kind: ImportKind, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            kind,
            versions_applied: Vec::new(),
            addresses: WriteStats::default(),
            houses: WriteStats::default(),
            ingest: IngestStats::default(),
            indexed: 0,
            houses_indexed: 0,
            started_at,
            finished_at: started_at,
        }
    }
}

/// Counters of one version cycle
#[derive(Debug, Default)]
struct CycleStats {
    addresses: WriteStats,
    houses: WriteStats,
    ingest: IngestStats,
    indexed: u64,
    houses_indexed: u64,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives full and delta import cycles against one store
pub struct ImportCoordinator {
    store: Arc<dyn DocumentStore>,
    catalog: Arc<dyn VersionCatalog>,
    archive: Arc<dyn ArchiveSource>,
    config: ImportConfig,
}

impl ImportCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        catalog: Arc<dyn VersionCatalog>,
        archive: Arc<dyn ArchiveSource>,
        config: ImportConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            archive,
            config,
        }
    }

    /// Wire the default collaborators from configuration
    pub fn from_config(config: &Config) -> Result<Self, ImportError> {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let store = Arc::new(SledStore::open(&config.store.data_dir)?);
        let catalog = Arc::new(HttpVersionCatalog::new(&config.catalog)?);
        let archive = Arc::new(ExtractedDirArchive::new(config.import.archive_dir.clone()));
        Ok(Self::new(store, catalog, archive, config.import.clone()))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Most recent version row, if any import ever finished
    pub fn latest_version(&self) -> Result<Option<Version>, ImportError> {
        let request = SearchRequest::new(Query::MatchAll)
            .with_sort(Sort::Field {
                field: "version_id".to_string(),
                ascending: false,
            })
            .with_page(0, 1);
        let docs = self.store.search(Collection::Versions, &request)?;
        match docs.into_iter().next() {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Reconcile with the catalog and run whatever cycles are needed
    pub async fn run(&self) -> Result<ImportReport, ImportError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        transition(run_id, ImportState::Idle);
        transition(run_id, ImportState::DeterminingStrategy);

        let local = self.latest_version()?;
        let catalog = self.catalog.all_versions().await?;
        let plan = plan_import(local.as_ref(), &catalog, self.config.force_full)?;

        let mut report = ImportReport::new(run_id, plan.kind(), started_at);
        match plan {
            ImportPlan::UpToDate => {
                info!(
                    "[{}] Already current at version {}",
                    run_id,
                    local.map(|v| v.version_id).unwrap_or_default()
                );
            }
            ImportPlan::Full(version) => {
                self.full_cycle(run_id, &version, &mut report).await?;
            }
            ImportPlan::Delta(pending) => {
                self.delta_cycles(run_id, started_at, &pending, &mut report).await?;
            }
        }

        transition(run_id, ImportState::Done);
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Import the complete snapshot of the newest published version
    pub async fn run_full_import(&self) -> Result<ImportReport, ImportError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let version = self.catalog.last_version().await?;
        let mut report = ImportReport::new(run_id, ImportKind::Full, started_at);
        self.full_cycle(run_id, &version, &mut report).await?;
        transition(run_id, ImportState::Done);
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Apply every pending delta after the local version.
    ///
    /// Fails when no local version exists or no delta chain can be formed.
    pub async fn run_incremental_import(&self) -> Result<ImportReport, ImportError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let local = self.latest_version()?.ok_or_else(|| {
            ImportError::VersionCatalog("no local version, a full import is required".to_string())
        })?;
        let catalog = self.catalog.all_versions().await?;

        let mut report = ImportReport::new(run_id, ImportKind::Delta, started_at);
        match plan_import(Some(&local), &catalog, false)? {
            ImportPlan::UpToDate => {
                report.kind = ImportKind::UpToDate;
                info!("[{}] Already current at version {}", run_id, local.version_id);
            }
            ImportPlan::Delta(pending) => {
                self.delta_cycles(run_id, started_at, &pending, &mut report).await?;
            }
            ImportPlan::Full(_) => {
                return Err(ImportError::VersionCatalog(format!(
                    "no delta chain from local version {}",
                    local.version_id
                )));
            }
        }
        transition(run_id, ImportState::Done);
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Denormalize stored addresses and attach street addresses to houses.
    ///
    /// Full reindexes cover everything; otherwise `since_guids` limits the
    /// pass to those objects, or objects written from `cutoff_ms` on.
    pub async fn reindex(
        &self,
        is_full: bool,
        cutoff_ms: i64,
        since_guids: Option<Vec<String>>,
    ) -> Result<(IndexStats, HouseStats), ImportError> {
        let selection = Selection::resolve(is_full, cutoff_ms, since_guids);
        let indexer = AddressIndexer::new(self.store.clone(), self.config.cache_capacity)
            .with_workers(self.config.workers)
            .with_batch_size(self.config.batch_size)
            .with_channel_capacity(self.config.channel_capacity);
        let (house_tx, house_stage) = HouseIndexer::new(self.store.clone(), self.config.batch_size)
            .spawn(self.config.channel_capacity);

        let indexed = indexer.reindex(selection, Some(house_tx)).await;
        let houses = house_stage.await?;
        let result = match (indexed, houses) {
            (Ok(indexed), Ok(houses)) => Ok((indexed, houses)),
            // The house stage stopped first; its error is the cause
            (Err(ImportError::ChannelClosed(_)), Err(e)) => Err(e),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };
        self.store.refresh()?;
        result
    }

    // ------------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------------

    async fn full_cycle(
        &self,
        run_id: Uuid,
        version: &VersionInfo,
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        transition(run_id, ImportState::FullImport);
        info!(
            "[{}] Full import of version {} ({})",
            run_id, version.version_id, version.text_version
        );
        self.ensure_collections()?;

        let files = self.archive.fetch(version, ArchiveKind::Full).await?;
        let mut cycle = self.import_archive(&files, true).await?;

        transition(run_id, ImportState::Indexing);
        let (indexed, houses) = self.reindex(true, 0, None).await?;
        cycle.indexed = indexed.indexed;
        cycle.houses_indexed = houses.houses;

        self.save_version(version, &cycle)?;
        absorb(report, version.version_id, cycle);
        Ok(())
    }

    async fn delta_cycles(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        pending: &[VersionInfo],
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        self.ensure_collections()?;
        let cutoff = started_at.timestamp_millis();
        info!(
            "[{}] Applying {} delta version(s): {:?}",
            run_id,
            pending.len(),
            pending.iter().map(|v| v.version_id).collect::<Vec<_>>()
        );

        for version in pending {
            transition(run_id, ImportState::DeltaImport(version.version_id));
            let result = self.delta_cycle(run_id, version, cutoff).await;
            let cycle = match result {
                Ok(cycle) => cycle,
                Err(e) => {
                    error!(
                        "[{}] Delta {} failed, the next run resumes from it: {}",
                        run_id, version.version_id, e
                    );
                    return Err(e);
                }
            };
            absorb(report, version.version_id, cycle);
        }
        Ok(())
    }

    async fn delta_cycle(
        &self,
        run_id: Uuid,
        version: &VersionInfo,
        cutoff: i64,
    ) -> Result<CycleStats, ImportError> {
        let files = self.archive.fetch(version, ArchiveKind::Delta).await?;
        let mut cycle = self.import_archive(&files, false).await?;

        transition(run_id, ImportState::Indexing);
        let (indexed, houses) = self.reindex(false, cutoff, None).await?;
        cycle.indexed = indexed.indexed;
        cycle.houses_indexed = houses.houses;

        // Streets whose houses changed get their address pushed down again
        let touched: Vec<String> = cycle.houses.touched_parents.iter().cloned().collect();
        if !touched.is_empty() {
            info!(
                "[{}] Reindexing {} streets with changed houses",
                run_id,
                touched.len()
            );
            let (_, houses) = self.reindex(false, cutoff, Some(touched)).await?;
            cycle.houses_indexed += houses.houses;
        }

        self.save_version(version, &cycle)?;
        Ok(cycle)
    }

    fn ensure_collections(&self) -> Result<(), ImportError> {
        for collection in Collection::ALL {
            self.store.ensure_collection(collection)?;
        }
        Ok(())
    }

    /// Stream both file types into their writers concurrently
    async fn import_archive(&self, files: &ArchiveFiles, is_full: bool) -> Result<CycleStats, ImportError> {
        if files.is_empty() {
            warn!("No dump files found in {}", files.root.display());
        }
        let (addresses, houses) = tokio::try_join!(
            self.import_files::<AddressObject>(files.addresses.clone(), !is_full),
            self.import_files::<HouseObject>(files.houses.clone(), !is_full),
        )?;
        self.store.refresh()?;

        let mut ingest = addresses.0;
        ingest.merge(&houses.0);
        Ok(CycleStats {
            addresses: addresses.1,
            houses: houses.1,
            ingest,
            ..Default::default()
        })
    }

    /// One reader over the files of a type, feeding one writer
    async fn import_files<R>(
        &self,
        files: Vec<PathBuf>,
        merge_stored: bool,
    ) -> Result<(IngestStats, WriteStats), ImportError>
    where
        R: XmlRecord + Document,
    {
        let (tx, writer) = BatchWriter::<R>::new(self.store.clone(), self.config.batch_size)
            .with_merge_stored(merge_stored)
            .spawn(self.config.channel_capacity);

        let quiet = self.config.quiet;
        let reader = tokio::task::spawn_blocking(move || {
            let mut total = IngestStats::default();
            for path in files {
                let progress = ImportProgress::new(path.clone(), quiet);
                match ingest_file::<R>(&path, &tx, &progress) {
                    Ok(stats) => total.merge(&stats),
                    // An unreadable file contributes nothing
                    Err(ImportError::Io(e)) => warn!("Cannot read {}: {}", path.display(), e),
                    Err(e) => {
                        progress.cancel();
                        return Err(e);
                    }
                }
                progress.finish();
            }
            Ok(total)
        });

        let ingested = reader.await?;
        let written = writer.await?;
        match (ingested, written) {
            (Ok(ingested), Ok(written)) => Ok((ingested, written)),
            // A stopped writer closes the channel under the reader
            (_, Err(e)) | (Err(e), Ok(_)) => Err(e),
        }
    }

    fn save_version(&self, info: &VersionInfo, cycle: &CycleStats) -> Result<(), ImportError> {
        let version = Version {
            version_id: info.version_id,
            text_version: info.text_version.clone(),
            update_date: info.date.clone().unwrap_or_default(),
            address_count: cycle.addresses.processed,
            house_count: cycle.houses.processed,
            created_at: now_millis(),
        };
        let op = BulkOp::Index {
            id: version.doc_id(),
            doc: serde_json::to_value(&version)?,
        };
        let response = self.store.bulk(Collection::Versions, vec![op])?;
        if response.has_errors() {
            return Err(ImportError::BulkCommit {
                collection: Collection::Versions,
                failures: response.failures(),
            });
        }
        self.store.refresh()?;
        info!(
            "Version {} ({}) applied: {} addresses, {} houses",
            version.version_id, version.text_version, version.address_count, version.house_count
        );
        Ok(())
    }
}

fn transition(run_id: Uuid, state: ImportState) {
    info!("[{}] -> {}", run_id, state);
}

fn absorb(report: &mut ImportReport, version_id: u32, cycle: CycleStats) {
    report.versions_applied.push(version_id);
    report.addresses.merge(cycle.addresses);
    report.houses.merge(cycle.houses);
    report.ingest.merge(&cycle.ingest);
    report.indexed += cycle.indexed;
    report.houses_indexed += cycle.houses_indexed;
}

/// Builder for ImportCoordinator with sensible defaults
pub struct ImportCoordinatorBuilder {
    store: Arc<dyn DocumentStore>,
    catalog: Option<Arc<dyn VersionCatalog>>,
    archive: Option<Arc<dyn ArchiveSource>>,
    config: ImportConfig,
}

impl ImportCoordinatorBuilder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            catalog: None,
            archive: None,
            config: ImportConfig::default(),
        }
    }

    /// Set import configuration
    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set indexer worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Always run full imports
    pub fn with_force_full(mut self, force: bool) -> Self {
        self.config.force_full = force;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn VersionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the archive source; defaults to the configured archive directory
    pub fn with_archive(mut self, archive: Arc<dyn ArchiveSource>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Set quiet mode
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.config.quiet = quiet;
        self
    }

    /// Build the coordinator
    pub fn build(self) -> Result<ImportCoordinator, ImportError> {
        let catalog = self.catalog.ok_or_else(|| {
            ImportError::Config("Version catalog is required. Call with_catalog() first.".into())
        })?;
        if self.config.batch_size == 0 || self.config.workers == 0 {
            return Err(ImportError::Config(
                "batch_size and workers must be positive".into(),
            ));
        }
        let archive = self
            .archive
            .unwrap_or_else(|| Arc::new(ExtractedDirArchive::new(self.config.archive_dir.clone())));
        Ok(ImportCoordinator::new(self.store, catalog, archive, self.config))
    }
}
