//! Integrity service
//!
//! The inbound interface: callers submit alignments, read records back and
//! delete them. Write ordering is what keeps the two stores consistent:
//!
//! - submit: analyze, write every artifact and backup, confirm they exist,
//!   then create the registry record (all under the new record's lock)
//! - delete: remove the registry record first, then the artifacts
//!
//! A crash between the steps leaves either orphan artifacts or a record with
//! missing artifacts; reconciliation closes both.

use crate::analysis::{self, AnalysisEngine, AnalysisOutput, PositionResult};
use crate::config::ServiceConfig;
use crate::error::{IntegrityError, Result, StoreError};
use crate::locks::RecordLocks;
use crate::reconcile::{ReconcileReport, ReconciliationService, RecordOutcome, VerifyReport};
use crate::registry::{Record, RecordSummary, Registry, RegistryStatistics, Workspace};
use crate::store::{artifact_name, ArtifactStore, StoreHandle};
use chrono::Utc;
use mscope_common::config::RootLayout;
use mscope_common::db::{database_url, init_database};
use mscope_common::events::{ArtifactKind, EventBus, MscopeEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A record with its materialized results
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub record: Record,
    pub positions: Vec<PositionResult>,
}

impl RecordView {
    pub fn conserved_count(&self) -> u32 {
        self.record.summary.conserved_count()
    }
}

pub struct IntegrityService {
    registry: Arc<Registry>,
    store: StoreHandle,
    engine: AnalysisEngine,
    locks: Arc<RecordLocks>,
    events: EventBus,
    reconciler: Arc<ReconciliationService>,
    config: ServiceConfig,
}

impl IntegrityService {
    /// Open (or create) everything under `layout`: database, settings,
    /// registry table and artifact directories
    pub async fn open(layout: &RootLayout, events: EventBus) -> Result<Self> {
        layout.ensure_directories()?;

        let db_path = layout.database_path();
        let pool = init_database(&db_path).await?;
        let config = ServiceConfig::from_database(&pool).await;
        debug!(?config, "Loaded service configuration");

        let registry = Registry::new(database_url(&db_path), pool, config.registry_policy()).await?;
        let store = ArtifactStore::open(layout.artifacts_dir(), layout.backups_dir())?;

        Ok(Self::from_parts(Arc::new(registry), store, config, events))
    }

    /// Assemble from already-open components
    pub fn from_parts(registry: Arc<Registry>, store: ArtifactStore, config: ServiceConfig, events: EventBus) -> Self {
        let store = StoreHandle::new(store, config.store_policy());
        let engine = AnalysisEngine::new(config.analysis_options());
        let locks = Arc::new(RecordLocks::new());
        let reconciler = Arc::new(ReconciliationService::new(
            Arc::clone(&registry),
            store.clone(),
            engine.clone(),
            Arc::clone(&locks),
            events.clone(),
            &config,
        ));

        Self {
            registry,
            store,
            engine,
            locks,
            events,
            reconciler,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        self.store.inner()
    }

    pub fn reconciler(&self) -> Arc<ReconciliationService> {
        Arc::clone(&self.reconciler)
    }

    /// Analyze `source`, persist its artifacts, register a record
    pub async fn submit_analysis(
        &self,
        source: Vec<u8>,
        workspace: Workspace,
        keyword: &str,
        display_name: &str,
    ) -> Result<Uuid> {
        if keyword.trim().is_empty() {
            return Err(IntegrityError::InvalidInput("keyword must not be empty".to_string()));
        }

        // Input errors surface here, before anything is written
        let (source, output) = self.analyze(source).await?;
        let results = output.results_bytes()?;
        let export = output.export_bytes()?;

        let id = Uuid::new_v4();
        let _guard = self.locks.lock(id).await;
        let record = Record::new(id, workspace, keyword, display_name, output.summary);

        if let Err(e) = self.persist(&record, source, results, export).await {
            warn!(record_id = %id, error = %e, "Artifact write failed, rolling back");
            self.discard_artifacts(&record).await;
            return Err(e);
        }

        if let Err(e) = self.registry.create(&record).await {
            warn!(record_id = %id, error = %e, "Registry create failed, rolling back artifacts");
            self.discard_artifacts(&record).await;
            return Err(e);
        }

        info!(
            record_id = %id,
            workspace = %workspace,
            positions = record.summary.total_positions,
            mutations = record.summary.mutation_count,
            "Analysis submitted"
        );
        self.events.emit_lossy(MscopeEvent::RecordCreated {
            record_id: id,
            workspace: workspace.to_string(),
            timestamp: Utc::now(),
        });

        Ok(id)
    }

    /// Record plus parsed results, with one inline repair if results are missing
    pub async fn fetch_record(&self, id: Uuid, keyword: Option<&str>) -> Result<RecordView> {
        let record = self.get_record(id, keyword).await?;

        let (record, bytes) = match self.read_artifact(&record, ArtifactKind::Results).await {
            Ok(bytes) => (record, bytes),
            Err(e) if is_missing(&e) => {
                let record = self.repair_inline(id, keyword).await?;
                let bytes = self
                    .read_artifact(&record, ArtifactKind::Results)
                    .await
                    .map_err(|_| IntegrityError::RecordUnavailable(id))?;
                (record, bytes)
            }
            Err(e) => return Err(e),
        };

        Ok(RecordView {
            positions: analysis::parse_results(&bytes)?,
            record,
        })
    }

    /// CSV export of a record, with one inline repair if it is missing
    pub async fn export_bytes(&self, id: Uuid, keyword: Option<&str>) -> Result<Vec<u8>> {
        let record = self.get_record(id, keyword).await?;

        match self.read_artifact(&record, ArtifactKind::Export).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if is_missing(&e) => {
                let record = self.repair_inline(id, keyword).await?;
                self.read_artifact(&record, ArtifactKind::Export)
                    .await
                    .map_err(|_| IntegrityError::RecordUnavailable(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Records of one scope, newest first
    pub async fn list_records(&self, workspace: Workspace, keyword: &str, limit: Option<u32>) -> Result<Vec<RecordSummary>> {
        let records = self.registry.list(workspace, keyword, limit).await?;
        Ok(records.iter().map(RecordSummary::from).collect())
    }

    /// Delete a record and its artifacts. Returns the number of files removed.
    pub async fn delete_record(&self, id: Uuid) -> Result<usize> {
        let _guard = self.locks.lock(id).await;

        let record = self
            .registry
            .delete(id)
            .await?
            .ok_or(IntegrityError::RecordNotFound(id))?;
        let removed = self.remove_artifacts(&record).await?;

        info!(record_id = %id, artifacts_removed = removed, "Record deleted");
        self.events.emit_lossy(MscopeEvent::RecordDeleted {
            record_id: id,
            artifacts_removed: removed,
            timestamp: Utc::now(),
        });
        Ok(removed)
    }

    /// Delete every record of one scope. Returns (records deleted, files removed).
    ///
    /// The registry rows are gone once `delete_scope` commits, so a failed
    /// artifact cleanup is logged and left for the orphan sweep.
    pub async fn clear_workspace(&self, workspace: Workspace, keyword: &str) -> Result<(usize, usize)> {
        let records = self.registry.delete_scope(workspace, keyword).await?;

        let mut removed = 0;
        for record in &records {
            let _guard = self.locks.lock(record.id).await;
            let count = self.remove_artifacts(record).await.unwrap_or_else(|e| {
                warn!(record_id = %record.id, error = %e, "Artifact cleanup failed, leaving it to reconciliation");
                0
            });
            removed += count;
            self.events.emit_lossy(MscopeEvent::RecordDeleted {
                record_id: record.id,
                artifacts_removed: count,
                timestamp: Utc::now(),
            });
        }

        info!(workspace = %workspace, records = records.len(), files = removed, "Workspace cleared");
        Ok((records.len(), removed))
    }

    pub async fn statistics(&self) -> Result<RegistryStatistics> {
        self.registry.statistics().await
    }

    /// Run one full reconciliation pass now
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        self.reconciler.run_pass(&CancellationToken::new()).await
    }

    /// Read-only consistency report
    pub async fn verify(&self) -> Result<VerifyReport> {
        self.reconciler.verify().await
    }

    async fn analyze(&self, source: Vec<u8>) -> Result<(Vec<u8>, AnalysisOutput)> {
        let engine = self.engine.clone();
        let (source, output) = tokio::task::spawn_blocking(move || {
            let output = engine.analyze(&source);
            (source, output)
        })
        .await?;
        Ok((source, output?))
    }

    async fn persist(&self, record: &Record, source: Vec<u8>, results: Vec<u8>, export: Vec<u8>) -> Result<()> {
        let source_name = artifact_name(record.id, ArtifactKind::Source);
        let results_name = artifact_name(record.id, ArtifactKind::Results);
        let export_name = artifact_name(record.id, ArtifactKind::Export);

        self.store.put_mirrored(&source_name, source).await?;
        self.store.put_mirrored(&results_name, results).await?;
        self.store.put(&export_name, export).await?;

        for name in [&source_name, &results_name, &export_name] {
            if !self.store.exists(name).await? {
                return Err(IntegrityError::ArtifactMissing(name.clone()));
            }
        }
        for name in [&source_name, &results_name] {
            if !self.store.backup_exists(name).await? {
                return Err(IntegrityError::BackupMissing(name.clone()));
            }
        }

        Ok(())
    }

    /// Best-effort removal after a failed submission; reconciliation catches leftovers
    async fn discard_artifacts(&self, record: &Record) {
        if let Err(e) = self.remove_artifacts(record).await {
            warn!(record_id = %record.id, error = %e, "Cleanup after failed submission incomplete");
        }
    }

    async fn remove_artifacts(&self, record: &Record) -> Result<usize> {
        let names = record.artifact_refs().into_iter().map(str::to_string).collect();
        self.store.delete_record_artifacts(record.id, names).await
    }

    async fn get_record(&self, id: Uuid, keyword: Option<&str>) -> Result<Record> {
        self.registry
            .get(id, keyword)
            .await?
            .ok_or(IntegrityError::RecordNotFound(id))
    }

    async fn read_artifact(&self, record: &Record, kind: ArtifactKind) -> Result<Vec<u8>> {
        let name = record
            .artifact_ref(kind)
            .ok_or_else(|| IntegrityError::ArtifactMissing(format!("{} has no {:?} artifact", record.id, kind)))?;
        self.store.get(name).await
    }

    async fn repair_inline(&self, id: Uuid, keyword: Option<&str>) -> Result<Record> {
        info!(record_id = %id, "Artifact missing on read, attempting inline repair");
        let (outcome, _) = self.reconciler.repair(id).await?;
        if matches!(outcome, RecordOutcome::Deleted | RecordOutcome::Gone) {
            return Err(IntegrityError::RecordUnavailable(id));
        }
        self.registry
            .get(id, keyword)
            .await?
            .ok_or(IntegrityError::RecordUnavailable(id))
    }
}

fn is_missing(err: &IntegrityError) -> bool {
    matches!(
        err,
        IntegrityError::Store(StoreError::NotFound(_)) | IntegrityError::ArtifactMissing(_)
    )
}
