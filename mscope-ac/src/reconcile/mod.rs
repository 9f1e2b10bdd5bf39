//! Reconciliation service
//!
//! Brings the registry and the artifact store back into agreement. A pass
//! runs three phases, strictly in order:
//!
//! 1. per-record verification and repair (restore, regenerate, re-render,
//!    create missing backups, flag partial, delete irrecoverable)
//! 2. orphan artifact sweep: artifacts whose owning record id is not live
//! 3. orphan record sweep: records with neither source nor results left
//!
//! Every record-level mutation happens under that record's lock, and orphan
//! deletion re-checks the registry under the lock, so an in-flight
//! submission (which holds its lock from first write to registry create) is
//! never swept. A pass with no external change in between performs no
//! mutations.

pub mod report;
pub mod strategy;

pub use report::{Issue, ReconcileReport, VerifyReport};
pub use strategy::{has_backup, strategies_for, RecoveryStrategy};

use crate::analysis::{self, AnalysisEngine, AnalysisOutput};
use crate::config::ServiceConfig;
use crate::error::{IntegrityError, Result};
use crate::locks::RecordLocks;
use crate::registry::{Record, RecordPatch, RecordStatus, Registry};
use crate::store::{owner_id, StoreHandle};
use chrono::Utc;
use mscope_common::events::{ArtifactKind, EventBus, MscopeEvent};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to one record during repair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Nothing needed doing
    Consistent,
    /// At least one artifact was restored, regenerated or backed up
    Repaired,
    /// Source lost for good; results kept
    Partial,
    /// Neither source nor results could be recovered; record removed
    Deleted,
    /// The record no longer exists
    Gone,
}

/// Periodic registry/store reconciliation
pub struct ReconciliationService {
    registry: Arc<Registry>,
    store: StoreHandle,
    engine: AnalysisEngine,
    locks: Arc<RecordLocks>,
    events: EventBus,
    enabled: bool,
    interval: Duration,
    stale_temp_age: Duration,
}

impl ReconciliationService {
    pub fn new(
        registry: Arc<Registry>,
        store: StoreHandle,
        engine: AnalysisEngine,
        locks: Arc<RecordLocks>,
        events: EventBus,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            registry,
            store,
            engine,
            locks,
            events,
            enabled: config.reconcile_enabled,
            interval: config.reconcile_interval(),
            stale_temp_age: config.stale_temp_age(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the periodic loop. The first pass runs after one interval;
    /// callers run the startup pass themselves.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.enabled {
            info!("ReconciliationService disabled by configuration");
            return None;
        }

        info!("Starting ReconciliationService (interval: {}s)", self.interval.as_secs());

        Some(tokio::spawn(async move {
            let mut timer = interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }

                if let Err(e) = self.run_pass(&cancel).await {
                    error!("ReconciliationService: pass failed: {}", e);
                }
            }

            info!("ReconciliationService stopped");
        }))
    }

    /// One full pass. Cancellation is observed between records.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        info!("Reconciliation pass starting");

        match self.store.sweep_stale_temps(self.stale_temp_age).await {
            Ok(removed) => report.stale_temps_removed = removed,
            Err(e) => warn!(error = %e, "Stale temp sweep failed"),
        }

        // Phase 1
        let records = self.registry.list_all().await?;
        for record in records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(records_checked = report.records_checked, "Reconciliation pass cancelled");
                return Ok(report);
            }

            let id = record.id;
            let _guard = self.locks.lock(id).await;
            match self.reconcile_record(id, &mut report).await {
                Ok(RecordOutcome::Gone) => {}
                Ok(_) => report.records_checked += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(record_id = %id, error = %e, "Record reconciliation failed");
                }
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        // Phase 2
        self.sweep_orphan_artifacts(&mut report).await?;

        // Phase 3
        self.sweep_orphan_records(&mut report).await?;

        info!(
            records_checked = report.records_checked,
            issues_found = report.issues_found,
            issues_fixed = report.issues_fixed,
            restored = report.restored,
            regenerated = report.regenerated,
            backups_created = report.backups_created,
            records_deleted = report.records_deleted,
            artifacts_deleted = report.artifacts_deleted,
            "Reconciliation pass complete"
        );

        self.events.emit_lossy(MscopeEvent::ReconciliationCompleted {
            records_checked: report.records_checked,
            issues_found: report.issues_found,
            issues_fixed: report.issues_fixed,
            mutations: report.mutations(),
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    /// Repair a single record outside a pass (used for inline repair on read)
    pub async fn repair(&self, id: Uuid) -> Result<(RecordOutcome, ReconcileReport)> {
        let mut report = ReconcileReport::default();
        let _guard = self.locks.lock(id).await;
        let outcome = self.reconcile_record(id, &mut report).await?;
        Ok((outcome, report))
    }

    /// Read-only consistency check
    pub async fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let records = self.registry.list_all().await?;
        let live: HashSet<Uuid> = records.iter().map(|r| r.id).collect();

        for record in &records {
            report.records_checked += 1;
            for kind in [ArtifactKind::Source, ArtifactKind::Results, ArtifactKind::Export] {
                let Some(name) = record.artifact_ref(kind) else {
                    continue;
                };
                if !self.store.exists(name).await? {
                    report.issues.push(Issue::ArtifactMissing {
                        record_id: record.id,
                        kind,
                        name: name.to_string(),
                    });
                } else if has_backup(kind) && !self.store.backup_exists(name).await? {
                    report.issues.push(Issue::BackupMissing {
                        record_id: record.id,
                        kind,
                        name: name.to_string(),
                    });
                }
            }
        }

        for (names, backup) in [(self.store.list().await?, false), (self.store.list_backups().await?, true)] {
            for name in names {
                if matches!(owner_id(&name), Some(owner) if !live.contains(&owner)) {
                    report.issues.push(Issue::OrphanArtifact { name, backup });
                }
            }
        }

        Ok(report)
    }

    /// Verify and repair one record. Caller holds the record lock.
    async fn reconcile_record(&self, id: Uuid, report: &mut ReconcileReport) -> Result<RecordOutcome> {
        // Re-read under the lock; a concurrent delete may have won
        let Some(record) = self.registry.get(id, None).await? else {
            return Ok(RecordOutcome::Gone);
        };

        let fixed_before = report.issues_fixed;

        // Source first: regeneration of results depends on it
        let source_available = match record.source_ref.as_deref() {
            Some(name) => {
                self.ensure_artifact(&record, ArtifactKind::Source, name, None, report)
                    .await?
            }
            None => false,
        };

        // Results
        let mut results_bytes: Option<Vec<u8>> = None;
        if let Some(name) = record.results_ref.as_deref() {
            let source = if source_available { record.source_ref.as_deref() } else { None };
            if self
                .ensure_artifact(&record, ArtifactKind::Results, name, source, report)
                .await?
            {
                results_bytes = Some(self.store.get(name).await?);
            } else {
                warn!(record_id = %id, "Results irrecoverable, deleting record");
                self.delete_irrecoverable(&record, report).await?;
                return Ok(RecordOutcome::Deleted);
            }
        }

        let mut outcome = RecordOutcome::Consistent;
        if record.source_ref.is_some() && !source_available {
            self.mark_partial(&record, report).await?;
            outcome = RecordOutcome::Partial;
        }

        // Export
        if let Some(name) = record.export_ref.as_deref() {
            if !self.store.exists(name).await? {
                report.issues_found += 1;
                match &results_bytes {
                    Some(bytes) => {
                        self.render_export(&record, name, bytes, report).await?;
                    }
                    None => warn!(record_id = %id, "Export missing and no results to render from"),
                }
            }
        }

        if outcome == RecordOutcome::Consistent && report.issues_fixed > fixed_before {
            outcome = RecordOutcome::Repaired;
        }
        Ok(outcome)
    }

    /// Make sure the primary (and its backup) exist, walking the recovery
    /// strategies for `kind` if the primary is gone. Returns whether the
    /// primary is available afterwards.
    async fn ensure_artifact(
        &self,
        record: &Record,
        kind: ArtifactKind,
        name: &str,
        source: Option<&str>,
        report: &mut ReconcileReport,
    ) -> Result<bool> {
        if self.store.exists(name).await? {
            if has_backup(kind) && !self.store.backup_exists(name).await? {
                report.issues_found += 1;
                self.store.create_backup(name).await?;
                report.backups_created += 1;
                report.issues_fixed += 1;
                debug!(record_id = %record.id, artifact = name, "Backup created");
                self.events.emit_lossy(MscopeEvent::BackupCreated {
                    record_id: record.id,
                    kind,
                    timestamp: Utc::now(),
                });
            }
            return Ok(true);
        }

        info!(record_id = %record.id, artifact = name, "Artifact missing");
        report.issues_found += 1;

        for strategy in strategies_for(kind) {
            let recovered = match strategy {
                RecoveryStrategy::RestoreFromBackup => self.restore(record, kind, name, report).await?,
                RecoveryStrategy::RegenerateFromSource => match source {
                    Some(source) => self.regenerate(record, name, source, report).await?,
                    None => false,
                },
                // Export rendering needs the results bytes; handled by the caller
                RecoveryStrategy::RenderFromResults => false,
            };
            if recovered {
                report.issues_fixed += 1;
                return Ok(true);
            }
            debug!(record_id = %record.id, artifact = name, strategy = %strategy, "Recovery strategy not applicable");
        }

        Ok(false)
    }

    async fn restore(
        &self,
        record: &Record,
        kind: ArtifactKind,
        name: &str,
        report: &mut ReconcileReport,
    ) -> Result<bool> {
        if !self.store.backup_exists(name).await? {
            return Ok(false);
        }

        self.store.restore_from_backup(name).await?;
        report.restored += 1;
        info!(record_id = %record.id, artifact = name, "Artifact restored from backup");
        self.events.emit_lossy(MscopeEvent::ArtifactRestored {
            record_id: record.id,
            kind,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    async fn regenerate(
        &self,
        record: &Record,
        results_name: &str,
        source_name: &str,
        report: &mut ReconcileReport,
    ) -> Result<bool> {
        let source = self.store.get(source_name).await?;
        let output = match self.analyze(source).await {
            Ok(output) => output,
            Err(IntegrityError::Analysis(e)) => {
                warn!(record_id = %record.id, error = %e, "Source no longer analyzable");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.store
            .put_mirrored(results_name, output.results_bytes()?)
            .await?;
        report.regenerated += 1;
        info!(record_id = %record.id, artifact = results_name, "Results regenerated from source");
        self.events.emit_lossy(MscopeEvent::ArtifactRegenerated {
            record_id: record.id,
            kind: ArtifactKind::Results,
            timestamp: Utc::now(),
        });

        if output.summary != record.summary {
            self.registry
                .update(record.id, &RecordPatch::summary(output.summary))
                .await?;
            report.summaries_updated += 1;
            info!(record_id = %record.id, "Stored summary corrected after regeneration");
        }

        Ok(true)
    }

    async fn render_export(
        &self,
        record: &Record,
        name: &str,
        results: &[u8],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let positions = analysis::parse_results(results)?;
        let csv = analysis::export::render_csv(&positions)?;
        self.store.put(name, csv).await?;

        report.exports_rendered += 1;
        report.issues_fixed += 1;
        info!(record_id = %record.id, artifact = name, "Export re-rendered from results");
        self.events.emit_lossy(MscopeEvent::ArtifactRegenerated {
            record_id: record.id,
            kind: ArtifactKind::Export,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn mark_partial(&self, record: &Record, report: &mut ReconcileReport) -> Result<()> {
        let patch = RecordPatch {
            source_ref: Some(None),
            status: Some(RecordStatus::Partial),
            ..RecordPatch::default()
        };
        self.registry.update(record.id, &patch).await?;

        report.partial += 1;
        warn!(record_id = %record.id, "Source unrecoverable, record flagged partial");
        self.events.emit_lossy(MscopeEvent::RecordPartial {
            record_id: record.id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn delete_irrecoverable(&self, record: &Record, report: &mut ReconcileReport) -> Result<()> {
        // Registry first, then files
        if self.registry.delete(record.id).await?.is_some() {
            report.records_deleted += 1;
        }
        let names = record.artifact_refs().into_iter().map(str::to_string).collect();
        report.artifacts_deleted += self.store.delete_record_artifacts(record.id, names).await?;
        report.issues_fixed += 1;

        self.events.emit_lossy(MscopeEvent::RecordIrrecoverable {
            record_id: record.id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn sweep_orphan_artifacts(&self, report: &mut ReconcileReport) -> Result<()> {
        let live: HashSet<Uuid> = self.registry.ids().await?.into_iter().collect();

        for (names, backup) in [(self.store.list().await?, false), (self.store.list_backups().await?, true)] {
            for name in names {
                let Some(owner) = owner_id(&name) else {
                    debug!(artifact = %name, "Skipping file without record prefix");
                    continue;
                };
                if live.contains(&owner) {
                    continue;
                }

                let _guard = self.locks.lock(owner).await;
                // A submission may have registered the record since the snapshot
                if self.registry.exists(owner).await? {
                    continue;
                }

                report.issues_found += 1;
                let removed = if backup {
                    self.store.delete_backup(&name).await?
                } else {
                    self.store.delete(&name).await?
                };
                if removed {
                    report.artifacts_deleted += 1;
                    report.issues_fixed += 1;
                    info!(artifact = %name, backup, "Orphan artifact removed");
                    self.events.emit_lossy(MscopeEvent::OrphanArtifactRemoved {
                        name,
                        backup,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        Ok(())
    }

    async fn sweep_orphan_records(&self, report: &mut ReconcileReport) -> Result<()> {
        for record in self.registry.list_all().await? {
            let _guard = self.locks.lock(record.id).await;
            let Some(record) = self.registry.get(record.id, None).await? else {
                continue;
            };

            let mut resolvable = false;
            for name in [record.source_ref.as_deref(), record.results_ref.as_deref()]
                .into_iter()
                .flatten()
            {
                if self.store.exists(name).await? {
                    resolvable = true;
                    break;
                }
            }
            if resolvable {
                continue;
            }

            report.issues_found += 1;
            warn!(record_id = %record.id, "Record has neither source nor results, deleting");
            self.delete_irrecoverable(&record, report).await?;
        }

        Ok(())
    }

    async fn analyze(&self, source: Vec<u8>) -> Result<AnalysisOutput> {
        let engine = self.engine.clone();
        let output = tokio::task::spawn_blocking(move || engine.analyze(&source)).await??;
        Ok(output)
    }
}
