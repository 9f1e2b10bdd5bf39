//! Reconciliation and verification reports

use mscope_common::events::ArtifactKind;
use serde::Serialize;
use uuid::Uuid;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub records_checked: usize,
    pub issues_found: usize,
    pub issues_fixed: usize,
    /// Artifacts copied back from their backup
    pub restored: usize,
    /// Results recomputed from source
    pub regenerated: usize,
    /// Exports re-rendered from results
    pub exports_rendered: usize,
    pub backups_created: usize,
    /// Records whose stored summary disagreed with a regenerated one
    pub summaries_updated: usize,
    /// Records newly flagged partial
    pub partial: usize,
    pub records_deleted: usize,
    pub artifacts_deleted: usize,
    pub stale_temps_removed: usize,
    /// Records that could not be processed this pass
    pub errors: usize,
    /// The pass stopped early on cancellation
    pub cancelled: bool,
}

impl ReconcileReport {
    /// Number of changes made to the registry or the store
    pub fn mutations(&self) -> usize {
        self.restored
            + self.regenerated
            + self.exports_rendered
            + self.backups_created
            + self.summaries_updated
            + self.partial
            + self.records_deleted
            + self.artifacts_deleted
            + self.stale_temps_removed
    }

    pub fn is_clean(&self) -> bool {
        self.issues_found == 0 && self.errors == 0
    }
}

/// One inconsistency found by a read-only check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum Issue {
    /// A referenced primary artifact is absent
    ArtifactMissing {
        record_id: Uuid,
        kind: ArtifactKind,
        name: String,
    },
    /// A primary artifact has no backup mirror
    BackupMissing {
        record_id: Uuid,
        kind: ArtifactKind,
        name: String,
    },
    /// An artifact whose owning record does not exist
    OrphanArtifact { name: String, backup: bool },
}

/// Result of [`super::ReconciliationService::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub records_checked: usize,
    pub issues: Vec<Issue>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutations_exclude_counters() {
        let report = ReconcileReport {
            records_checked: 10,
            issues_found: 3,
            issues_fixed: 3,
            restored: 1,
            backups_created: 2,
            ..ReconcileReport::default()
        };
        assert_eq!(report.mutations(), 3);
        assert!(!report.is_clean());
        assert!(ReconcileReport::default().is_clean());
    }
}
