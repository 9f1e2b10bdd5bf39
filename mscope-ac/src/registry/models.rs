//! Registry data model

use crate::analysis::SummaryStats;
use crate::store::artifact_name;
use chrono::{DateTime, SubsecRound, Utc};
use mscope_common::events::ArtifactKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Analysis workspace (virus family)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workspace {
    Denv,
    Chikv,
}

impl Workspace {
    pub const ALL: [Workspace; 2] = [Workspace::Denv, Workspace::Chikv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Workspace::Denv => "denv",
            Workspace::Chikv => "chikv",
        }
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workspace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "denv" => Ok(Workspace::Denv),
            "chikv" => Ok(Workspace::Chikv),
            other => Err(format!("unknown workspace '{}'", other)),
        }
    }
}

/// Record health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Healthy,
    /// Source is gone for good; results are still valid
    Partial,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Healthy => "healthy",
            RecordStatus::Partial => "partial",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(RecordStatus::Healthy),
            "partial" => Ok(RecordStatus::Partial),
            other => Err(format!("unknown record status '{}'", other)),
        }
    }
}

/// One analyzed alignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub workspace: Workspace,
    pub keyword: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
    pub summary: SummaryStats,
    pub source_ref: Option<String>,
    pub results_ref: Option<String>,
    pub export_ref: Option<String>,
}

impl Record {
    /// New healthy record referencing the conventional artifact names for `id`
    pub fn new(
        id: Uuid,
        workspace: Workspace,
        keyword: impl Into<String>,
        display_name: impl Into<String>,
        summary: SummaryStats,
    ) -> Self {
        Self {
            id,
            workspace,
            keyword: keyword.into(),
            display_name: display_name.into(),
            // Stored with microsecond precision
            created_at: Utc::now().trunc_subsecs(6),
            status: RecordStatus::Healthy,
            summary,
            source_ref: Some(artifact_name(id, ArtifactKind::Source)),
            results_ref: Some(artifact_name(id, ArtifactKind::Results)),
            export_ref: Some(artifact_name(id, ArtifactKind::Export)),
        }
    }

    /// Referenced artifact name for `kind`
    pub fn artifact_ref(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Source => self.source_ref.as_deref(),
            ArtifactKind::Results => self.results_ref.as_deref(),
            ArtifactKind::Export => self.export_ref.as_deref(),
        }
    }

    /// All referenced artifact names
    pub fn artifact_refs(&self) -> Vec<&str> {
        [&self.source_ref, &self.results_ref, &self.export_ref]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Apply a patch in place
    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(source_ref) = &patch.source_ref {
            self.source_ref = source_ref.clone();
        }
        if let Some(results_ref) = &patch.results_ref {
            self.results_ref = results_ref.clone();
        }
        if let Some(export_ref) = &patch.export_ref {
            self.export_ref = export_ref.clone();
        }
        if let Some(summary) = &patch.summary {
            self.summary = summary.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(display_name) = &patch.display_name {
            self.display_name = display_name.clone();
        }
    }
}

/// Partial update. `None` leaves a field untouched; `Some(None)` clears a reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub source_ref: Option<Option<String>>,
    pub results_ref: Option<Option<String>>,
    pub export_ref: Option<Option<String>>,
    pub summary: Option<SummaryStats>,
    pub status: Option<RecordStatus>,
    pub display_name: Option<String>,
}

impl RecordPatch {
    pub fn status(status: RecordStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn summary(summary: SummaryStats) -> Self {
        Self {
            summary: Some(summary),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Listing row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: Uuid,
    pub workspace: Workspace,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
    pub total_positions: u32,
    pub mutation_count: u32,
    pub conserved_count: u32,
    pub low_confidence_count: u32,
}

impl From<&Record> for RecordSummary {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id,
            workspace: record.workspace,
            display_name: record.display_name.clone(),
            created_at: record.created_at,
            status: record.status,
            total_positions: record.summary.total_positions,
            mutation_count: record.summary.mutation_count,
            conserved_count: record.summary.conserved_count(),
            low_confidence_count: record.summary.low_confidence_count,
        }
    }
}

/// Aggregate registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_records: u64,
    pub per_workspace: BTreeMap<Workspace, u64>,
    /// Records created in the last 7 days
    pub recent_records: u64,
    pub total_positions: u64,
    pub total_mutations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_parse() {
        assert_eq!("denv".parse::<Workspace>().unwrap(), Workspace::Denv);
        assert_eq!(" CHIKV ".parse::<Workspace>().unwrap(), Workspace::Chikv);
        assert!("zika".parse::<Workspace>().is_err());
    }

    #[test]
    fn test_new_record_references_conventional_names() {
        let id = Uuid::new_v4();
        let record = Record::new(id, Workspace::Denv, "lab", "run 1", SummaryStats::default());
        assert_eq!(record.artifact_refs().len(), 3);
        assert_eq!(
            record.artifact_ref(ArtifactKind::Results),
            Some(format!("{}_results.json", id).as_str())
        );
        assert_eq!(record.status, RecordStatus::Healthy);
    }

    #[test]
    fn test_patch_clears_and_sets() {
        let mut record = Record::new(Uuid::new_v4(), Workspace::Chikv, "k", "n", SummaryStats::default());
        let patch = RecordPatch {
            export_ref: Some(None),
            status: Some(RecordStatus::Partial),
            ..RecordPatch::default()
        };
        assert!(!patch.is_empty());
        record.apply(&patch);
        assert_eq!(record.export_ref, None);
        assert!(record.source_ref.is_some());
        assert_eq!(record.status, RecordStatus::Partial);
        assert!(RecordPatch::default().is_empty());
    }
}
