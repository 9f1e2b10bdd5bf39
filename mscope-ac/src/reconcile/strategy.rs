//! Recovery strategies, in priority order per artifact kind

use mscope_common::events::ArtifactKind;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Copy the backup mirror back into place
    RestoreFromBackup,
    /// Re-run the analysis engine on the surviving source
    RegenerateFromSource,
    /// Re-render the export from the results artifact
    RenderFromResults,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategy::RestoreFromBackup => "restore_from_backup",
            RecoveryStrategy::RegenerateFromSource => "regenerate_from_source",
            RecoveryStrategy::RenderFromResults => "render_from_results",
        };
        f.write_str(name)
    }
}

const RESULTS: &[RecoveryStrategy] = &[
    RecoveryStrategy::RestoreFromBackup,
    RecoveryStrategy::RegenerateFromSource,
];
const SOURCE: &[RecoveryStrategy] = &[RecoveryStrategy::RestoreFromBackup];
const EXPORT: &[RecoveryStrategy] = &[RecoveryStrategy::RenderFromResults];

/// Strategies to try, first to last, when an artifact of `kind` is missing
pub fn strategies_for(kind: ArtifactKind) -> &'static [RecoveryStrategy] {
    match kind {
        ArtifactKind::Results => RESULTS,
        ArtifactKind::Source => SOURCE,
        ArtifactKind::Export => EXPORT,
    }
}

/// Whether artifacts of `kind` are mirrored in the backup directory
pub fn has_backup(kind: ArtifactKind) -> bool {
    strategies_for(kind).contains(&RecoveryStrategy::RestoreFromBackup)
}
