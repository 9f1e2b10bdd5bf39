//! Error types for mscope-ac
//!
//! Errors fall into four groups:
//! - input errors from the analysis engine (never retried)
//! - transient infrastructure errors (registry/store I/O, retried with a bound)
//! - consistency errors (missing artifacts/backups, handled by reconciliation)
//! - irrecoverable records (deleted and reported)

use thiserror::Error;
use uuid::Uuid;

/// Failures of the analysis engine. Deterministic, so never retried.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Input parsed but contained no sequences
    #[error("Alignment contains no sequences")]
    EmptyAlignment,

    /// Input could not be read as a rectangular alignment
    #[error("Unsupported alignment format: {0}")]
    UnsupportedFormat(String),

    /// Tabular rendering failed
    #[error("Export rendering failed: {0}")]
    Export(String),
}

/// Artifact store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// No blob under this name
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Name would escape the store directory or is otherwise unusable
    #[error("Invalid artifact name: {0}")]
    InvalidName(String),

    /// Underlying filesystem error
    #[error("Artifact I/O error on '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Main error type for mscope-ac
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Registry could not be reached within the retry budget
    #[error("Registry unavailable after {attempts} attempts: {message}")]
    RegistryUnavailable { attempts: u32, message: String },

    /// A referenced artifact is absent from the store
    #[error("Artifact missing: {0}")]
    ArtifactMissing(String),

    /// A backup mirror is absent
    #[error("Backup missing: {0}")]
    BackupMissing(String),

    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),

    /// Artifacts could not be materialized even after an inline repair attempt
    #[error("Record unavailable: {0}")]
    RecordUnavailable(Uuid),

    /// Neither results nor source (nor their backups) survive
    #[error("Record irrecoverable: {0}")]
    RecordIrrecoverable(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Common(#[from] mscope_common::Error),
}

impl IntegrityError {
    /// Transient errors a caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IntegrityError::RegistryUnavailable { .. } | IntegrityError::Store(StoreError::Io { .. })
        )
    }
}

impl From<sqlx::Error> for IntegrityError {
    fn from(err: sqlx::Error) -> Self {
        IntegrityError::Common(mscope_common::Error::Database(err))
    }
}

impl From<tokio::task::JoinError> for IntegrityError {
    fn from(err: tokio::task::JoinError) -> Self {
        IntegrityError::Task(err.to_string())
    }
}

/// Result type for mscope-ac operations
pub type Result<T> = std::result::Result<T, IntegrityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_not_transient() {
        let err: IntegrityError = AnalysisError::EmptyAlignment.into();
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Alignment contains no sequences");
    }

    #[test]
    fn test_registry_unavailable_is_transient() {
        let err = IntegrityError::RegistryUnavailable {
            attempts: 3,
            message: "pool timed out".to_string(),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("3 attempts"));
    }
}
