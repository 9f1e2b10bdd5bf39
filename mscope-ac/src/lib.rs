//! mscope-ac: artifact consistency and recovery for alignment analyses
//!
//! Analyses of multi-sequence alignments produce a small set of artifacts
//! (source, results, export) plus backup mirrors on disk, and one record in a
//! SQLite registry. This crate keeps the two in agreement:
//!
//! - [`analysis`]: per-position variant statistics (pure)
//! - [`store`]: atomic blob persistence with backups
//! - [`registry`]: the authoritative record index
//! - [`reconcile`]: detection and repair of drift between registry and store
//! - [`service`]: the caller-facing [`IntegrityService`]

pub mod analysis;
pub mod config;
pub mod error;
pub mod locks;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod store;
pub mod utils;

pub use crate::error::{AnalysisError, IntegrityError, Result, StoreError};
pub use crate::reconcile::{ReconcileReport, ReconciliationService, VerifyReport};
pub use crate::registry::{Record, RecordStatus, RecordSummary, Workspace};
pub use crate::service::{IntegrityService, RecordView};
