//! Test helper utilities
//!
//! Shared setup for mscope-ac integration tests: an isolated root folder per
//! test and a few canned alignments.

#![allow(dead_code)]

use mscope_ac::store::artifact_name;
use mscope_ac::IntegrityService;
use mscope_common::config::RootLayout;
use mscope_common::db::init_database;
use mscope_common::db::settings::set_setting;
use mscope_common::events::{ArtifactKind, EventBus};
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;

/// A service over a throwaway root folder; the folder lives as long as this does
pub struct TestRoot {
    pub dir: TempDir,
    pub layout: RootLayout,
    pub service: IntegrityService,
}

impl TestRoot {
    pub fn artifact_path(&self, id: Uuid, kind: ArtifactKind) -> PathBuf {
        self.layout.artifacts_dir().join(artifact_name(id, kind))
    }

    pub fn backup_path(&self, id: Uuid, kind: ArtifactKind) -> PathBuf {
        self.layout.backups_dir().join(artifact_name(id, kind))
    }

    /// Remove a primary artifact behind the service's back
    pub fn remove_artifact(&self, id: Uuid, kind: ArtifactKind) {
        std::fs::remove_file(self.artifact_path(id, kind)).unwrap();
    }

    pub fn remove_backup(&self, id: Uuid, kind: ArtifactKind) {
        std::fs::remove_file(self.backup_path(id, kind)).unwrap();
    }

    /// Every file in the artifact and backup directories, as (name, is_backup)
    pub fn all_files(&self) -> Vec<(String, bool)> {
        let mut files = Vec::new();
        for (dir, backup) in [(self.layout.artifacts_dir(), false), (self.layout.backups_dir(), true)] {
            for entry in std::fs::read_dir(dir).unwrap() {
                let name = entry.unwrap().file_name().to_string_lossy().into_owned();
                files.push((name, backup));
            }
        }
        files.sort();
        files
    }
}

/// Open a service on a fresh root folder with fast retries
pub async fn open_test_root() -> TestRoot {
    open_test_root_with(&[]).await
}

/// Like [`open_test_root`] with extra settings written before the service starts
pub async fn open_test_root_with(settings: &[(&str, &str)]) -> TestRoot {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("root"));
    layout.ensure_directories().unwrap();

    let pool = init_database(&layout.database_path()).await.unwrap();
    set_setting(&pool, "registry_retry_backoff_ms", 1).await.unwrap();
    for (key, value) in settings {
        set_setting(&pool, key, value).await.unwrap();
    }
    pool.close().await;

    let service = IntegrityService::open(&layout, EventBus::new(256)).await.unwrap();
    TestRoot { dir, layout, service }
}

/// 3 sequences x 10 columns; columns 2 and 9 mutated
pub fn sample_alignment() -> Vec<u8> {
    b">ref\nACGTACGTAC\n>s1\nAGGTACGTAC\n>s2\nACGTACGTTC\n".to_vec()
}

/// 4 sequences x 10 columns; column 5 carries one ambiguity symbol
pub fn ambiguity_alignment() -> Vec<u8> {
    b">ref\nACGTACGTAC\n>s1\nACGTACGTAC\n>s2\nACGTTCGTAC\n>s3\nACGTXCGTAC\n".to_vec()
}

/// A distinct alignment per `n`, for bulk submissions
pub fn numbered_alignment(n: usize) -> Vec<u8> {
    let residues = [b'A', b'C', b'G', b'T'];
    let variant: Vec<u8> = (0..12).map(|i| residues[(i + n) % 4]).collect();
    let mut fasta = b">ref\nACGTACGTACGT\n>v\n".to_vec();
    fasta.extend_from_slice(&variant);
    fasta.push(b'\n');
    fasta
}
