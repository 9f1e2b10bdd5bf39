//! Artifact store
//!
//! Named byte blobs in two flat directories: primaries and their backups.
//! Every write goes to a temp file in the target directory, is fsynced, then
//! renamed into place, so a reader sees either the old blob, the new blob, or
//! nothing. The store knows nothing about ownership; the registry decides
//! which names are live.
//!
//! [`ArtifactStore`] is synchronous. Async code uses [`StoreHandle`].

use crate::error::StoreError;
use crate::utils::retry::{retry_blocking, RetryPolicy};
use mscope_common::events::ArtifactKind;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of in-flight temp files; never a valid artifact name
pub const TEMP_PREFIX: &str = ".mscope-tmp-";

/// Length of a hyphenated UUID
const UUID_LEN: usize = 36;

/// Artifact name for a record's artifact of the given kind
pub fn artifact_name(record_id: Uuid, kind: ArtifactKind) -> String {
    let suffix = match kind {
        ArtifactKind::Source => "source.fasta",
        ArtifactKind::Results => "results.json",
        ArtifactKind::Export => "export.csv",
    };
    format!("{}_{}", record_id, suffix)
}

/// Owning record id encoded in an artifact name, if any
pub fn owner_id(name: &str) -> Option<Uuid> {
    let prefix = name.get(..UUID_LEN)?;
    if name.as_bytes().get(UUID_LEN) != Some(&b'_') {
        return None;
    }
    Uuid::parse_str(prefix).ok()
}

/// Which of the two directories an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Primary,
    Backup,
}

/// Filesystem-backed blob store
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    primary_dir: PathBuf,
    backup_dir: PathBuf,
}

impl ArtifactStore {
    /// Open a store rooted at the two directories, creating them if needed
    pub fn open(primary_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            primary_dir: primary_dir.into(),
            backup_dir: backup_dir.into(),
        };
        for dir in [&store.primary_dir, &store.backup_dir] {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                name: dir.display().to_string(),
                source,
            })?;
        }
        Ok(store)
    }

    pub fn primary_dir(&self) -> &Path {
        &self.primary_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(Tier::Primary, name, bytes)
    }

    pub fn put_backup(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(Tier::Backup, name, bytes)
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.read(Tier::Primary, name)
    }

    pub fn get_backup(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.read(Tier::Backup, name)
    }

    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        self.check_exists(Tier::Primary, name)
    }

    pub fn backup_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.check_exists(Tier::Backup, name)
    }

    /// Remove a primary blob. Returns whether anything was removed.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.remove(Tier::Primary, name)
    }

    /// Remove a backup blob. Returns whether anything was removed.
    pub fn delete_backup(&self, name: &str) -> Result<bool, StoreError> {
        self.remove(Tier::Backup, name)
    }

    /// Names of all primary blobs, sorted
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        self.list_tier(Tier::Primary)
    }

    /// Names of all backup blobs, sorted
    pub fn list_backups(&self) -> Result<Vec<String>, StoreError> {
        self.list_tier(Tier::Backup)
    }

    /// Remove temp files older than `max_age` left behind by interrupted writes
    pub fn sweep_stale_temps(&self, max_age: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for tier in [Tier::Primary, Tier::Backup] {
            let dir = self.dir(tier);
            for entry in read_dir(dir)? {
                let entry = entry.map_err(|source| io_error(dir, source))?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !file_name.starts_with(TEMP_PREFIX) {
                    continue;
                }

                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map_err(|source| io_error(&entry.path(), source))?;
                let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < max_age {
                    continue;
                }

                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        debug!(file = %file_name, age_secs = age.as_secs(), "Removed stale temp file");
                        removed += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(io_error(&entry.path(), source)),
                }
            }
        }

        Ok(removed)
    }

    fn dir(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Primary => &self.primary_dir,
            Tier::Backup => &self.backup_dir,
        }
    }

    fn path(&self, tier: Tier, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.dir(tier).join(name))
    }

    fn write_atomic(&self, tier: Tier, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.path(tier, name)?;
        let dir = self.dir(tier);
        let wrap = |source: io::Error| StoreError::Io {
            name: name.to_string(),
            source,
        };

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(wrap)?;
        temp.write_all(bytes).map_err(wrap)?;
        temp.as_file().sync_all().map_err(wrap)?;
        temp.persist(&target).map_err(|e| wrap(e.error))?;

        // Make the rename itself durable
        #[cfg(unix)]
        fs::File::open(dir).and_then(|d| d.sync_all()).map_err(wrap)?;

        debug!(artifact = name, backup = (tier == Tier::Backup), bytes = bytes.len(), "Artifact written");
        Ok(())
    }

    fn read(&self, tier: Tier, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(tier, name)?;
        fs::read(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_string())
            } else {
                StoreError::Io {
                    name: name.to_string(),
                    source,
                }
            }
        })
    }

    fn check_exists(&self, tier: Tier, name: &str) -> Result<bool, StoreError> {
        let path = self.path(tier, name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn remove(&self, tier: Tier, name: &str) -> Result<bool, StoreError> {
        let path = self.path(tier, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => {
                warn!(artifact = name, error = %source, "Failed to delete artifact");
                Err(StoreError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    fn list_tier(&self, tier: Tier) -> Result<Vec<String>, StoreError> {
        let dir = self.dir(tier);
        let mut names = Vec::new();

        for entry in read_dir(dir)? {
            let entry = entry.map_err(|source| io_error(dir, source))?;
            let file_type = entry.file_type().map_err(|source| io_error(&entry.path(), source))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }
}

/// Async face of [`ArtifactStore`]
///
/// Each call runs on the blocking pool with bounded retry of I/O failures.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    store: ArtifactStore,
    policy: RetryPolicy,
}

impl StoreHandle {
    pub fn new(store: ArtifactStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn inner(&self) -> &ArtifactStore {
        &self.store
    }

    async fn call<T, F>(&self, operation_name: &str, operation: F) -> crate::error::Result<T>
    where
        F: Fn(&ArtifactStore) -> Result<T, StoreError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        retry_blocking(operation_name, self.policy, move || operation(&store)).await
    }

    pub async fn put(&self, name: &str, bytes: Vec<u8>) -> crate::error::Result<()> {
        let name = name.to_string();
        self.call("put", move |s| s.put(&name, &bytes)).await
    }

    pub async fn put_backup(&self, name: &str, bytes: Vec<u8>) -> crate::error::Result<()> {
        let name = name.to_string();
        self.call("put_backup", move |s| s.put_backup(&name, &bytes)).await
    }

    /// Write primary and backup
    pub async fn put_mirrored(&self, name: &str, bytes: Vec<u8>) -> crate::error::Result<()> {
        let name = name.to_string();
        self.call("put_mirrored", move |s| {
            s.put(&name, &bytes)?;
            s.put_backup(&name, &bytes)
        })
        .await
    }

    pub async fn get(&self, name: &str) -> crate::error::Result<Vec<u8>> {
        let name = name.to_string();
        self.call("get", move |s| s.get(&name)).await
    }

    pub async fn exists(&self, name: &str) -> crate::error::Result<bool> {
        let name = name.to_string();
        self.call("exists", move |s| s.exists(&name)).await
    }

    pub async fn backup_exists(&self, name: &str) -> crate::error::Result<bool> {
        let name = name.to_string();
        self.call("backup_exists", move |s| s.backup_exists(&name)).await
    }

    /// Copy the backup over the primary
    pub async fn restore_from_backup(&self, name: &str) -> crate::error::Result<()> {
        let name = name.to_string();
        self.call("restore_from_backup", move |s| {
            let bytes = s.get_backup(&name)?;
            s.put(&name, &bytes)
        })
        .await
    }

    /// Mirror the primary into the backup directory
    pub async fn create_backup(&self, name: &str) -> crate::error::Result<()> {
        let name = name.to_string();
        self.call("create_backup", move |s| {
            let bytes = s.get(&name)?;
            s.put_backup(&name, &bytes)
        })
        .await
    }

    /// Remove primary and backup. Returns how many files were removed.
    pub async fn delete_mirrored(&self, name: &str) -> crate::error::Result<usize> {
        let name = name.to_string();
        self.call("delete_mirrored", move |s| {
            let primary = s.delete(&name)?;
            let backup = s.delete_backup(&name)?;
            Ok(usize::from(primary) + usize::from(backup))
        })
        .await
    }

    /// Remove every artifact of a record: the given names plus the
    /// conventional names for `record_id`, primaries and backups
    pub async fn delete_record_artifacts(&self, record_id: Uuid, names: Vec<String>) -> crate::error::Result<usize> {
        let mut names = names;
        for kind in [ArtifactKind::Source, ArtifactKind::Results, ArtifactKind::Export] {
            names.push(artifact_name(record_id, kind));
        }
        names.sort();
        names.dedup();

        self.call("delete_record_artifacts", move |s| {
            let mut removed = 0;
            for name in &names {
                removed += usize::from(s.delete(name)?);
                removed += usize::from(s.delete_backup(name)?);
            }
            Ok(removed)
        })
        .await
    }

    pub async fn delete(&self, name: &str) -> crate::error::Result<bool> {
        let name = name.to_string();
        self.call("delete", move |s| s.delete(&name)).await
    }

    pub async fn delete_backup(&self, name: &str) -> crate::error::Result<bool> {
        let name = name.to_string();
        self.call("delete_backup", move |s| s.delete_backup(&name)).await
    }

    pub async fn list(&self) -> crate::error::Result<Vec<String>> {
        self.call("list", |s| s.list()).await
    }

    pub async fn list_backups(&self) -> crate::error::Result<Vec<String>> {
        self.call("list_backups", |s| s.list_backups()).await
    }

    pub async fn sweep_stale_temps(&self, max_age: Duration) -> crate::error::Result<usize> {
        self.call("sweep_stale_temps", move |s| s.sweep_stale_temps(max_age)).await
    }
}

fn read_dir(dir: &Path) -> Result<fs::ReadDir, StoreError> {
    fs::read_dir(dir).map_err(|source| io_error(dir, source))
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        name: path.display().to_string(),
        source,
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with(TEMP_PREFIX)
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
