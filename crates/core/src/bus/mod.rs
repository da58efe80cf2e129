//! Directory-backed diff bus.
//!
//! The bus is the only owner of [`Diff`](crate::models::Diff) records. Each
//! record is a JSON file inside the partition directory that matches its
//! status; moving the file between partitions *is* the status transition.
//!
//! ```text
//! <root>/
//!   manifest.json
//!   diffs/{pending,verified,rejected,merged}/{diff_id}.json
//!   conflicts/{conflict_id}.json
//!   merges/{merge_id}.json
//!   commits/{merge_id}/{combined.diff,message.md,verification.json}
//!   locks/{record_id}.lock
//!   commit.lock
//! ```
//!
//! Writes go through a temp file in the destination directory followed by a
//! rename, and every read-modify-write of a record holds that record's
//! advisory lock, so concurrent mutators of the same id are serialized.

mod conflicts;
mod diffs;
pub mod lock;
mod merges;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use diffs::{Claim, TransitionPayload};
pub use lock::RecordLock;
pub use merges::{combine_patches, CommitMetadata};

use crate::errors::BusError;
use crate::models::{BusStatus, ConflictCounts, DiffCounts, Partition};

pub const MANIFEST_VERSION: &str = "1.0";

const MANIFEST_FILE: &str = "manifest.json";
const COMMIT_LOCK_FILE: &str = "commit.lock";

/// Presence of this file marks the bus as initialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub version: String,
    pub orchestrator_pid: u32,
}

/// Handle to one bus root. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct Bus {
    root: PathBuf,
}

impl Bus {
    /// Create a handle without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open an initialized bus and repair any misfiled records.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BusError> {
        let bus = Self::new(root);
        bus.ensure_initialized()?;
        let repaired = bus.repair()?;
        if repaired > 0 {
            warn!(count = repaired, root = %bus.root.display(), "repaired misfiled records");
        }
        Ok(bus)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory layout and write the manifest.
    ///
    /// Calling this on an already initialized bus leaves the existing
    /// manifest in place and returns it.
    pub fn initialize(&self) -> Result<Manifest, BusError> {
        for partition in Partition::ALL {
            fs::create_dir_all(self.partition_dir(partition))?;
        }
        fs::create_dir_all(self.conflicts_dir())?;
        fs::create_dir_all(self.merges_dir())?;
        fs::create_dir_all(self.commits_dir())?;
        fs::create_dir_all(self.locks_dir())?;

        // Keep an in-repository bus out of pipeline commits.
        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")?;
        }

        if let Some(existing) = self.manifest()? {
            debug!(root = %self.root.display(), "bus already initialized");
            return Ok(existing);
        }

        let manifest = Manifest {
            created_at: Utc::now(),
            version: MANIFEST_VERSION.to_string(),
            orchestrator_pid: std::process::id(),
        };
        write_json_atomic(&self.manifest_path(), &manifest)?;
        info!(root = %self.root.display(), "bus initialized");
        Ok(manifest)
    }

    pub fn is_initialized(&self) -> bool {
        self.manifest_path().is_file()
    }

    /// Read the manifest, if the bus is initialized.
    pub fn manifest(&self) -> Result<Option<Manifest>, BusError> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub(crate) fn ensure_initialized(&self) -> Result<(), BusError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(BusError::NotInitialized(self.root.display().to_string()))
        }
    }

    /// Aggregate counts across every partition. Never cached.
    pub fn status_summary(&self) -> Result<BusStatus, BusError> {
        if !self.is_initialized() {
            return Ok(BusStatus::default());
        }

        let diffs = DiffCounts {
            pending: count_json(&self.partition_dir(Partition::Pending))?,
            verified: count_json(&self.partition_dir(Partition::Verified))?,
            rejected: count_json(&self.partition_dir(Partition::Rejected))?,
            merged: count_json(&self.partition_dir(Partition::Merged))?,
        };

        let conflicts = self.list_conflicts(None)?;
        let unresolved = conflicts.iter().filter(|c| !c.resolved).count();

        let commits_ready = match fs::read_dir(self.commits_dir()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_dir())
                .count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(BusStatus {
            initialized: true,
            diffs,
            conflicts: ConflictCounts {
                total: conflicts.len(),
                unresolved,
            },
            merges: count_json(&self.merges_dir())?,
            commits_ready,
        })
    }

    /// Delete everything under the root and reinitialize.
    pub fn reset(&self) -> Result<Manifest, BusError> {
        if self.root.exists() {
            warn!(root = %self.root.display(), "wiping bus");
            fs::remove_dir_all(&self.root)?;
        }
        self.initialize()
    }

    /// Hold the cross-process commit lock.
    ///
    /// Waiting for another holder happens on the blocking pool.
    pub async fn lock_commit(&self) -> Result<RecordLock, BusError> {
        let path = self.root.join(COMMIT_LOCK_FILE);
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || RecordLock::acquire(&path))
            .await
            .map_err(|e| BusError::LockFailed {
                path: display,
                detail: e.to_string(),
            })?
    }

    // -- layout -------------------------------------------------------------

    pub(crate) fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub(crate) fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.root.join("diffs").join(partition.dir_name())
    }

    pub(crate) fn diff_path(&self, partition: Partition, id: &str) -> PathBuf {
        self.partition_dir(partition).join(format!("{}.json", id))
    }

    pub(crate) fn conflicts_dir(&self) -> PathBuf {
        self.root.join("conflicts")
    }

    pub(crate) fn merges_dir(&self) -> PathBuf {
        self.root.join("merges")
    }

    pub fn commits_dir(&self) -> PathBuf {
        self.root.join("commits")
    }

    pub(crate) fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub(crate) fn lock_record(&self, id: &str) -> Result<RecordLock, BusError> {
        RecordLock::acquire(&self.locks_dir().join(format!("{}.lock", id)))
    }

    /// Held for as long as a diff is being verified.
    pub(crate) fn claim_lock_path(&self, id: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.claim", id))
    }
}

// ---------------------------------------------------------------------------
// Record I/O helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, BusError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| BusError::CorruptRecord {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}

/// Serialize `value` next to `path` and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), BusError> {
    let body = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &body)
}

pub(crate) fn write_bytes_atomic(path: &Path, body: &[u8]) -> Result<(), BusError> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BusError::IoError(e.error))?;
    Ok(())
}

/// Paths of every `*.json` file directly inside `dir`, sorted by name.
pub(crate) fn json_files(dir: &Path) -> Result<Vec<PathBuf>, BusError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn count_json(dir: &Path) -> Result<usize, BusError> {
    Ok(json_files(dir)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(dir.path().join("bus"));
        assert!(!bus.is_initialized());

        let manifest = bus.initialize().unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.orchestrator_pid, std::process::id());
        assert!(bus.is_initialized());
        for partition in Partition::ALL {
            assert!(bus.partition_dir(partition).is_dir());
        }
        assert!(bus.conflicts_dir().is_dir());
        assert!(bus.merges_dir().is_dir());
        assert!(bus.commits_dir().is_dir());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(dir.path());
        let first = bus.initialize().unwrap();
        let second = bus.initialize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = Bus::open(dir.path()).unwrap_err();
        assert!(matches!(err, BusError::NotInitialized(_)));
    }

    #[test]
    fn test_status_summary_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let status = Bus::new(dir.path().join("missing")).status_summary().unwrap();
        assert!(!status.initialized);
        assert_eq!(status.diffs, DiffCounts::default());
    }

    #[test]
    fn test_reset_wipes_records() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(dir.path());
        bus.initialize().unwrap();
        fs::write(bus.diff_path(Partition::Pending, "diff-x"), "{}").unwrap();

        bus.reset().unwrap();
        assert!(bus.is_initialized());
        assert_eq!(bus.status_summary().unwrap().diffs.pending, 0);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();

        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_commit_lock_waits_without_blocking_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(dir.path());
        bus.initialize().unwrap();

        let held = bus.lock_commit().await.unwrap();
        let other = bus.clone();
        let waiter = tokio::spawn(async move { other.lock_commit().await.map(drop) });

        // The single-threaded test runtime keeps ticking while the waiter
        // is parked on the lock.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn test_corrupt_record_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").unwrap();
        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert!(matches!(err, BusError::CorruptRecord { .. }));
    }
}
