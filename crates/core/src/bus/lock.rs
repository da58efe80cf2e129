//! Advisory file locks guarding record mutation and the commit phase.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::trace;

use crate::errors::BusError;

/// An exclusive `flock`-style lock, released on drop.
#[derive(Debug)]
pub struct RecordLock {
    file: File,
    path: PathBuf,
}

impl RecordLock {
    /// Block until the lock at `path` is held exclusively.
    pub fn acquire(path: &Path) -> Result<Self, BusError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| lock_failed(path, e))?;
        file.lock_exclusive().map_err(|e| lock_failed(path, e))?;
        trace!(path = %path.display(), "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if no one else holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, BusError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| lock_failed(path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(lock_failed(path, e)),
        }
    }

}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!(path = %self.path.display(), "lock released");
    }
}

fn lock_failed(path: &Path, err: std::io::Error) -> BusError {
    BusError::LockFailed {
        path: path.display().to_string(),
        detail: err.to_string(),
    }
}
