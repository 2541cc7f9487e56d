//! Cross-process exclusive locks.
//!
//! The audit chain and each pipeline's graph are single-writer resources.
//! Writers serialize through an advisory lock on a sidecar `.lock` file
//! (`flock`/`LockFileEx` via `fs2`). The lock is released when the guard drops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::retry::{retry_transient, BackoffPolicy};
use crate::{Result, WardenError};

/// Holds an exclusive lock until dropped.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try once to take the lock. Contention is reported as the transient
    /// [`WardenError::LockContended`].
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        // Fully qualified so std's inherent File::try_lock_exclusive is not picked.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "lock acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(WardenError::LockContended {
                    path: path.to_path_buf(),
                    attempts: 1,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock, retrying contention up to `attempts` times.
    pub fn acquire(path: &Path, attempts: usize, policy: &BackoffPolicy) -> Result<Self> {
        retry_transient(attempts, policy, "file lock", || Self::try_acquire(path)).map_err(
            |e| match e {
                WardenError::LockContended { path, .. } => {
                    tracing::warn!(path = %path.display(), attempts, "lock still contended");
                    WardenError::LockContended { path, attempts }
                }
                other => other,
            },
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "explicit unlock failed");
        }
        tracing::debug!(path = %self.path.display(), "lock released");
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

/// Sidecar lock path for a resource: `audit.jsonl` -> `audit.jsonl.lock`.
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name = resource
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    resource.with_file_name(name)
}
