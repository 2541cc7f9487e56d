//! Crash-safe file writes.
//!
//! Every artifact warden persists (graph file, checkpoints, signals) is written
//! to a temporary file first, flushed, then renamed into place, so a reader
//! sees either the previous complete file or the new complete file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Result, WardenError};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn staging_path(staging_dir: &Path, dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .ok_or_else(|| WardenError::Other(format!("path has no file name: {}", dest.display())))?
        .to_string_lossy();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(staging_dir.join(format!(".{name}.{}.{n}.tmp", std::process::id())))
}

fn write_staged(tmp: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Atomically replace `path` with `contents`, staging next to the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_in(parent_of(path), path, contents)
}

/// Atomically replace `path` with `contents`, staging in `staging_dir`.
///
/// `staging_dir` must live on the same filesystem as `path`. Use this when the
/// destination directory is polled by readers that must never see a temp file.
pub fn write_atomic_in(staging_dir: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    let parent = parent_of(path);
    fs::create_dir_all(parent)?;
    fs::create_dir_all(staging_dir)?;

    let tmp = staging_path(staging_dir, path)?;
    if let Err(e) = write_staged(&tmp, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_dir(parent);
    tracing::debug!(path = %path.display(), bytes = contents.len(), "atomic write");
    Ok(())
}

/// Atomically create `path` with `contents`; fails with `AlreadyExists` if it
/// is already there. Used for append-only artifacts that must never be
/// overwritten.
pub fn write_atomic_new(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = parent_of(path);
    fs::create_dir_all(parent)?;

    let tmp = staging_path(parent, path)?;
    if let Err(e) = write_staged(&tmp, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    // hard_link refuses to clobber an existing destination.
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    linked?;
    sync_dir(parent);
    tracing::debug!(path = %path.display(), bytes = contents.len(), "atomic create");
    Ok(())
}
