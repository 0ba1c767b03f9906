//! Restore engine - rebuilds a file tree from a manifest and the block store.
//!
//! Every regular file is reassembled from its blocks in manifest order and
//! its whole-file checksum re-validated before it counts as restored. A
//! failure affects only that file; the job reports per-file failures and an
//! overall status.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

use crate::chunker::hash_bytes;
use crate::fs::metadata::apply_mode;
use crate::snapshot::manifest::{FileEntry, SnapshotManifest};
use crate::store::{BlockStatus, BlockStore};
use crate::tasks::Progress;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RestoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStatus::Completed => "completed",
            RestoreStatus::Partial => "partial",
            RestoreStatus::Failed => "failed",
            RestoreStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub status: RestoreStatus,
    pub files_restored: usize,
    pub failures: Vec<FileFailure>,
    pub bytes_restored: u64,
}

/// Result of checking a snapshot's blocks without restoring it
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotVerification {
    pub blocks_checked: usize,
    pub missing: Vec<String>,
    pub corrupt: Vec<String>,
}

impl SnapshotVerification {
    pub fn is_intact(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

pub struct RestoreEngine {
    store: Arc<BlockStore>,
}

impl RestoreEngine {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }

    /// Restore every entry of `manifest` under `target`.
    ///
    /// The outcome is `Failed` when entries failed and no regular file was
    /// restored. Returns `Err` only when the target itself cannot be prepared.
    pub fn restore(
        &self,
        manifest: &SnapshotManifest,
        target: &Path,
        progress: &dyn Progress,
    ) -> Result<RestoreOutcome> {
        fs::create_dir_all(target)?;
        info!(snapshot_id = %manifest.id, target = %target.display(), entries = manifest.files.len(), "Starting restore");

        let total = manifest.files.len();
        let mut restored = 0usize;
        // Directories and symlinks always restore; only file content decides `Failed`
        let mut regular_restored = 0usize;
        let mut bytes_restored = 0u64;
        let mut failures = Vec::new();
        // Directory modes are applied last so read-only dirs can still be filled
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
        let mut cancelled = false;

        for (i, entry) in manifest.files.iter().enumerate() {
            if progress.is_cancelled() {
                cancelled = true;
                break;
            }

            match self.restore_entry(entry, target, &mut dir_modes) {
                Ok(bytes) => {
                    restored += 1;
                    if entry.is_regular() {
                        regular_restored += 1;
                    }
                    bytes_restored += bytes;
                }
                Err(e) => {
                    if e.is_integrity() {
                        error!(path = %entry.path, error = %e, "Restored content failed verification");
                    } else {
                        warn!(path = %entry.path, error = %e, "Failed to restore entry");
                    }
                    failures.push(FileFailure {
                        path: entry.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            progress.report(i + 1, total, Some(&entry.path));
        }

        for (dir, mode) in dir_modes.iter().rev() {
            if let Err(e) = apply_mode(dir, *mode) {
                warn!(path = %dir.display(), error = %e, "Failed to apply directory mode");
            }
        }

        let status = if cancelled {
            RestoreStatus::Cancelled
        } else if failures.is_empty() {
            RestoreStatus::Completed
        } else if regular_restored == 0 {
            RestoreStatus::Failed
        } else {
            RestoreStatus::Partial
        };

        info!(
            snapshot_id = %manifest.id,
            status = status.as_str(),
            restored,
            failed = failures.len(),
            bytes = bytes_restored,
            "Restore finished"
        );

        Ok(RestoreOutcome {
            status,
            files_restored: restored,
            failures,
            bytes_restored,
        })
    }

    fn restore_entry(
        &self,
        entry: &FileEntry,
        target: &Path,
        dir_modes: &mut Vec<(PathBuf, u32)>,
    ) -> Result<u64> {
        let dest = target.join(relative_to_root(&entry.path)?);

        if entry.is_dir {
            fs::create_dir_all(&dest)?;
            dir_modes.push((dest, entry.mode));
            return Ok(0);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(link_target) = &entry.target {
            return restore_symlink(link_target, &dest).map(|_| 0);
        }

        match self.restore_file(entry, &dest) {
            Ok(bytes) => {
                apply_mode(&dest, entry.mode)?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&dest);
                Err(e)
            }
        }
    }

    fn restore_file(&self, entry: &FileEntry, dest: &Path) -> Result<u64> {
        if fs::symlink_metadata(dest).map(|m| m.is_symlink()).unwrap_or(false) {
            fs::remove_file(dest)?;
        }
        let file = File::create(dest)?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        for hash in &entry.blocks {
            let data = self.store.read(hash)?;
            if hash_bytes(&data) != *hash {
                return Err(EngineError::BlockCorrupt(hash.clone()));
            }
            hasher.update(&data);
            writer.write_all(&data)?;
            written += data.len() as u64;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = &entry.checksum {
            if *expected != actual {
                return Err(EngineError::ChecksumMismatch {
                    path: entry.path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(entry.mod_time.timestamp().max(0) as u64);
        if let Err(e) = file.set_modified(mtime) {
            warn!(path = %dest.display(), error = %e, "Failed to set modification time");
        }
        Ok(written)
    }

    /// Check every block referenced by a manifest, writing nothing.
    pub fn verify_snapshot(&self, manifest: &SnapshotManifest) -> SnapshotVerification {
        let mut report = SnapshotVerification::default();
        for hash in manifest.referenced_hashes() {
            report.blocks_checked += 1;
            match self.store.verify(&hash) {
                BlockStatus::Ok => {}
                BlockStatus::Corrupt => report.corrupt.push(hash),
                BlockStatus::NotFound => report.missing.push(hash),
            }
        }
        report.missing.sort();
        report.corrupt.sort();
        report
    }
}

/// Turn a recorded absolute path into one relative to the restore target.
fn relative_to_root(recorded: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(recorded).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(EngineError::InvalidPath(format!(
                    "refusing to restore outside target: {recorded}"
                )))
            }
        }
    }
    Ok(relative)
}

#[cfg(unix)]
fn restore_symlink(link_target: &str, dest: &Path) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        if dest.is_dir() && !fs::symlink_metadata(dest)?.is_symlink() {
            fs::remove_dir_all(dest)?;
        } else {
            fs::remove_file(dest)?;
        }
    }
    std::os::unix::fs::symlink(link_target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn restore_symlink(_link_target: &str, dest: &Path) -> Result<()> {
    Err(EngineError::InvalidPath(format!(
        "symlinks are not supported on this platform: {}",
        dest.display()
    )))
}
