//! Snapshot engine - walks root paths, chunks file content into the block
//! store and assembles an immutable manifest.
//!
//! A snapshot goes `pending -> running (scanning) -> running (processing) ->
//! completed | failed`. Cancellation is observed between files only. A
//! manifest is written only once every file has been processed, so a
//! cancelled or failed snapshot never leaves a manifest behind.

pub mod manifest;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::config::EngineConfig;
use crate::fs::metadata::FileMetadata;
use crate::fs::walker::{walk_roots, FileInfo, WalkOptions};
use crate::store::{BlockStore, StoreOutcome};
use crate::tasks::Progress;
use crate::utils::errors::{EngineError, Result};
use manifest::{FileEntry, SkippedFile, SnapshotManifest};

/// Parameters of one snapshot run
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub id: String,
    pub plan_id: String,
    pub paths: Vec<PathBuf>,
}

/// A finished snapshot and where its manifest was written
#[derive(Debug, Clone)]
pub struct SnapshotOutput {
    pub manifest: SnapshotManifest,
    pub manifest_path: PathBuf,
    /// Blocks newly written by this run (the rest were deduplicated)
    pub new_blocks: usize,
}

pub struct SnapshotEngine {
    store: Arc<BlockStore>,
    chunker: Chunker,
    manifests_dir: PathBuf,
    walk_options: WalkOptions,
}

impl SnapshotEngine {
    pub fn new(store: Arc<BlockStore>, config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.snapshot.manifests_dir)?;
        Ok(Self {
            store,
            chunker: Chunker::new(config.store.block_size),
            manifests_dir: config.snapshot.manifests_dir.clone(),
            walk_options: WalkOptions {
                max_depth: None,
                exclude_patterns: config.snapshot.exclude_patterns.clone(),
            },
        })
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn manifests_dir(&self) -> &Path {
        &self.manifests_dir
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        SnapshotManifest::path_for(&self.manifests_dir, id)
    }

    pub fn load_manifest(&self, id: &str) -> Result<SnapshotManifest> {
        SnapshotManifest::load(&self.manifest_path(id))
    }

    /// Remove a manifest file. Returns false if it did not exist.
    pub fn delete_manifest(&self, id: &str) -> Result<bool> {
        match std::fs::remove_file(self.manifest_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Run a snapshot to completion on the calling thread.
    ///
    /// File-level problems are recorded in `manifest.skipped`; only
    /// cancellation and failure to persist the manifest return an error.
    pub fn create_snapshot(
        &self,
        request: &SnapshotRequest,
        progress: &dyn Progress,
    ) -> Result<SnapshotOutput> {
        let started = std::time::Instant::now();
        info!(snapshot_id = %request.id, plan_id = %request.plan_id, paths = ?request.paths, "Starting snapshot");

        progress.set_message("scanning");
        let walked = walk_roots(&request.paths, &self.walk_options);
        let mut skipped: Vec<SkippedFile> = walked
            .errors
            .into_iter()
            .map(|e| SkippedFile {
                path: e.path.to_string_lossy().to_string(),
                reason: e.reason,
            })
            .collect();

        let candidates = walked.entries;
        let total = candidates.len();
        info!(snapshot_id = %request.id, candidates = total, "Scan complete");

        let mut files = Vec::with_capacity(total);
        let mut blocks = BTreeMap::new();
        let mut size = 0u64;
        let mut file_count = 0u64;
        let mut new_blocks = 0usize;

        for (processed, candidate) in candidates.iter().enumerate() {
            if progress.is_cancelled() {
                info!(snapshot_id = %request.id, processed, total, "Snapshot cancelled");
                return Err(EngineError::Cancelled);
            }

            let shown = candidate.path.to_string_lossy().to_string();
            match self.capture(candidate, &mut blocks, &mut new_blocks) {
                Ok(entry) => {
                    if !entry.is_dir {
                        file_count += 1;
                    }
                    size += if entry.is_regular() { entry.size } else { 0 };
                    files.push(entry);
                }
                Err(e) => {
                    warn!(snapshot_id = %request.id, path = %shown, error = %e, "Skipping file");
                    skipped.push(SkippedFile {
                        path: shown.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            progress.report(processed + 1, total, Some(&shown));
        }

        // Last chance to honour a cancellation that arrived during the final file
        if progress.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let manifest = SnapshotManifest {
            id: request.id.clone(),
            plan_id: request.plan_id.clone(),
            timestamp: Utc::now(),
            paths: request
                .paths
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            files,
            blocks,
            size,
            file_count,
            skipped,
        };

        progress.set_message("writing manifest");
        let manifest_path = manifest.write_atomic(&self.manifests_dir)?;

        info!(
            snapshot_id = %request.id,
            files = manifest.file_count,
            bytes = manifest.size,
            new_blocks,
            skipped = manifest.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot complete"
        );

        Ok(SnapshotOutput {
            manifest,
            manifest_path,
            new_blocks,
        })
    }

    /// Build the manifest entry for one candidate, storing its blocks.
    fn capture(
        &self,
        candidate: &FileInfo,
        blocks: &mut BTreeMap<String, String>,
        new_blocks: &mut usize,
    ) -> Result<FileEntry> {
        let meta = FileMetadata::from_path(&candidate.path)?;
        let path = candidate.path.to_string_lossy().to_string();
        let mod_time = DateTime::from_timestamp(meta.modified, 0).unwrap_or_default();

        // The type may have changed since the walk; trust the fresh stat
        if meta.is_dir || meta.is_symlink {
            return Ok(FileEntry {
                path,
                size: 0,
                mode: meta.mode,
                mod_time,
                is_dir: meta.is_dir,
                blocks: Vec::new(),
                target: meta.symlink_target,
                checksum: None,
            });
        }

        let mut file_blocks: Vec<(String, String)> = Vec::new();
        let summary = self.chunker.chunk_file(&candidate.path, |hash, data| {
            if self.store.store(hash, data)? == StoreOutcome::Stored {
                *new_blocks += 1;
            }
            let stored_at = self
                .store
                .lookup(hash)
                .unwrap_or_else(|| self.store.block_path(hash));
            file_blocks.push((hash.to_string(), stored_at.to_string_lossy().to_string()));
            Ok(())
        })?;
        debug!(path = %path, blocks = summary.blocks.len(), "File chunked");

        blocks.extend(file_blocks);
        Ok(FileEntry {
            path,
            size: summary.size,
            mode: meta.mode,
            mod_time,
            is_dir: false,
            blocks: summary.blocks,
            target: None,
            checksum: Some(summary.checksum),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Progress sink that cancels itself after `cancel_after` files
    struct TestProgress {
        seen: AtomicUsize,
        cancel_after: Option<usize>,
        cancelled: AtomicBool,
    }

    impl TestProgress {
        fn new(cancel_after: Option<usize>) -> Self {
            Self {
                seen: AtomicUsize::new(0),
                cancel_after,
                cancelled: AtomicBool::new(false),
            }
        }
    }

    impl Progress for TestProgress {
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
        fn set_message(&self, _message: &str) {}
        fn report(&self, processed: usize, _total: usize, _current: Option<&str>) {
            self.seen.store(processed, Ordering::SeqCst);
            if Some(processed) == self.cancel_after {
                self.cancelled.store(true, Ordering::SeqCst);
            }
        }
    }

    fn engine(dir: &Path, block_size: usize) -> SnapshotEngine {
        let mut config = EngineConfig::with_data_dir(dir);
        config.store.block_size = block_size;
        let store = Arc::new(BlockStore::open(&config.store.dir).unwrap());
        SnapshotEngine::new(store, &config).unwrap()
    }

    #[test]
    fn test_small_tree() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        std::fs::create_dir(data.path().join("sub")).unwrap();
        std::fs::write(data.path().join("a.txt"), b"hello world").unwrap();
        std::fs::write(data.path().join("sub/b.txt"), b"hello").unwrap();

        let engine = engine(work.path(), 4);
        let request = SnapshotRequest {
            id: "s1".into(),
            plan_id: "p1".into(),
            paths: vec![data.path().to_path_buf()],
        };
        let out = engine.create_snapshot(&request, &TestProgress::new(None)).unwrap();

        assert_eq!(out.manifest.file_count, 2);
        assert_eq!(out.manifest.size, 16);
        // root dir, a.txt, sub, sub/b.txt
        assert_eq!(out.manifest.files.len(), 4);
        assert!(out.manifest_path.exists());
        // "hell" is shared between both files
        assert_eq!(out.new_blocks, 4);
        assert_eq!(out.manifest.blocks.len(), 4);
        assert_eq!(engine.load_manifest("s1").unwrap(), out.manifest);
    }

    #[test]
    fn test_cancel_leaves_no_manifest() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(data.path().join(format!("f{i}")), format!("content {i}")).unwrap();
        }

        let engine = engine(work.path(), 1024);
        let request = SnapshotRequest {
            id: "cancelled".into(),
            plan_id: "p1".into(),
            paths: vec![data.path().to_path_buf()],
        };
        let progress = TestProgress::new(Some(2));
        let err = engine.create_snapshot(&request, &progress).unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(progress.seen.load(Ordering::SeqCst), 2);
        assert!(!engine.manifest_path("cancelled").exists());
    }

    #[test]
    fn test_missing_root_is_skipped_not_fatal() {
        let work = TempDir::new().unwrap();
        let engine = engine(work.path(), 1024);
        let request = SnapshotRequest {
            id: "s2".into(),
            plan_id: "p1".into(),
            paths: vec![work.path().join("does-not-exist")],
        };
        let out = engine.create_snapshot(&request, &TestProgress::new(None)).unwrap();
        assert_eq!(out.manifest.file_count, 0);
        assert_eq!(out.manifest.skipped.len(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_file_is_recorded_as_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let locked = data.path().join("locked");
        std::fs::write(&locked, b"secret").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        std::fs::write(data.path().join("open"), b"public").unwrap();

        // Root can read anything; nothing to assert in that case
        if std::fs::read(&locked).is_ok() {
            return;
        }

        let engine = engine(work.path(), 1024);
        let request = SnapshotRequest {
            id: "s3".into(),
            plan_id: "p1".into(),
            paths: vec![data.path().to_path_buf()],
        };
        let out = engine.create_snapshot(&request, &TestProgress::new(None)).unwrap();
        assert_eq!(out.manifest.file_count, 1);
        assert_eq!(out.manifest.skipped.len(), 1);
        assert!(out.manifest.skipped[0].path.ends_with("locked"));
    }
}
