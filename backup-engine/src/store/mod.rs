//! Content-addressed block store.
//!
//! Blocks live at `<root>/blocks/<hash[0..2]>/<hash>.blk`. The on-disk layout
//! is the source of truth; the in-memory hash index is rebuilt from a single
//! directory walk every time the store is opened.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunker::hash_bytes;
use crate::utils::errors::{EngineError, Result};

const BLOCKS_DIR: &str = "blocks";
const TMP_DIR: &str = "tmp";
const BLOCK_EXT: &str = "blk";
const HASH_LEN: usize = 64;

/// Result of a `store` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The block was written by this call
    Stored,
    /// The block was already present; nothing was written
    Existing,
}

/// Result of re-validating a stored block
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Ok,
    Corrupt,
    NotFound,
}

/// Outcome of an orphan collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OrphanReport {
    pub blocks_removed: usize,
    pub bytes_reclaimed: u64,
}

pub struct BlockStore {
    root: PathBuf,
    index: RwLock<HashMap<String, PathBuf>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BlockStore {
    /// Open (or create) a store rooted at `root` and rebuild its index.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOCKS_DIR))?;
        let tmp = root.join(TMP_DIR);
        if tmp.exists() {
            // Leftovers from writers that died before their rename
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let store = Self {
            root,
            index: RwLock::new(HashMap::new()),
            write_locks: DashMap::new(),
        };
        let count = store.rebuild_index()?;
        info!(root = %store.root.display(), blocks = count, "Block store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the index with what is actually on disk.
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut rebuilt = HashMap::new();
        for entry in WalkDir::new(self.root.join(BLOCKS_DIR)).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable block directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXT) {
                continue;
            }
            if let Some(hash) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_hash(hash) {
                    rebuilt.insert(hash.to_string(), path.to_path_buf());
                }
            }
        }

        let count = rebuilt.len();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = rebuilt;
        Ok(count)
    }

    /// Storage path for a hash. Pure function of the hash.
    pub fn block_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(0..2).unwrap_or("xx");
        self.root
            .join(BLOCKS_DIR)
            .join(shard)
            .join(format!("{hash}.{BLOCK_EXT}"))
    }

    /// Store `data` under `hash`. Idempotent: a present block is never rewritten.
    ///
    /// The caller is responsible for `hash` being the SHA-256 of `data`.
    pub fn store(&self, hash: &str, data: &[u8]) -> Result<StoreOutcome> {
        ensure_valid_hash(hash)?;
        if self.contains(hash) {
            return Ok(StoreOutcome::Existing);
        }

        let lock = self
            .write_locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store_locked(hash, data)
        };
        drop(lock);
        // Our clone is gone, so only the map holds it unless someone else is waiting
        self.write_locks
            .remove_if(hash, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    fn store_locked(&self, hash: &str, data: &[u8]) -> Result<StoreOutcome> {
        // Re-check under the per-hash lock: the previous holder may have written it
        if self.contains(hash) {
            return Ok(StoreOutcome::Existing);
        }

        let dest = self.block_path(hash);
        if dest.is_file() {
            self.index_insert(hash, dest);
            return Ok(StoreOutcome::Existing);
        }

        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{hash}.{}.partial", uuid::Uuid::new_v4()));
        if let Err(e) = write_new_block(&tmp, &dest, data) {
            let _ = fs::remove_file(&tmp);
            warn!(%hash, error = %e, "Failed to write block");
            return Err(e.into());
        }

        self.index_insert(hash, dest);
        debug!(%hash, bytes = data.len(), "Block stored");
        Ok(StoreOutcome::Stored)
    }

    fn index_insert(&self, hash: &str, path: PathBuf) {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string(), path);
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hash)
    }

    pub fn lookup(&self, hash: &str) -> Option<PathBuf> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned()
    }

    /// Read a block's bytes without validating them
    pub fn read(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self
            .lookup(hash)
            .ok_or_else(|| EngineError::BlockNotFound(hash.to_string()))?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => EngineError::BlockNotFound(hash.to_string()),
            _ => EngineError::Io(e),
        })
    }

    /// Re-read a stored block and compare its content hash.
    pub fn verify(&self, hash: &str) -> BlockStatus {
        if !is_valid_hash(hash) {
            return BlockStatus::NotFound;
        }
        let path = self.lookup(hash).unwrap_or_else(|| self.block_path(hash));
        match fs::read(&path) {
            Ok(data) if hash_bytes(&data) == hash => BlockStatus::Ok,
            Ok(_) => {
                warn!(%hash, path = %path.display(), "Block content does not match its hash");
                BlockStatus::Corrupt
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BlockStatus::NotFound,
            Err(e) => {
                warn!(%hash, error = %e, "Block unreadable during verify");
                BlockStatus::Corrupt
            }
        }
    }

    /// All indexed hashes, sorted
    pub fn hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        hashes.sort();
        hashes
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes used by indexed blocks on disk
    pub fn total_bytes(&self) -> u64 {
        let paths: Vec<PathBuf> = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        paths
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Delete a block. Returns the bytes freed (0 if it was absent).
    pub fn remove(&self, hash: &str) -> Result<u64> {
        ensure_valid_hash(hash)?;
        let removed = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
        let path = removed.unwrap_or_else(|| self.block_path(hash));
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every block not present in `referenced`.
    ///
    /// Callers must make sure no snapshot is in flight, since blocks written
    /// by an unfinished snapshot are not referenced by any manifest yet.
    pub fn collect_orphans(&self, referenced: &HashSet<String>) -> Result<OrphanReport> {
        let mut report = OrphanReport::default();
        for hash in self.hashes() {
            if referenced.contains(&hash) {
                continue;
            }
            report.bytes_reclaimed += self.remove(&hash)?;
            report.blocks_removed += 1;
        }
        info!(
            removed = report.blocks_removed,
            bytes = report.bytes_reclaimed,
            "Orphan collection finished"
        );
        Ok(report)
    }
}

fn write_new_block(tmp: &Path, dest: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    {
        let mut file = File::create(tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp, dest)
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn ensure_valid_hash(hash: &str) -> Result<()> {
    if is_valid_hash(hash) {
        Ok(())
    } else {
        Err(EngineError::InvalidPath(format!("not a block hash: {hash}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block_files(root: &Path) -> usize {
        WalkDir::new(root.join(BLOCKS_DIR))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let data = b"hello block";
        let hash = hash_bytes(data);

        assert_eq!(store.store(&hash, data).unwrap(), StoreOutcome::Stored);
        assert_eq!(store.store(&hash, data).unwrap(), StoreOutcome::Existing);
        assert_eq!(block_files(dir.path()), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_path_is_sharded_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let hash = hash_bytes(b"x");
        let path = store.block_path(&hash);
        assert_eq!(
            path,
            dir.path()
                .join("blocks")
                .join(&hash[..2])
                .join(format!("{hash}.blk"))
        );
    }

    #[test]
    fn test_index_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        let hash = hash_bytes(b"persisted");
        {
            let store = BlockStore::open(dir.path()).unwrap();
            store.store(&hash, b"persisted").unwrap();
        }
        let reopened = BlockStore::open(dir.path()).unwrap();
        assert_eq!(reopened.lookup(&hash), Some(reopened.block_path(&hash)));
        assert_eq!(reopened.read(&hash).unwrap(), b"persisted".to_vec());
    }

    #[test]
    fn test_verify_detects_flipped_byte() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let data = b"integrity matters";
        let hash = hash_bytes(data);
        store.store(&hash, data).unwrap();
        assert_eq!(store.verify(&hash), BlockStatus::Ok);

        let path = store.lookup(&hash).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(store.verify(&hash), BlockStatus::Corrupt);
    }

    #[test]
    fn test_verify_missing_block() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.verify(&hash_bytes(b"never stored")), BlockStatus::NotFound);
        assert_eq!(store.verify("../../etc/passwd"), BlockStatus::NotFound);
    }

    #[test]
    fn test_rejects_non_hash_keys() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.store("../escape", b"x"),
            Err(EngineError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_concurrent_same_hash_writes_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let data = vec![7u8; 64 * 1024];
        let hash = hash_bytes(&data);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let data = data.clone();
                let hash = hash.clone();
                std::thread::spawn(move || store.store(&hash, &data).unwrap())
            })
            .collect();
        let outcomes: Vec<StoreOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(
            outcomes.iter().filter(|o| **o == StoreOutcome::Stored).count(),
            1
        );
        assert_eq!(block_files(dir.path()), 1);
        assert_eq!(store.verify(&hash), BlockStatus::Ok);
    }

    #[test]
    fn test_collect_orphans_keeps_referenced() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let keep = hash_bytes(b"keep");
        let drop = hash_bytes(b"drop me");
        store.store(&keep, b"keep").unwrap();
        store.store(&drop, b"drop me").unwrap();

        let referenced: HashSet<String> = [keep.clone()].into_iter().collect();
        let report = store.collect_orphans(&referenced).unwrap();

        assert_eq!(report.blocks_removed, 1);
        assert_eq!(report.bytes_reclaimed, 7);
        assert!(store.contains(&keep));
        assert!(!store.contains(&drop));
        assert!(!store.block_path(&drop).exists());
    }
}
