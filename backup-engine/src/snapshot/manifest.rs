//! Snapshot manifest types.
//!
//! A manifest is the durable record of one snapshot: every captured path with
//! its block list, plus an index of the blocks it references. It is written
//! once, whole, as `<manifests_dir>/<id>.json` and never modified. New fields
//! must be additive and default on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: String,
    pub plan_id: String,
    pub timestamp: DateTime<Utc>,
    pub paths: Vec<String>,
    pub files: Vec<FileEntry>,
    /// hash -> block store path, for every block referenced by `files`
    pub blocks: BTreeMap<String, String>,
    /// Total bytes of regular file content
    pub size: u64,
    /// Number of non-directory entries
    pub file_count: u64,
    #[serde(default)]
    pub skipped: Vec<SkippedFile>,
}

/// One path captured by a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    #[serde(default)]
    pub blocks: Vec<String>,
    /// Symlink target, verbatim
    #[serde(default)]
    pub target: Option<String>,
    /// Whole-file SHA-256 (regular files only)
    #[serde(default)]
    pub checksum: Option<String>,
}

impl FileEntry {
    pub fn is_symlink(&self) -> bool {
        self.target.is_some()
    }

    pub fn is_regular(&self) -> bool {
        !self.is_dir && self.target.is_none()
    }
}

/// A path the snapshot could not capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

impl SnapshotManifest {
    /// Location of the manifest for `id` inside `dir`
    pub fn path_for(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    /// Write the manifest atomically: temp file, fsync, rename.
    ///
    /// Readers either see the complete manifest or no file at all.
    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let dest = Self::path_for(dir, &self.id);
        let tmp = dir.join(format!(".{}.json.partial", self.id));

        let body = serde_json::to_vec_pretty(self)?;
        let written = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &dest)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(dest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                EngineError::SnapshotNotFound(path.display().to_string())
            }
            _ => EngineError::Io(e),
        })?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Every block hash referenced by this snapshot's files
    pub fn referenced_hashes(&self) -> HashSet<String> {
        self.files
            .iter()
            .flat_map(|f| f.blocks.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SnapshotManifest {
        SnapshotManifest {
            id: "snap-1".to_string(),
            plan_id: "plan-1".to_string(),
            timestamp: Utc::now(),
            paths: vec!["/data".to_string()],
            files: vec![FileEntry {
                path: "/data/a.txt".to_string(),
                size: 3,
                mode: 0o644,
                mod_time: Utc::now(),
                is_dir: false,
                blocks: vec!["aa".repeat(32)],
                target: None,
                checksum: Some("bb".repeat(32)),
            }],
            blocks: BTreeMap::from([("aa".repeat(32), "/store/aa.blk".to_string())]),
            size: 3,
            file_count: 1,
            skipped: Vec::new(),
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        let manifest = sample();
        let path = manifest.write_atomic(dir.path()).unwrap();

        assert_eq!(path, dir.path().join("snap-1.json"));
        assert_eq!(SnapshotManifest::load(&path).unwrap(), manifest);
        // No temp file left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_load_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "old", "plan_id": "p", "timestamp": "2024-01-01T00:00:00Z",
            "paths": ["/data"], "blocks": {}, "size": 0, "file_count": 0,
            "files": [{"path": "/data", "size": 0, "mode": 493,
                       "mod_time": "2024-01-01T00:00:00Z", "is_dir": true}]
        }"#;
        let manifest: SnapshotManifest = serde_json::from_str(json).unwrap();
        assert!(manifest.skipped.is_empty());
        assert!(manifest.files[0].blocks.is_empty());
        assert!(manifest.files[0].checksum.is_none());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = SnapshotManifest::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, EngineError::SnapshotNotFound(_)));
    }
}
