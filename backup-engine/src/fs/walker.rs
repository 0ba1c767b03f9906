//! Directory traversal producing the flat candidate list for a snapshot.
//!
//! Unlike a plain file listing, the walk keeps directories and symlinks
//! (symlinks are never followed) so the snapshot can record the full tree.
//! Entries are yielded in a stable order: roots in the order given, and
//! within a root, depth-first with siblings sorted by file name.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns, matched as substrings of the file name
    pub exclude_patterns: Vec<String>,
}

/// Kind of entry discovered during walking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root it was found under
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// Depth from root (the root itself is 0)
    pub depth: usize,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> Self {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        Self {
            path,
            relative_path,
            kind,
            depth: entry.depth(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// A path the walker could not enter or read
#[derive(Debug, Clone)]
pub struct WalkError {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of walking a set of roots
#[derive(Debug, Default)]
pub struct WalkResult {
    pub entries: Vec<FileInfo>,
    pub errors: Vec<WalkError>,
}

/// Walk every root and collect a flat candidate list.
///
/// Unreadable directories and vanished roots do not abort the walk; they are
/// reported in [`WalkResult::errors`] so the caller can count them as skipped.
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{walk_roots, WalkOptions};
/// use std::path::PathBuf;
///
/// let result = walk_roots(&[PathBuf::from("/data")], &WalkOptions::default());
/// println!("Found {} entries", result.entries.len());
/// ```
pub fn walk_roots(roots: &[PathBuf], options: &WalkOptions) -> WalkResult {
    let mut result = WalkResult::default();
    for root in roots {
        walk_directory_with_callback(root, options, |info| result.entries.push(info), |err| {
            result.errors.push(err)
        });
    }
    result
}

/// Walk a single root with callbacks for each entry and each error
pub fn walk_directory_with_callback<F, E>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
    mut on_error: E,
) where
    F: FnMut(FileInfo),
    E: FnMut(WalkError),
{
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut iter = walker.into_iter();
    while let Some(next) = iter.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                on_error(WalkError {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if entry.depth() > 0 && should_exclude(&entry, &options.exclude_patterns) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        callback(FileInfo::from_entry(&entry, root));
    }
}

/// Count entries under a root (fast, without collecting)
pub fn count_entries(root: &Path, options: &WalkOptions) -> usize {
    let mut count = 0;
    walk_directory_with_callback(root, options, |_| count += 1, |_| {});
    count
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
