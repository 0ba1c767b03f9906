//! File metadata capture and re-application.
//!
//! Captures what a manifest records about a path (permissions, timestamps,
//! symlink target) without following symlinks.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Metadata for one path, as seen by `lstat`
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub modified: i64,

    /// Unix mode bits (permission and special bits only)
    pub mode: u32,

    pub is_dir: bool,

    pub is_symlink: bool,

    /// Target of the symlink, verbatim
    pub symlink_target: Option<String>,
}

impl FileMetadata {
    /// Extract metadata from a path without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o7777
        };

        #[cfg(not(unix))]
        let mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };

        let is_symlink = metadata.file_type().is_symlink();
        let symlink_target = if is_symlink {
            Some(fs::read_link(path)?.to_string_lossy().to_string())
        } else {
            None
        };

        let is_dir = metadata.is_dir();
        Ok(Self {
            size: if is_dir { 0 } else { metadata.len() },
            modified,
            mode,
            is_dir,
            is_symlink,
            symlink_target,
        })
    }
}

/// Apply recorded mode bits to a restored path
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    // On non-Unix platforms, mode bits are not applied
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert!(!metadata.is_dir);
        assert!(!metadata.is_symlink);
        assert!(metadata.symlink_target.is_none());
        assert!(metadata.modified > 0);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_target_is_verbatim() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("../somewhere/else", &link)?;

        let metadata = FileMetadata::from_path(&link)?;
        assert!(metadata.is_symlink);
        assert_eq!(metadata.symlink_target.as_deref(), Some("../somewhere/else"));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_mode_round_trip() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        apply_mode(temp_file.path(), 0o640)?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.mode & 0o777, 0o640);
        Ok(())
    }
}
