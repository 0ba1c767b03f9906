//! Error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Block corrupt: {0}")]
    BlockCorrupt(String),

    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Task already registered: {0}")]
    TaskExists(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Scrub already running")]
    ScrubAlreadyRunning,
}

impl EngineError {
    /// True for integrity failures, which are never recovered automatically.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            EngineError::BlockCorrupt(_) | EngineError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
