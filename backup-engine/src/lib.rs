//! Backup Engine Library
//!
//! Content-addressed, deduplicated block store with manifest-based
//! point-in-time snapshots, restore, retention pruning and scrub verification.

pub mod chunker;
pub mod config;
pub mod engine;
pub mod fs;
pub mod prune;
pub mod restore;
pub mod scrub;
pub mod snapshot;
pub mod store;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::BackupEngine;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
