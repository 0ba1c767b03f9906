//! Configuration for the backup engine.
//!
//! Loaded from a TOML file; every field has a default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::errors::{EngineError, Result};

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub scrub: ScrubConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the block store
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,

    /// Maximum block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Directory holding one manifest file per snapshot
    #[serde(default = "default_manifests_dir")]
    pub manifests_dir: PathBuf,

    /// File names containing any of these patterns are not backed up
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubConfig {
    /// Fraction of known blocks verified per scrub run
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/infra-core/store")
}

fn default_manifests_dir() -> PathBuf {
    PathBuf::from("/var/lib/infra-core/manifests")
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_sample_ratio() -> f64 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            block_size: default_block_size(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            manifests_dir: default_manifests_dir(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            sample_ratio: default_sample_ratio(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with store and manifests under `data_dir`
    pub fn with_data_dir(data_dir: &Path) -> Self {
        let mut config = Self::default();
        config.store.dir = data_dir.join("store");
        config.snapshot.manifests_dir = data_dir.join("manifests");
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.block_size == 0 {
            return Err(EngineError::Config("block_size must be greater than zero".into()));
        }
        if !(self.scrub.sample_ratio > 0.0 && self.scrub.sample_ratio <= 1.0) {
            return Err(EngineError::Config(format!(
                "scrub sample_ratio must be in (0, 1], got {}",
                self.scrub.sample_ratio
            )));
        }
        Ok(())
    }
}
