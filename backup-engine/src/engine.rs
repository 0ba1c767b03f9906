//! Wiring of the engine components around one shared block store.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::restore::RestoreEngine;
use crate::scrub::Scrubber;
use crate::snapshot::SnapshotEngine;
use crate::store::BlockStore;
use crate::tasks::TaskRegistry;
use crate::utils::errors::Result;

/// All engine components, sharing one block store and one task registry
pub struct BackupEngine {
    pub config: EngineConfig,
    pub store: Arc<BlockStore>,
    pub snapshots: SnapshotEngine,
    pub restores: RestoreEngine,
    pub scrubber: Scrubber,
    pub tasks: TaskRegistry,
}

impl BackupEngine {
    /// Open the block store (rebuilding its index) and build every component.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(BlockStore::open(&config.store.dir)?);
        let snapshots = SnapshotEngine::new(store.clone(), &config)?;
        let restores = RestoreEngine::new(store.clone());
        let scrubber = Scrubber::new(store.clone(), config.scrub.sample_ratio);

        Ok(Self {
            config,
            store,
            snapshots,
            restores,
            scrubber,
            tasks: TaskRegistry::new(),
        })
    }
}
