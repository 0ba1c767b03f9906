use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::ws::ui::UiBroadcaster;
use backup_engine::BackupEngine;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub engine: Arc<BackupEngine>,
    pub ui: UiBroadcaster,
    /// Plans with a snapshot in flight; a plan never runs twice at once
    pub running_plans: Arc<Mutex<HashSet<String>>>,
    /// Bounds concurrent snapshot and restore tasks
    pub task_slots: Arc<Semaphore>,
    /// Held shared by every snapshot and restore, exclusively by orphan collection
    pub gc_lock: Arc<RwLock<()>>,
    /// Cancelled on SIGINT/SIGTERM; no new snapshot or restore starts after that
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, engine: BackupEngine) -> Self {
        let slots = config.max_concurrent_tasks;
        Self {
            db,
            config,
            engine: Arc::new(engine),
            ui: UiBroadcaster::new(),
            running_plans: Arc::new(Mutex::new(HashSet::new())),
            task_slots: Arc::new(Semaphore::new(slots)),
            gc_lock: Arc::new(RwLock::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Mark a plan as running. Returns false if it already was.
    pub async fn try_begin_plan(&self, plan_id: &str) -> bool {
        self.running_plans.lock().await.insert(plan_id.to_string())
    }

    pub async fn end_plan(&self, plan_id: &str) {
        self.running_plans.lock().await.remove(plan_id);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn is_plan_running(&self, plan_id: &str) -> bool {
        self.running_plans.lock().await.contains(plan_id)
    }
}
