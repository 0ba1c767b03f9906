//! Task tracking for in-flight snapshot and restore operations.
//!
//! The registry holds one entry per running operation. Terminal tasks are
//! removed; their outcome lives in durable metadata from then on. Uses a
//! blocking `RwLock` because progress is written from blocking worker threads.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Snapshot,
    Restore,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Snapshot => "snapshot",
            TaskKind::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Fraction complete, 0.0 to 1.0, never decreasing
    pub progress: f64,
    pub message: String,
    pub started_at: DateTime<Utc>,
}

struct TaskEntry {
    info: TaskInfo,
    cancel: CancellationToken,
}

type TaskTable = Arc<RwLock<HashMap<String, TaskEntry>>>;

/// Live table of in-flight tasks
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: TaskTable,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending task. Fails if `id` is already in flight.
    pub fn register(&self, id: &str, kind: TaskKind) -> Result<TaskHandle> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(id) {
            return Err(EngineError::TaskExists(id.to_string()));
        }
        let cancel = CancellationToken::new();
        tasks.insert(
            id.to_string(),
            TaskEntry {
                info: TaskInfo {
                    id: id.to_string(),
                    kind,
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    message: "queued".to_string(),
                    started_at: Utc::now(),
                },
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(task_id = %id, ?kind, "Task registered");
        Ok(TaskHandle {
            id: id.to_string(),
            tasks: self.tasks.clone(),
            cancel,
        })
    }

    pub fn get(&self, id: &str) -> Option<TaskInfo> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(id).map(|e| e.info.clone())
    }

    /// Record a terminal status and drop the task from the live table.
    pub fn complete(&self, id: &str, status: TaskStatus, message: &str) -> Option<TaskInfo> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let mut entry = tasks.remove(id)?;
        entry.info.status = status;
        entry.info.message = message.to_string();
        if status == TaskStatus::Completed {
            entry.info.progress = 1.0;
        }
        tracing::debug!(task_id = %id, status = status.as_str(), "Task finished");
        Some(entry.info)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        tasks.remove(id).is_some()
    }

    /// Request cooperative cancellation. The task stays listed until it stops.
    pub fn cancel(&self, id: &str) -> bool {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task (used on shutdown)
    pub fn cancel_all(&self) {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        for entry in tasks.values() {
            entry.cancel.cancel();
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_kind(&self, kind: TaskKind) -> usize {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.values().filter(|e| e.info.kind == kind).count()
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<TaskInfo> = tasks.values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|i| i.started_at);
        infos
    }
}

/// Progress sink for a long-running operation
pub trait Progress: Send + Sync {
    fn is_cancelled(&self) -> bool;
    fn set_message(&self, message: &str);
    /// `processed` of `total` units done
    fn report(&self, processed: usize, total: usize, current: Option<&str>);
}

/// The single writer of one task's status and progress
#[derive(Clone)]
pub struct TaskHandle {
    id: String,
    tasks: TaskTable,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_running(&self, message: &str) {
        self.update(|info| {
            info.status = TaskStatus::Running;
            info.message = message.to_string();
        });
    }

    pub fn set_progress(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.update(|info| {
            if fraction > info.progress {
                info.progress = fraction;
            }
        });
    }

    pub fn snapshot(&self) -> Option<TaskInfo> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(&self.id).map(|e| e.info.clone())
    }

    fn update(&self, f: impl FnOnce(&mut TaskInfo)) {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = tasks.get_mut(&self.id) {
            f(&mut entry.info);
        }
    }
}

impl Progress for TaskHandle {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_message(&self, message: &str) {
        self.update(|info| info.message = message.to_string());
    }

    fn report(&self, processed: usize, total: usize, current: Option<&str>) {
        let fraction = if total == 0 {
            1.0
        } else {
            processed as f64 / total as f64
        };
        self.set_progress(fraction);
        if let Some(current) = current {
            self.set_message(&format!("processing {processed}/{total}: {current}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_get_complete() {
        let registry = TaskRegistry::new();
        let handle = registry.register("t1", TaskKind::Snapshot).unwrap();
        assert_eq!(registry.get("t1").unwrap().status, TaskStatus::Pending);

        handle.set_running("scanning");
        let info = registry.get("t1").unwrap();
        assert_eq!(info.status, TaskStatus::Running);
        assert_eq!(info.message, "scanning");

        let done = registry.complete("t1", TaskStatus::Completed, "done").unwrap();
        assert_eq!(done.progress, 1.0);
        assert!(registry.get("t1").is_none());
        assert_eq!(registry.running_count(), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = TaskRegistry::new();
        let _handle = registry.register("t1", TaskKind::Restore).unwrap();
        assert!(matches!(
            registry.register("t1", TaskKind::Restore),
            Err(EngineError::TaskExists(_))
        ));
    }

    #[test]
    fn test_progress_never_decreases() {
        let registry = TaskRegistry::new();
        let handle = registry.register("t1", TaskKind::Snapshot).unwrap();
        handle.report(5, 10, None);
        handle.report(3, 10, None);
        assert_eq!(registry.get("t1").unwrap().progress, 0.5);
    }

    #[test]
    fn test_cancel_reaches_handle() {
        let registry = TaskRegistry::new();
        let handle = registry.register("t1", TaskKind::Snapshot).unwrap();
        assert!(!handle.is_cancelled());
        assert!(registry.cancel("t1"));
        assert!(handle.is_cancelled());
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn test_handle_updates_after_removal_are_ignored() {
        let registry = TaskRegistry::new();
        let handle = registry.register("t1", TaskKind::Snapshot).unwrap();
        assert!(registry.remove("t1"));
        handle.set_running("late");
        assert!(registry.get("t1").is_none());
    }
}
