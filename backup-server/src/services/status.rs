use crate::db::connection::with_conn;
use crate::models::{restore_job, snapshot};
use crate::state::AppState;
use backup_engine::tasks::TaskInfo;
use serde::Serialize;

/// Status of a snapshot or restore task, live or finished
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub started_at: String,
    /// True while the task is still in the live table
    pub live: bool,
}

impl From<TaskInfo> for TaskStatusView {
    fn from(info: TaskInfo) -> Self {
        Self {
            id: info.id,
            kind: info.kind.as_str().to_string(),
            status: info.status.as_str().to_string(),
            progress: info.progress,
            message: info.message,
            started_at: info.started_at.to_rfc3339(),
            live: true,
        }
    }
}

/// Look up a task: the live table first, then the snapshot and restore records.
pub async fn get_status(state: &AppState, id: &str) -> anyhow::Result<Option<TaskStatusView>> {
    if let Some(info) = state.engine.tasks.get(id) {
        return Ok(Some(info.into()));
    }

    let id = id.to_string();
    with_conn(&state.db, move |conn| {
        if let Some(record) = snapshot::find_by_id(conn, &id)? {
            let completed = record.status == "completed";
            return Ok(Some(TaskStatusView {
                id: record.id,
                kind: "snapshot".into(),
                progress: if completed { 1.0 } else { 0.0 },
                message: record.error.unwrap_or_else(|| record.status.clone()),
                status: record.status,
                started_at: record.created_at,
                live: false,
            }));
        }
        if let Some(job) = restore_job::find_by_id(conn, &id)? {
            return Ok(Some(TaskStatusView {
                id: job.id,
                kind: "restore".into(),
                status: job.status,
                progress: job.progress,
                message: job.message,
                started_at: job.started_at,
                live: false,
            }));
        }
        Ok(None)
    })
    .await
}
