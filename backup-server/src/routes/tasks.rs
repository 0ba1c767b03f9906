use crate::error::AppError;
use crate::services::status::{self, TaskStatusView};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::tasks::TaskInfo;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tasks))
        .route("/{id}", get(get_task))
        .route("/{id}/cancel", post(cancel_task))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskInfo>> {
    Json(state.engine.tasks.list())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusView>, AppError> {
    status::get_status(&state, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Task not found".into()))
}

/// Cancellation is cooperative: the task stops at its next checkpoint.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Finished tasks have already left the live table
    if !state.engine.tasks.cancel(&id) {
        return Err(AppError::NotFound("No running task with that id".into()));
    }
    tracing::info!(task_id = %id, "Task cancellation requested");
    Ok(Json(json!({ "id": id, "cancelled": true })))
}
