use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::restore_job::{self, RestoreJob};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}", get(get_restore))
        .route("/{id}/cancel", post(cancel_restore))
        .route("/by-snapshot/{snapshot_id}", get(list_for_snapshot))
}

/// The row is written at phase changes; live progress comes from the task table.
async fn get_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RestoreJob>, AppError> {
    let lookup = id.clone();
    let mut job = with_conn(&state.db, move |conn| restore_job::find_by_id(conn, &lookup))
        .await?
        .ok_or_else(|| AppError::NotFound("Restore job not found".into()))?;

    if let Some(live) = state.engine.tasks.get(&id) {
        job.progress = job.progress.max(live.progress);
        job.message = live.message;
    }
    Ok(Json(job))
}

async fn list_for_snapshot(
    State(state): State<Arc<AppState>>,
    Path(snapshot_id): Path<String>,
) -> Result<Json<Vec<RestoreJob>>, AppError> {
    let jobs = with_conn(&state.db, move |conn| restore_job::find_by_snapshot(conn, &snapshot_id)).await?;
    Ok(Json(jobs))
}

async fn cancel_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.engine.tasks.cancel(&id) {
        return Err(AppError::NotFound("No running restore with that id".into()));
    }
    tracing::info!(restore_id = %id, "Restore cancellation requested");
    Ok(Json(json!({ "id": id, "cancelled": true })))
}
