use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::snapshot::{self, SnapshotRecord};
use crate::routes::plans::load_plan;
use crate::services::{restore_runner, retention, snapshot_runner};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::restore::SnapshotVerification;
use backup_engine::snapshot::manifest::SnapshotManifest;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_snapshots).post(create_snapshot))
        .route("/{id}", get(get_snapshot).delete(delete_snapshot))
        .route("/{id}/verify", post(verify_snapshot))
        .route("/{id}/restore", post(restore_snapshot))
}

#[derive(Deserialize)]
pub struct CreateSnapshotRequest {
    pub plan_id: String,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub plan_id: Option<String>,
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub target_path: String,
}

fn reject_during_shutdown(state: &AppState) -> Result<(), AppError> {
    if state.is_shutting_down() {
        return Err(AppError::Conflict("Server is shutting down".into()));
    }
    Ok(())
}

async fn load_completed(state: &AppState, id: String) -> Result<SnapshotRecord, AppError> {
    let record = with_conn(&state.db, move |conn| snapshot::find_by_id(conn, &id))
        .await?
        .ok_or_else(|| AppError::NotFound("Snapshot not found".into()))?;
    if record.status != "completed" {
        return Err(AppError::BadRequest(format!(
            "Snapshot {} did not complete (status: {})",
            record.id, record.status
        )));
    }
    Ok(record)
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSnapshotRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    reject_during_shutdown(&state)?;
    let plan = load_plan(&state, body.plan_id).await?;

    let missing: Vec<&String> = plan
        .paths
        .iter()
        .filter(|p| !std::path::Path::new(p).exists())
        .collect();
    if !missing.is_empty() {
        return Err(AppError::BadRequest(format!(
            "paths do not exist: {}",
            missing.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }

    let plan_id = plan.id.clone();
    let task_id = snapshot_runner::submit(state, plan)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("A snapshot of plan {plan_id} is already in flight")))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "accepted" })),
    ))
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SnapshotRecord>>, AppError> {
    let snapshots = with_conn(&state.db, move |conn| snapshot::find_all(conn, query.plan_id.as_deref())).await?;
    Ok(Json(snapshots))
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SnapshotRecord>, AppError> {
    let record = with_conn(&state.db, move |conn| snapshot::find_by_id(conn, &id))
        .await?
        .ok_or_else(|| AppError::NotFound("Snapshot not found".into()))?;
    Ok(Json(record))
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if retention::delete_snapshot(&state, &id).await? {
        state.ui.broadcast("snapshot:deleted", json!({ "snapshotId": id }));
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Snapshot not found".into()))
    }
}

async fn verify_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SnapshotVerification>, AppError> {
    let record = load_completed(&state, id).await?;
    let manifest_path = PathBuf::from(record.manifest_path.unwrap_or_default());
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || {
        let manifest = SnapshotManifest::load(&manifest_path)?;
        Ok::<_, backup_engine::EngineError>(engine.restores.verify_snapshot(&manifest))
    })
    .await??;

    if !report.is_intact() {
        tracing::warn!(
            snapshot_id = %record.id,
            missing = report.missing.len(),
            corrupt = report.corrupt.len(),
            "Snapshot verification found damaged blocks"
        );
    }
    Ok(Json(report))
}

async fn restore_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let target = PathBuf::from(&body.target_path);
    if !target.is_absolute() {
        return Err(AppError::BadRequest("target_path must be absolute".into()));
    }
    reject_during_shutdown(&state)?;
    let record = load_completed(&state, id).await?;
    let job = restore_runner::submit(state, record, target).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "restore_id": job.id, "status": "accepted" })),
    ))
}
