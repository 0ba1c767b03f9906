use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::{plan, snapshot};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::tasks::TaskKind;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_stats))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let ((plans, enabled), (snapshots, snapshot_bytes)) =
        with_conn(&state.db, |conn| Ok((plan::count(conn)?, snapshot::totals(conn)?))).await?;

    let engine = state.engine.clone();
    let (blocks, block_bytes) = tokio::task::spawn_blocking(move || (engine.store.len(), engine.store.total_bytes())).await?;

    Ok(Json(json!({
        "plans": { "total": plans, "enabled": enabled },
        "snapshots": { "count": snapshots, "logical_bytes": snapshot_bytes },
        "store": { "blocks": blocks, "stored_bytes": block_bytes },
        "tasks": {
            "running": state.engine.tasks.running_count(),
            "snapshots": state.engine.tasks.count_kind(TaskKind::Snapshot),
            "restores": state.engine.tasks.count_kind(TaskKind::Restore),
        },
        "scrub_running": state.engine.scrubber.is_running(),
    })))
}
