use crate::error::AppError;
use crate::services::cleanup;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use backup_engine::store::OrphanReport;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/cleanup", post(cleanup_blocks))
}

async fn cleanup_blocks(State(state): State<Arc<AppState>>) -> Result<Json<OrphanReport>, AppError> {
    Ok(Json(cleanup::collect_orphans(&state).await?))
}
