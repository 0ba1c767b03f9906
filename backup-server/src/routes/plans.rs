use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::{plan, snapshot};
use crate::services::{retention, scheduler};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_plans).post(create_plan))
        .route("/{id}", get(get_plan).put(update_plan).delete(delete_plan))
        .route("/{id}/enable", post(enable_plan))
        .route("/{id}/disable", post(disable_plan))
        .route("/{id}/prune", post(prune_plan))
}

fn validate_paths(paths: &[String]) -> Result<(), AppError> {
    if paths.is_empty() {
        return Err(AppError::BadRequest("paths must not be empty".into()));
    }
    if let Some(relative) = paths.iter().find(|p| !std::path::Path::new(p).is_absolute()) {
        return Err(AppError::BadRequest(format!("path must be absolute: {relative}")));
    }
    Ok(())
}

fn validate_schedule(schedule: &str) -> Result<(), AppError> {
    scheduler::parse_schedule(schedule)
        .map(|_| ())
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

pub(crate) async fn load_plan(state: &AppState, id: String) -> Result<plan::SnapPlan, AppError> {
    with_conn(&state.db, move |conn| plan::find_by_id(conn, &id))
        .await?
        .ok_or_else(|| AppError::NotFound("Plan not found".into()))
}

async fn list_plans(State(state): State<Arc<AppState>>) -> Result<Json<Vec<plan::SnapPlan>>, AppError> {
    let plans = with_conn(&state.db, plan::find_all).await?;
    Ok(Json(plans))
}

async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<plan::SnapPlan>, AppError> {
    Ok(Json(load_plan(&state, id).await?))
}

async fn create_plan(
    State(state): State<Arc<AppState>>,
    Json(body): Json<plan::CreatePlanRequest>,
) -> Result<(StatusCode, Json<plan::SnapPlan>), AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    validate_paths(&body.paths)?;
    validate_schedule(&body.schedule)?;

    let created = with_conn(&state.db, move |conn| plan::create(conn, &body)).await?;
    tracing::info!(plan_id = %created.id, name = %created.name, schedule = %created.schedule, "Plan created");
    state.ui.broadcast("plan:created", json!({ "planId": created.id }));
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<plan::UpdatePlanRequest>,
) -> Result<Json<plan::SnapPlan>, AppError> {
    if let Some(paths) = &body.paths {
        validate_paths(paths)?;
    }
    if let Some(schedule) = &body.schedule {
        validate_schedule(schedule)?;
    }

    let updated = with_conn(&state.db, move |conn| plan::update(conn, &id, &body))
        .await?
        .ok_or_else(|| AppError::NotFound("Plan not found".into()))?;
    state.ui.broadcast("plan:updated", json!({ "planId": updated.id }));
    Ok(Json(updated))
}

async fn set_enabled(state: Arc<AppState>, id: String, enabled: bool) -> Result<Json<plan::SnapPlan>, AppError> {
    let updated = with_conn(&state.db, move |conn| plan::set_enabled(conn, &id, enabled))
        .await?
        .ok_or_else(|| AppError::NotFound("Plan not found".into()))?;
    tracing::info!(plan_id = %updated.id, enabled, "Plan toggled");
    state.ui.broadcast("plan:updated", json!({ "planId": updated.id, "enabled": enabled }));
    Ok(Json(updated))
}

async fn enable_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<plan::SnapPlan>, AppError> {
    set_enabled(state, id, true).await
}

async fn disable_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<plan::SnapPlan>, AppError> {
    set_enabled(state, id, false).await
}

async fn prune_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let plan = load_plan(&state, id).await?;
    let pruned = retention::prune_plan(&state, &plan).await?;
    Ok(Json(json!({ "pruned": pruned })))
}

/// Deleting a plan deletes its snapshots too; their blocks wait for orphan collection.
async fn delete_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let plan = load_plan(&state, id).await?;
    if state.is_plan_running(&plan.id).await {
        return Err(AppError::Conflict("A snapshot of this plan is in flight".into()));
    }

    let plan_id = plan.id.clone();
    let snapshots = with_conn(&state.db, move |conn| snapshot::find_all(conn, Some(&plan_id))).await?;
    for record in &snapshots {
        retention::delete_snapshot(&state, &record.id).await?;
    }

    let plan_id = plan.id.clone();
    with_conn(&state.db, move |conn| plan::delete(conn, &plan_id)).await?;
    tracing::info!(plan_id = %plan.id, snapshots = snapshots.len(), "Plan deleted");
    state.ui.broadcast("plan:deleted", json!({ "planId": plan.id }));
    Ok(StatusCode::NO_CONTENT)
}
