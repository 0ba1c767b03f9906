use crate::error::AppError;
use crate::services::scrub_runner;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(scrub_status).post(start_scrub))
}

async fn scrub_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "running": state.engine.scrubber.is_running(),
        "last_report": state.engine.scrubber.last_report(),
    }))
}

/// Start a scrub in the background; its report arrives as a `scrub:completed` event.
async fn start_scrub(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if state.engine.scrubber.is_running() {
        return Err(AppError::Conflict("A scrub is already running".into()));
    }

    tokio::spawn(async move {
        match scrub_runner::run_scrub(&state).await {
            Ok(report) => tracing::info!(checked = report.checked, clean = report.is_clean(), "Scrub finished"),
            Err(AppError::Conflict(_)) => tracing::warn!("Scrub already running"),
            Err(e) => tracing::error!(error = %e, "Scrub failed"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}
