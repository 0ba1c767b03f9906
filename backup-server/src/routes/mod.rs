pub mod blocks;
pub mod plans;
pub mod restores;
pub mod scrub;
pub mod snapshots;
pub mod stats;
pub mod tasks;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/plans", plans::router(state.clone()))
        .nest("/api/snapshots", snapshots::router(state.clone()))
        .nest("/api/tasks", tasks::router(state.clone()))
        .nest("/api/restores", restores::router(state.clone()))
        .nest("/api/scrub", scrub::router(state.clone()))
        .nest("/api/stats", stats::router(state.clone()))
        .nest("/api/blocks", blocks::router(state.clone()))
        .route("/health", get(health))
        .route("/ws", get(crate::ws::ui::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(req).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Poll until the task has left the live table and report its final status
    async fn wait_for_task(app: &Router, id: &str) -> Value {
        for _ in 0..200 {
            let status = json_body(send(app, "GET", &format!("/api/tasks/{id}"), None).await).await;
            if status["live"] == false {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} did not finish");
    }

    async fn create_plan(app: &Router, path: &str) -> String {
        let response = send(
            app,
            "POST",
            "/api/plans",
            Some(json!({ "name": "docs", "schedule": "0 2 * * *", "paths": [path] })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));
        let response = send(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_plan_validation() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        for body in [
            json!({ "name": "x", "schedule": "every tuesday", "paths": ["/srv"] }),
            json!({ "name": "x", "schedule": "0 2 * * *", "paths": ["relative/dir"] }),
            json!({ "name": "x", "schedule": "0 2 * * *", "paths": [] }),
            json!({ "name": " ", "schedule": "0 2 * * *", "paths": ["/srv"] }),
        ] {
            let response = send(&app, "POST", "/api/plans", Some(body)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert!(json_body(response).await["error"].is_string());
        }

        let response = send(&app, "GET", "/api/plans/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_snapshot_requests_are_checked() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response = send(&app, "POST", "/api/snapshots", Some(json!({ "plan_id": "nope" }))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let gone = dir.path().join("does-not-exist");
        let plan_id = create_plan(&app, &gone.to_string_lossy()).await;
        let response = send(&app, "POST", "/api/snapshots", Some(json!({ "plan_id": plan_id }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(send(&app, "GET", "/api/tasks/unknown", None).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            send(&app, "POST", "/api/tasks/unknown/cancel", None).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_snapshots_refused_during_shutdown() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let app = create_router(state.clone());
        let plan_id = create_plan(&app, &data.path().to_string_lossy()).await;

        state.shutdown.cancel();
        let response = send(&app, "POST", "/api/snapshots", Some(json!({ "plan_id": plan_id }))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_snapshot_verify_restore_flow() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        std::fs::write(data.path().join("a.txt"), b"first file").unwrap();
        std::fs::write(data.path().join("b.txt"), vec![7u8; 10_000]).unwrap();
        let app = create_router(test_state(&work));

        let plan_id = create_plan(&app, &data.path().to_string_lossy()).await;
        let response = send(&app, "POST", "/api/snapshots", Some(json!({ "plan_id": plan_id }))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = json_body(response).await;
        assert_eq!(accepted["status"], "accepted");
        let snapshot_id = accepted["task_id"].as_str().unwrap().to_string();

        let done = wait_for_task(&app, &snapshot_id).await;
        assert_eq!(done["status"], "completed");
        assert_eq!(done["kind"], "snapshot");

        let listed = json_body(send(&app, "GET", &format!("/api/snapshots?plan_id={plan_id}"), None).await).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["file_count"], 2);

        let verified = send(&app, "POST", &format!("/api/snapshots/{snapshot_id}/verify"), None).await;
        assert_eq!(verified.status(), StatusCode::OK);
        let verified = json_body(verified).await;
        assert!(verified["missing"].as_array().unwrap().is_empty());
        assert!(verified["corrupt"].as_array().unwrap().is_empty());

        let target = TempDir::new().unwrap();
        let response = send(
            &app,
            "POST",
            &format!("/api/snapshots/{snapshot_id}/restore"),
            Some(json!({ "target_path": target.path() })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let restore_id = json_body(response).await["restore_id"].as_str().unwrap().to_string();

        let done = wait_for_task(&app, &restore_id).await;
        assert_eq!(done["status"], "completed");
        let job = json_body(send(&app, "GET", &format!("/api/restores/{restore_id}"), None).await).await;
        assert_eq!(job["files_failed"], 0);

        let restored = target.path().join(data.path().strip_prefix("/").unwrap());
        assert_eq!(std::fs::read(restored.join("a.txt")).unwrap(), b"first file");
        assert_eq!(std::fs::read(restored.join("b.txt")).unwrap(), vec![7u8; 10_000]);

        let stats = json_body(send(&app, "GET", "/api/stats", None).await).await;
        assert_eq!(stats["plans"]["total"], 1);
        assert_eq!(stats["snapshots"]["count"], 1);
        assert!(stats["store"]["blocks"].as_u64().unwrap() >= 2);

        let response = send(&app, "DELETE", &format!("/api/plans/{plan_id}"), None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cleaned = json_body(send(&app, "POST", "/api/blocks/cleanup", None).await).await;
        assert!(cleaned["blocks_removed"].as_u64().unwrap() >= 2);
    }
}
