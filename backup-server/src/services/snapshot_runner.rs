use crate::db::connection::with_conn;
use crate::models::plan::SnapPlan;
use crate::models::snapshot::{self, NewSnapshot, SnapshotRecord};
use crate::services::progress::BroadcastProgress;
use crate::services::retention;
use crate::state::AppState;
use crate::ws::ui::REPLAY_RETENTION;
use backup_engine::snapshot::SnapshotRequest;
use backup_engine::tasks::{TaskHandle, TaskKind, TaskStatus};
use backup_engine::EngineError;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Failed and cancelled rows kept per plan for status lookups
pub const MAX_UNFINISHED_PER_PLAN: usize = 10;

/// Accept a snapshot of `plan` and run it in the background.
///
/// Returns the task id (which becomes the snapshot id), or `None` when the
/// plan already has a snapshot in flight.
pub async fn submit(state: Arc<AppState>, plan: SnapPlan) -> anyhow::Result<Option<String>> {
    if state.is_shutting_down() {
        anyhow::bail!("server is shutting down");
    }
    if !state.try_begin_plan(&plan.id).await {
        return Ok(None);
    }

    let id = Uuid::new_v4().to_string();
    let handle = match state.engine.tasks.register(&id, TaskKind::Snapshot) {
        Ok(handle) => handle,
        Err(e) => {
            state.end_plan(&plan.id).await;
            return Err(e.into());
        }
    };

    tracing::info!(snapshot_id = %id, plan_id = %plan.id, "Snapshot accepted");
    tokio::spawn(run(state, plan, handle));
    Ok(Some(id))
}

async fn run(state: Arc<AppState>, plan: SnapPlan, handle: TaskHandle) {
    let id = handle.id().to_string();

    match execute(&state, &plan, &handle).await {
        Ok(record) => {
            state.engine.tasks.complete(&id, TaskStatus::Completed, "completed");
            state.ui.broadcast(
                "snapshot:completed",
                json!({
                    "taskId": id,
                    "planId": plan.id,
                    "size": record.size,
                    "fileCount": record.file_count,
                    "skipped": record.skipped_count,
                }),
            );

            if let Err(e) = retention::prune_plan(&state, &plan).await {
                tracing::error!(plan_id = %plan.id, error = %e, "Retention failed");
            }
        }
        Err(e) => {
            let cancelled = matches!(e.downcast_ref::<EngineError>(), Some(EngineError::Cancelled));
            let status = if cancelled { "cancelled" } else { "failed" };
            let message = format!("{e:#}");
            if cancelled {
                tracing::info!(snapshot_id = %id, plan_id = %plan.id, "Snapshot cancelled");
            } else {
                tracing::error!(snapshot_id = %id, plan_id = %plan.id, error = %message, "Snapshot failed");
            }

            // Record the outcome before the task leaves the live table
            let (sid, pid, msg) = (id.clone(), plan.id.clone(), message.clone());
            if let Err(db_err) = with_conn(&state.db, move |conn| {
                snapshot::insert_unfinished(conn, &sid, &pid, status, &msg)?;
                snapshot::prune_unfinished(conn, &pid, MAX_UNFINISHED_PER_PLAN)?;
                Ok(())
            })
            .await
            {
                tracing::warn!(snapshot_id = %id, error = %db_err, "Failed to record snapshot outcome");
            }

            state.engine.tasks.complete(&id, TaskStatus::Failed, &message);
            state.ui.broadcast(
                "snapshot:failed",
                json!({ "taskId": id, "planId": plan.id, "error": message, "cancelled": cancelled }),
            );
        }
    }

    state.ui.forget_after(&id, REPLAY_RETENTION);
    state.end_plan(&plan.id).await;
}

async fn execute(state: &Arc<AppState>, plan: &SnapPlan, handle: &TaskHandle) -> anyhow::Result<SnapshotRecord> {
    let id = handle.id().to_string();
    let cancel = handle.cancel_token();

    // Stay pending until a slot frees; a cancel while waiting ends the task
    let _permit = tokio::select! {
        permit = state.task_slots.clone().acquire_owned() => permit?,
        _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
    };
    let _gc = state.gc_lock.clone().read_owned().await;

    handle.set_running("scanning");
    state.ui.broadcast("snapshot:started", json!({ "taskId": id, "planId": plan.id, "paths": plan.paths }));

    let request = SnapshotRequest {
        id: id.clone(),
        plan_id: plan.id.clone(),
        paths: plan.paths.iter().map(PathBuf::from).collect(),
    };
    let engine = state.engine.clone();
    let progress = BroadcastProgress::new(handle.clone(), state.ui.clone(), "snapshot");
    let output = tokio::task::spawn_blocking(move || engine.snapshots.create_snapshot(&request, &progress)).await??;

    let manifest = output.manifest;
    let manifest_path = output.manifest_path.to_string_lossy().to_string();
    let (sid, pid) = (id.clone(), plan.id.clone());
    let inserted = with_conn(&state.db, move |conn| {
        snapshot::insert_completed(
            conn,
            &NewSnapshot {
                id: &sid,
                plan_id: &pid,
                created_at: manifest.timestamp,
                manifest_path: &manifest_path,
                size: manifest.size,
                file_count: manifest.file_count,
                skipped_count: manifest.skipped.len(),
            },
        )
    })
    .await;

    match inserted {
        Ok(record) => Ok(record),
        Err(e) => {
            // Without a row the manifest must not survive either
            if let Err(rm) = state.engine.snapshots.delete_manifest(&id) {
                tracing::warn!(snapshot_id = %id, error = %rm, "Failed to remove manifest after insert failure");
            }
            Err(e.context("recording snapshot metadata"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::{self, CreatePlanRequest};
    use crate::state::test_support::test_state;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn create_plan(state: &AppState, path: &std::path::Path) -> SnapPlan {
        let paths = vec![path.to_string_lossy().to_string()];
        with_conn(&state.db, move |conn| {
            plan::create(
                conn,
                &CreatePlanRequest {
                    name: "test".into(),
                    schedule: "0 2 * * *".into(),
                    paths,
                    keep_daily: 0,
                    keep_weekly: 0,
                    keep_monthly: 0,
                    enabled: true,
                },
            )
        })
        .await
        .unwrap()
    }

    async fn wait_until_finished(state: &AppState, id: &str) {
        for _ in 0..200 {
            if state.engine.tasks.get(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn test_snapshot_records_metadata() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        std::fs::write(data.path().join("a.txt"), b"hello").unwrap();
        let state = test_state(&work);
        let plan = create_plan(&state, data.path()).await;

        let id = submit(state.clone(), plan.clone()).await.unwrap().unwrap();
        wait_until_finished(&state, &id).await;

        let sid = id.clone();
        let record = with_conn(&state.db, move |conn| snapshot::find_by_id(conn, &sid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "completed");
        assert_eq!(record.file_count, 1);
        assert_eq!(record.size, 5);
        assert!(std::path::Path::new(record.manifest_path.as_deref().unwrap()).exists());
        assert!(!state.is_plan_running(&plan.id).await);
    }

    #[tokio::test]
    async fn test_plan_runs_once_at_a_time() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let plan = create_plan(&state, data.path()).await;

        assert!(state.try_begin_plan(&plan.id).await);
        assert!(submit(state.clone(), plan.clone()).await.unwrap().is_none());
        state.end_plan(&plan.id).await;
    }

    #[tokio::test]
    async fn test_cancel_while_pending_records_cancelled() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let plan = create_plan(&state, data.path()).await;

        // Hold every slot so the snapshot stays pending
        let slots = state.config.max_concurrent_tasks as u32;
        let held = state.task_slots.clone().acquire_many_owned(slots).await.unwrap();

        let id = submit(state.clone(), plan).await.unwrap().unwrap();
        assert!(state.engine.tasks.cancel(&id));
        wait_until_finished(&state, &id).await;
        drop(held);

        let sid = id.clone();
        let record = with_conn(&state.db, move |conn| snapshot::find_by_id(conn, &sid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "cancelled");
        assert!(record.manifest_path.is_none());
        assert!(!state.engine.snapshots.manifest_path(&id).exists());
    }

    #[tokio::test]
    async fn test_unfinished_rows_are_capped_per_plan() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let plan = create_plan(&state, data.path()).await;

        let slots = state.config.max_concurrent_tasks as u32;
        let held = state.task_slots.clone().acquire_many_owned(slots).await.unwrap();
        for _ in 0..MAX_UNFINISHED_PER_PLAN + 3 {
            let id = submit(state.clone(), plan.clone()).await.unwrap().unwrap();
            state.engine.tasks.cancel(&id);
            wait_until_finished(&state, &id).await;
            while state.is_plan_running(&plan.id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        drop(held);

        let pid = plan.id.clone();
        let rows = with_conn(&state.db, move |conn| snapshot::find_all(conn, Some(&pid)))
            .await
            .unwrap();
        assert_eq!(rows.len(), MAX_UNFINISHED_PER_PLAN);
        assert!(rows.iter().all(|r| r.status == "cancelled"));
    }

    #[tokio::test]
    async fn test_no_snapshot_starts_after_shutdown() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let plan = create_plan(&state, data.path()).await;

        state.shutdown.cancel();
        assert!(submit(state.clone(), plan.clone()).await.is_err());
        assert_eq!(crate::services::scheduler::tick(state.clone()).await.unwrap(), 0);
        assert_eq!(state.engine.tasks.running_count(), 0);
        assert!(!state.is_plan_running(&plan.id).await);
    }
}
