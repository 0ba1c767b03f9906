use crate::db::connection::with_conn;
use crate::models::restore_job::{self, RestoreJob, RestoreResult};
use crate::models::snapshot::SnapshotRecord;
use crate::services::progress::BroadcastProgress;
use crate::state::AppState;
use crate::ws::ui::REPLAY_RETENTION;
use backup_engine::restore::{RestoreOutcome, RestoreStatus};
use backup_engine::snapshot::manifest::SnapshotManifest;
use backup_engine::tasks::{TaskHandle, TaskKind, TaskStatus};
use backup_engine::EngineError;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Failures listed in the completion event; the rest are only counted
const MAX_REPORTED_FAILURES: usize = 50;

/// Create a restore job for a completed snapshot and run it in the background.
pub async fn submit(state: Arc<AppState>, snapshot: SnapshotRecord, target: PathBuf) -> anyhow::Result<RestoreJob> {
    if state.is_shutting_down() {
        anyhow::bail!("server is shutting down");
    }
    let manifest_path = snapshot
        .manifest_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("snapshot {} has no manifest", snapshot.id))?;

    let id = Uuid::new_v4().to_string();
    let handle = state.engine.tasks.register(&id, TaskKind::Restore)?;

    let (rid, sid, tp) = (id.clone(), snapshot.id.clone(), target.to_string_lossy().to_string());
    let job = match with_conn(&state.db, move |conn| restore_job::create(conn, &rid, &sid, &tp)).await {
        Ok(job) => job,
        Err(e) => {
            state.engine.tasks.remove(&id);
            return Err(e);
        }
    };

    tracing::info!(restore_id = %id, snapshot_id = %snapshot.id, target = %target.display(), "Restore accepted");
    tokio::spawn(run(state, snapshot.id, PathBuf::from(manifest_path), target, handle));
    Ok(job)
}

async fn run(state: Arc<AppState>, snapshot_id: String, manifest_path: PathBuf, target: PathBuf, handle: TaskHandle) {
    let id = handle.id().to_string();
    let result = execute(&state, &snapshot_id, &manifest_path, &target, &handle).await;

    let (status, message, restored, failed) = match &result {
        Ok(outcome) => (outcome.status.as_str(), summarize(outcome), outcome.files_restored, outcome.failures.len()),
        Err(e) if matches!(e.downcast_ref::<EngineError>(), Some(EngineError::Cancelled)) => {
            ("cancelled", "cancelled before start".to_string(), 0, 0)
        }
        Err(e) => ("failed", format!("{e:#}"), 0, 0),
    };

    let progress = handle.snapshot().map(|t| t.progress).unwrap_or(0.0);
    let (rid, msg) = (id.clone(), message.clone());
    if let Err(e) = with_conn(&state.db, move |conn| {
        restore_job::set_progress(conn, &rid, progress)?;
        restore_job::finish(
            conn,
            &rid,
            &RestoreResult {
                status,
                message: &msg,
                files_restored: restored,
                files_failed: failed,
            },
        )
    })
    .await
    {
        tracing::error!(restore_id = %id, error = %e, "Failed to record restore outcome");
    }

    let task_status = match status {
        "completed" | "partial" => TaskStatus::Completed,
        _ => TaskStatus::Failed,
    };
    state.engine.tasks.complete(&id, task_status, &message);

    match result {
        Ok(outcome) if matches!(outcome.status, RestoreStatus::Completed | RestoreStatus::Partial) => {
            let failures: Vec<_> = outcome.failures.iter().take(MAX_REPORTED_FAILURES).collect();
            state.ui.broadcast(
                "restore:completed",
                json!({
                    "taskId": id,
                    "snapshotId": snapshot_id,
                    "status": status,
                    "filesRestored": restored,
                    "filesFailed": failed,
                    "bytesRestored": outcome.bytes_restored,
                    "failures": failures,
                }),
            );
        }
        _ => {
            tracing::warn!(restore_id = %id, status, error = %message, "Restore did not complete");
            state.ui.broadcast(
                "restore:failed",
                json!({ "taskId": id, "snapshotId": snapshot_id, "status": status, "error": message }),
            );
        }
    }
    state.ui.forget_after(&id, REPLAY_RETENTION);
}

async fn execute(
    state: &Arc<AppState>,
    snapshot_id: &str,
    manifest_path: &Path,
    target: &Path,
    handle: &TaskHandle,
) -> anyhow::Result<RestoreOutcome> {
    let id = handle.id().to_string();
    let cancel = handle.cancel_token();

    let _permit = tokio::select! {
        permit = state.task_slots.clone().acquire_owned() => permit?,
        _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
    };
    // Blocks read by a restore must outlive it
    let _gc = state.gc_lock.clone().read_owned().await;

    let rid = id.clone();
    with_conn(&state.db, move |conn| restore_job::mark_running(conn, &rid)).await?;
    handle.set_running("loading manifest");
    state.ui.broadcast(
        "restore:started",
        json!({ "taskId": id, "snapshotId": snapshot_id, "target": target.to_string_lossy() }),
    );

    let engine = state.engine.clone();
    let progress = BroadcastProgress::new(handle.clone(), state.ui.clone(), "restore");
    let (manifest_path, target) = (manifest_path.to_path_buf(), target.to_path_buf());
    let outcome = tokio::task::spawn_blocking(move || {
        let manifest = SnapshotManifest::load(&manifest_path)?;
        engine.restores.restore(&manifest, &target, &progress)
    })
    .await??;
    Ok(outcome)
}

fn summarize(outcome: &RestoreOutcome) -> String {
    match outcome.status {
        RestoreStatus::Completed => format!("restored {} entries", outcome.files_restored),
        RestoreStatus::Cancelled => format!("cancelled after {} entries", outcome.files_restored),
        _ => format!(
            "restored {} entries, {} failed",
            outcome.files_restored,
            outcome.failures.len()
        ),
    }
}
