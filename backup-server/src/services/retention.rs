use crate::db::connection::with_conn;
use crate::models::plan::SnapPlan;
use crate::models::snapshot;
use crate::state::AppState;
use backup_engine::prune::{apply_policy, PruneCandidate};
use serde_json::json;

/// Apply a plan's retention policy, deleting the snapshots it does not keep.
/// Returns the ids of the deleted snapshots. Blocks are left for orphan collection.
pub async fn prune_plan(state: &AppState, plan: &SnapPlan) -> anyhow::Result<Vec<String>> {
    let policy = plan.retention();
    if policy.is_unbounded() {
        return Ok(Vec::new());
    }

    let plan_id = plan.id.clone();
    let records = with_conn(&state.db, move |conn| snapshot::find_completed_by_plan(conn, &plan_id)).await?;
    let candidates: Vec<PruneCandidate> = records
        .iter()
        .filter_map(|r| {
            r.timestamp().map(|timestamp| PruneCandidate {
                id: r.id.clone(),
                timestamp,
            })
        })
        .collect();

    let doomed: Vec<String> = apply_policy(&candidates, &policy)
        .into_iter()
        .filter(|e| e.is_pruned())
        .map(|e| e.id)
        .collect();

    for id in &doomed {
        delete_snapshot(state, id).await?;
    }

    if !doomed.is_empty() {
        tracing::info!(plan_id = %plan.id, pruned = doomed.len(), kept = candidates.len() - doomed.len(), "Retention applied");
        state.ui.broadcast("plan:pruned", json!({ "planId": plan.id, "snapshotIds": doomed }));
    }
    Ok(doomed)
}

/// Remove a snapshot's metadata row, then its manifest. Returns false if no row existed.
pub async fn delete_snapshot(state: &AppState, id: &str) -> anyhow::Result<bool> {
    let engine = state.engine.clone();
    let sid = id.to_string();
    let deleted = with_conn(&state.db, move |conn| {
        if !snapshot::delete(conn, &sid)? {
            return Ok(false);
        }
        // A leftover manifest is unlisted and harmless; a row without one is not
        if let Err(e) = engine.snapshots.delete_manifest(&sid) {
            tracing::warn!(snapshot_id = %sid, error = %e, "Failed to remove manifest");
        }
        Ok(true)
    })
    .await?;

    if deleted {
        tracing::info!(snapshot_id = %id, "Snapshot deleted");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::{self, CreatePlanRequest};
    use crate::models::snapshot::NewSnapshot;
    use crate::state::test_support::test_state;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prune_keeps_newest_per_day() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let plan = with_conn(&state.db, |conn| {
            plan::create(
                conn,
                &CreatePlanRequest {
                    name: "daily".into(),
                    schedule: "0 2 * * *".into(),
                    paths: vec!["/data".into()],
                    keep_daily: 2,
                    keep_weekly: 0,
                    keep_monthly: 0,
                    enabled: true,
                },
            )
        })
        .await
        .unwrap();

        let now = Utc::now();
        let plan_id = plan.id.clone();
        with_conn(&state.db, move |conn| {
            for days in 0..4 {
                let id = format!("s{days}");
                snapshot::insert_completed(
                    conn,
                    &NewSnapshot {
                        id: &id,
                        plan_id: &plan_id,
                        created_at: now - Duration::days(days),
                        manifest_path: "/nonexistent.json",
                        size: 1,
                        file_count: 1,
                        skipped_count: 0,
                    },
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let mut pruned = prune_plan(&state, &plan).await.unwrap();
        pruned.sort();
        assert_eq!(pruned, vec!["s2", "s3"]);

        let plan_id = plan.id.clone();
        let left = with_conn(&state.db, move |conn| snapshot::find_completed_by_plan(conn, &plan_id))
            .await
            .unwrap();
        assert_eq!(left.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["s0", "s1"]);
    }

    #[tokio::test]
    async fn test_delete_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        assert!(!delete_snapshot(&state, "missing").await.unwrap());
    }
}
