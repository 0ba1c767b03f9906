use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::snapshot;
use crate::state::AppState;
use anyhow::Context;
use backup_engine::snapshot::manifest::SnapshotManifest;
use backup_engine::store::OrphanReport;
use backup_engine::tasks::TaskKind;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;

/// Delete every block no persisted manifest references.
///
/// Refused while snapshots or restores are in flight: a running snapshot
/// has stored blocks that no manifest lists yet.
pub async fn collect_orphans(state: &AppState) -> Result<OrphanReport, AppError> {
    let busy = || AppError::Conflict("Snapshot or restore tasks are in flight".into());
    if state.engine.tasks.count_kind(TaskKind::Snapshot) > 0 {
        return Err(busy());
    }
    let _exclusive = state.gc_lock.clone().try_write_owned().map_err(|_| busy())?;

    let manifests = with_conn(&state.db, snapshot::manifest_paths).await?;
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || -> anyhow::Result<OrphanReport> {
        let mut referenced = HashSet::new();
        // An unreadable manifest aborts the pass; its blocks must not be treated as orphans
        for (id, path) in &manifests {
            let manifest = SnapshotManifest::load(Path::new(path))
                .with_context(|| format!("loading manifest of snapshot {id}"))?;
            referenced.extend(manifest.referenced_hashes());
        }
        tracing::info!(manifests = manifests.len(), referenced = referenced.len(), "Collecting orphan blocks");
        Ok(engine.store.collect_orphans(&referenced)?)
    })
    .await??;

    state.ui.broadcast(
        "blocks:cleaned",
        json!({ "blocksRemoved": report.blocks_removed, "bytesReclaimed": report.bytes_reclaimed }),
    );
    Ok(report)
}
