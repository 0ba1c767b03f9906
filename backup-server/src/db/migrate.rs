use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snap_plans (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  schedule TEXT NOT NULL,
  paths TEXT NOT NULL DEFAULT '[]',
  keep_daily INTEGER NOT NULL DEFAULT 7,
  keep_weekly INTEGER NOT NULL DEFAULT 4,
  keep_monthly INTEGER NOT NULL DEFAULT 6,
  enabled INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
  id TEXT PRIMARY KEY,
  plan_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  manifest_path TEXT,
  size INTEGER NOT NULL DEFAULT 0,
  file_count INTEGER NOT NULL DEFAULT 0,
  skipped_count INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL CHECK(status IN ('completed','failed','cancelled')),
  error TEXT
);

CREATE TABLE IF NOT EXISTS restore_jobs (
  id TEXT PRIMARY KEY,
  snapshot_id TEXT NOT NULL,
  target_path TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','completed','partial','failed','cancelled')),
  progress REAL NOT NULL DEFAULT 0,
  message TEXT NOT NULL DEFAULT '',
  files_restored INTEGER NOT NULL DEFAULT 0,
  files_failed INTEGER NOT NULL DEFAULT 0,
  started_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_snapshots_plan_id ON snapshots(plan_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_created_at ON snapshots(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_restore_jobs_snapshot_id ON restore_jobs(snapshot_id);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Restore jobs left mid-flight by a crash can never finish
    let stale = conn.execute(
        "UPDATE restore_jobs SET status = 'failed', message = 'interrupted by restart', completed_at = ?1
         WHERE status IN ('pending','running')",
        [chrono::Utc::now().to_rfc3339()],
    )?;
    if stale > 0 {
        tracing::warn!(count = stale, "[DB] Marked interrupted restore jobs as failed");
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
