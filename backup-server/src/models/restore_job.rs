use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: String,
    pub snapshot_id: String,
    pub target_path: String,
    /// pending, running, completed, partial, failed or cancelled
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub files_restored: i64,
    pub files_failed: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
}

pub struct RestoreResult<'a> {
    pub status: &'a str,
    pub message: &'a str,
    pub files_restored: usize,
    pub files_failed: usize,
}

fn row_to_job(row: &Row) -> rusqlite::Result<RestoreJob> {
    Ok(RestoreJob {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        target_path: row.get("target_path")?,
        status: row.get("status")?,
        progress: row.get("progress")?,
        message: row.get("message")?,
        files_restored: row.get("files_restored")?,
        files_failed: row.get("files_failed")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

pub fn create(conn: &Connection, id: &str, snapshot_id: &str, target_path: &str) -> anyhow::Result<RestoreJob> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO restore_jobs (id, snapshot_id, target_path, message, started_at)
         VALUES (?1, ?2, ?3, 'queued', ?4)",
        params![id, snapshot_id, target_path, now],
    )?;
    find_by_id(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created restore job"))
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<RestoreJob>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_job)?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_snapshot(conn: &Connection, snapshot_id: &str) -> anyhow::Result<Vec<RestoreJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM restore_jobs WHERE snapshot_id = ? ORDER BY started_at DESC",
    )?;
    let rows = stmt.query_map(params![snapshot_id], row_to_job)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn mark_running(conn: &Connection, id: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE restore_jobs SET status = 'running', message = 'restoring' WHERE id = ?",
        params![id],
    )?;
    Ok(())
}

pub fn finish(conn: &Connection, id: &str, result: &RestoreResult) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE restore_jobs SET status = ?1, message = ?2, files_restored = ?3, files_failed = ?4,
             progress = CASE WHEN ?1 = 'completed' THEN 1.0 ELSE progress END, completed_at = ?5
         WHERE id = ?6",
        params![
            result.status,
            result.message,
            result.files_restored as i64,
            result.files_failed as i64,
            now,
            id,
        ],
    )?;
    Ok(())
}

pub fn set_progress(conn: &Connection, id: &str, progress: f64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE restore_jobs SET progress = MAX(progress, ?1) WHERE id = ?2",
        params![progress, id],
    )?;
    Ok(())
}
