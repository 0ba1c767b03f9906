use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Metadata row of one snapshot. Completed rows point at a manifest file;
/// failed and cancelled runs are recorded without one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub plan_id: String,
    pub created_at: String,
    pub manifest_path: Option<String>,
    pub size: i64,
    pub file_count: i64,
    pub skipped_count: i64,
    pub status: String,
    pub error: Option<String>,
}

impl SnapshotRecord {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub struct NewSnapshot<'a> {
    pub id: &'a str,
    pub plan_id: &'a str,
    pub created_at: DateTime<Utc>,
    pub manifest_path: &'a str,
    pub size: u64,
    pub file_count: u64,
    pub skipped_count: usize,
}

/// Fixed-width timestamps so text ordering matches time ordering
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        id: row.get("id")?,
        plan_id: row.get("plan_id")?,
        created_at: row.get("created_at")?,
        manifest_path: row.get("manifest_path")?,
        size: row.get("size")?,
        file_count: row.get("file_count")?,
        skipped_count: row.get("skipped_count")?,
        status: row.get("status")?,
        error: row.get("error")?,
    })
}

pub fn insert_completed(conn: &Connection, data: &NewSnapshot) -> anyhow::Result<SnapshotRecord> {
    conn.execute(
        "INSERT INTO snapshots (id, plan_id, created_at, manifest_path, size, file_count, skipped_count, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'completed')",
        params![
            data.id,
            data.plan_id,
            format_timestamp(&data.created_at),
            data.manifest_path,
            data.size as i64,
            data.file_count as i64,
            data.skipped_count as i64,
        ],
    )?;
    find_by_id(conn, data.id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created snapshot"))
}

/// Record a run that produced no manifest (`status` is `failed` or `cancelled`).
pub fn insert_unfinished(conn: &Connection, id: &str, plan_id: &str, status: &str, error: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO snapshots (id, plan_id, created_at, status, error) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, plan_id, format_timestamp(&Utc::now()), status, error],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<SnapshotRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_snapshot)?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_all(conn: &Connection, plan_id: Option<&str>) -> anyhow::Result<Vec<SnapshotRecord>> {
    let (sql, args) = match plan_id {
        Some(plan_id) => (
            "SELECT * FROM snapshots WHERE plan_id = ? ORDER BY created_at DESC",
            vec![plan_id.to_string()],
        ),
        None => ("SELECT * FROM snapshots ORDER BY created_at DESC", Vec::new()),
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_snapshot)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Completed snapshots of a plan, newest first
pub fn find_completed_by_plan(conn: &Connection, plan_id: &str) -> anyhow::Result<Vec<SnapshotRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM snapshots WHERE plan_id = ? AND status = 'completed' ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![plan_id], row_to_snapshot)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// When the plan last attempted a snapshot, whatever the outcome
pub fn latest_attempt_at(conn: &Connection, plan_id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    let created_at: Option<String> = conn
        .query_row(
            "SELECT created_at FROM snapshots WHERE plan_id = ? ORDER BY created_at DESC LIMIT 1",
            params![plan_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(created_at
        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc)))
}

/// Delete all but the newest `keep` failed or cancelled rows of a plan.
pub fn prune_unfinished(conn: &Connection, plan_id: &str, keep: usize) -> anyhow::Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM snapshots WHERE plan_id = ?1 AND status != 'completed' AND id NOT IN (
             SELECT id FROM snapshots WHERE plan_id = ?1 AND status != 'completed'
             ORDER BY created_at DESC LIMIT ?2
         )",
        params![plan_id, keep as i64],
    )?;
    Ok(deleted)
}

/// Manifest paths of every completed snapshot
pub fn manifest_paths(conn: &Connection) -> anyhow::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, manifest_path FROM snapshots WHERE status = 'completed' AND manifest_path IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM snapshots WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

/// (completed snapshot count, total logical bytes)
pub fn totals(conn: &Connection) -> anyhow::Result<(i64, i64)> {
    let totals = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM snapshots WHERE status = 'completed'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(totals)
}
