use backup_engine::prune::RetentionPolicy;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapPlan {
    pub id: String,
    pub name: String,
    /// Cron expression, 5 fields or 6 with seconds
    pub schedule: String,
    pub paths: Vec<String>,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl SnapPlan {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_daily: self.keep_daily,
            keep_weekly: self.keep_weekly,
            keep_monthly: self.keep_monthly,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    pub schedule: String,
    pub paths: Vec<String>,
    #[serde(default = "default_keep_daily")]
    pub keep_daily: u32,
    #[serde(default = "default_keep_weekly")]
    pub keep_weekly: u32,
    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_keep_daily() -> u32 { 7 }
fn default_keep_weekly() -> u32 { 4 }
fn default_keep_monthly() -> u32 { 6 }
fn default_enabled() -> bool { true }

#[derive(Debug, Default, Deserialize)]
pub struct UpdatePlanRequest {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub paths: Option<Vec<String>>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub enabled: Option<bool>,
}

fn row_to_plan(row: &Row) -> rusqlite::Result<SnapPlan> {
    let paths: String = row.get("paths")?;
    Ok(SnapPlan {
        id: row.get("id")?,
        name: row.get("name")?,
        schedule: row.get("schedule")?,
        paths: serde_json::from_str(&paths).unwrap_or_default(),
        keep_daily: row.get("keep_daily")?,
        keep_weekly: row.get("keep_weekly")?,
        keep_monthly: row.get("keep_monthly")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<SnapPlan>> {
    let mut stmt = conn.prepare("SELECT * FROM snap_plans ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_plan)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_enabled(conn: &Connection) -> anyhow::Result<Vec<SnapPlan>> {
    let mut stmt = conn.prepare("SELECT * FROM snap_plans WHERE enabled = 1 ORDER BY created_at")?;
    let rows = stmt.query_map([], row_to_plan)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<SnapPlan>> {
    let mut stmt = conn.prepare("SELECT * FROM snap_plans WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_plan)?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn create(conn: &Connection, data: &CreatePlanRequest) -> anyhow::Result<SnapPlan> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let paths_json = serde_json::to_string(&data.paths)?;
    conn.execute(
        "INSERT INTO snap_plans (id, name, schedule, paths, keep_daily, keep_weekly, keep_monthly, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            data.name,
            data.schedule,
            paths_json,
            data.keep_daily,
            data.keep_weekly,
            data.keep_monthly,
            data.enabled as i64,
            now,
            now,
        ],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created plan"))
}

pub fn update(conn: &Connection, id: &str, data: &UpdatePlanRequest) -> anyhow::Result<Option<SnapPlan>> {
    if find_by_id(conn, id)?.is_none() {
        return Ok(None);
    }

    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref name) = data.name {
        sets.push("name = ?");
        values.push(Box::new(name.clone()));
    }
    if let Some(ref schedule) = data.schedule {
        sets.push("schedule = ?");
        values.push(Box::new(schedule.clone()));
    }
    if let Some(ref paths) = data.paths {
        sets.push("paths = ?");
        values.push(Box::new(serde_json::to_string(paths)?));
    }
    if let Some(keep_daily) = data.keep_daily {
        sets.push("keep_daily = ?");
        values.push(Box::new(keep_daily));
    }
    if let Some(keep_weekly) = data.keep_weekly {
        sets.push("keep_weekly = ?");
        values.push(Box::new(keep_weekly));
    }
    if let Some(keep_monthly) = data.keep_monthly {
        sets.push("keep_monthly = ?");
        values.push(Box::new(keep_monthly));
    }
    if let Some(enabled) = data.enabled {
        sets.push("enabled = ?");
        values.push(Box::new(enabled as i64));
    }

    if sets.is_empty() {
        return find_by_id(conn, id);
    }

    sets.push("updated_at = ?");
    values.push(Box::new(chrono::Utc::now().to_rfc3339()));
    values.push(Box::new(id.to_string()));

    let sql = format!("UPDATE snap_plans SET {} WHERE id = ?", sets.join(", "));
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, params.as_slice())?;
    find_by_id(conn, id)
}

pub fn set_enabled(conn: &Connection, id: &str, enabled: bool) -> anyhow::Result<Option<SnapPlan>> {
    update(
        conn,
        id,
        &UpdatePlanRequest {
            enabled: Some(enabled),
            ..Default::default()
        },
    )
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM snap_plans WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

pub fn count(conn: &Connection) -> anyhow::Result<(i64, i64)> {
    let counts = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM snap_plans",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(counts)
}
