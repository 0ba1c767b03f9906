use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::{plan, snapshot};
use crate::services::{scrub_runner, snapshot_runner};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Parse a plan schedule: standard 5-field cron, or 6 fields with seconds.
pub fn parse_schedule(expression: &str) -> anyhow::Result<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expression}': {e}"))
}

/// A plan is due when it has never attempted a snapshot, or when the first
/// occurrence of its schedule after the last attempt is not in the future.
/// Failed and cancelled attempts count, so they wait for the next occurrence.
pub fn is_plan_due(schedule: &str, last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let cron = parse_schedule(schedule)?;
    let Some(last) = last_attempt else {
        return Ok(true);
    };
    let next = cron
        .find_next_occurrence(&last, false)
        .map_err(|e| anyhow::anyhow!("no next occurrence for '{schedule}': {e}"))?;
    Ok(next <= now)
}

/// Start a snapshot for every enabled plan that is due. Returns how many started.
pub async fn tick(state: Arc<AppState>) -> anyhow::Result<usize> {
    if state.is_shutting_down() {
        return Ok(0);
    }
    let now = Utc::now();
    let plans = with_conn(&state.db, plan::find_enabled).await?;
    let mut started = 0;

    for plan in plans {
        let plan_id = plan.id.clone();
        let last = with_conn(&state.db, move |conn| snapshot::latest_attempt_at(conn, &plan_id)).await?;

        match is_plan_due(&plan.schedule, last, now) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(plan_id = %plan.id, error = %e, "Skipping plan with unusable schedule");
                continue;
            }
        }

        let (id, name) = (plan.id.clone(), plan.name.clone());
        match snapshot_runner::submit(state.clone(), plan).await {
            Ok(Some(snapshot_id)) => {
                tracing::info!(plan_id = %id, name = %name, snapshot_id = %snapshot_id, "Starting scheduled snapshot");
                started += 1;
            }
            Ok(None) => tracing::debug!(plan_id = %id, "Skipping scheduled run: plan already running"),
            Err(e) => tracing::error!(plan_id = %id, error = %e, "Failed to start scheduled snapshot"),
        }
    }
    Ok(started)
}

pub struct SnapshotScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl SnapshotScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    /// Register the plan tick and the scrub run.
    pub async fn init_jobs(&self) -> anyhow::Result<()> {
        let state = self.state.clone();
        let tick_job = Job::new_async(self.state.config.scheduler_cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = tick(state).await {
                    tracing::error!(error = %e, "Scheduler tick failed");
                }
            })
        })?;

        let state = self.state.clone();
        let scrub_job = Job::new_async(self.state.config.scrub_cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                match scrub_runner::run_scrub(&state).await {
                    Ok(report) => tracing::info!(checked = report.checked, clean = report.is_clean(), "Scheduled scrub finished"),
                    Err(AppError::Conflict(_)) => tracing::warn!("Skipping scheduled scrub: one is already running"),
                    Err(e) => tracing::error!(error = %e, "Scheduled scrub failed"),
                }
            })
        })?;

        let scheduler = self.scheduler.lock().await;
        scheduler.add(tick_job).await?;
        scheduler.add(scrub_job).await?;
        tracing::info!(
            tick = %self.state.config.scheduler_cron,
            scrub = %self.state.config.scrub_cron,
            "Scheduler jobs registered"
        );
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::CreatePlanRequest;
    use crate::state::test_support::test_state;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_never_run_plan_is_due() {
        assert!(is_plan_due("0 2 * * *", None, at(1, 0, 0)).unwrap());
    }

    #[test]
    fn test_due_after_next_occurrence() {
        let last = at(1, 2, 0);
        assert!(!is_plan_due("0 2 * * *", Some(last), at(2, 1, 59)).unwrap());
        assert!(is_plan_due("0 2 * * *", Some(last), at(2, 2, 0)).unwrap());
    }

    #[test]
    fn test_missed_occurrence_still_due() {
        // Server was down over the 02:00 run; it is caught up at the next tick
        let last = at(1, 2, 0);
        assert!(is_plan_due("0 2 * * *", Some(last), at(3, 9, 30)).unwrap());
    }

    #[test]
    fn test_seconds_field_accepted() {
        assert!(parse_schedule("30 */5 * * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
        assert!(is_plan_due("bogus", None, at(1, 0, 0)).is_err());
    }

    #[tokio::test]
    async fn test_tick_starts_due_plans_only() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let path = data.path().to_string_lossy().to_string();

        with_conn(&state.db, move |conn| {
            for (name, enabled) in [("on", true), ("off", false)] {
                plan::create(
                    conn,
                    &CreatePlanRequest {
                        name: name.into(),
                        schedule: "0 2 * * *".into(),
                        paths: vec![path.clone()],
                        keep_daily: 0,
                        keep_weekly: 0,
                        keep_monthly: 0,
                        enabled,
                    },
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(tick(state.clone()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_runs_wait_for_next_occurrence() {
        let work = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let state = test_state(&work);
        let path = data.path().to_string_lossy().to_string();

        with_conn(&state.db, move |conn| {
            let plan = plan::create(
                conn,
                &CreatePlanRequest {
                    name: "nightly".into(),
                    schedule: "0 2 * * *".into(),
                    paths: vec![path],
                    keep_daily: 0,
                    keep_weekly: 0,
                    keep_monthly: 0,
                    enabled: true,
                },
            )?;
            for i in 0..3 {
                snapshot::insert_unfinished(conn, &format!("c{i}"), &plan.id, "cancelled", "cancelled")?;
            }
            Ok(())
        })
        .await
        .unwrap();

        // The next 02:00 after a run recorded just now is always in the future
        assert_eq!(tick(state.clone()).await.unwrap(), 0);
    }
}
