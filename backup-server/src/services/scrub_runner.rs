use crate::error::AppError;
use crate::state::AppState;
use backup_engine::scrub::ScrubReport;
use serde_json::json;

/// Run one scrub pass on the blocking pool and publish its report.
pub async fn run_scrub(state: &AppState) -> Result<ScrubReport, AppError> {
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.scrubber.scrub()).await??;

    state.ui.broadcast(
        "scrub:completed",
        json!({
            "checked": report.checked,
            "totalBlocks": report.total_blocks,
            "corrupt": report.corrupt,
            "missing": report.missing,
        }),
    );
    if !report.is_clean() {
        tracing::error!(
            corrupt = report.corrupt.len(),
            missing = report.missing.len(),
            "Scrub detected damaged blocks"
        );
    }
    Ok(report)
}
