//! Background integrity verification of stored blocks.
//!
//! Each run verifies a deterministic sample of the store (every k-th hash in
//! sorted order). The starting offset advances with each run, so consecutive
//! scrubs walk through the whole store. Detection only: there is no second
//! copy to repair from.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::store::{BlockStatus, BlockStore};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ScrubReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_blocks: usize,
    pub checked: usize,
    pub corrupt: Vec<String>,
    pub missing: Vec<String>,
}

impl ScrubReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }
}

pub struct Scrubber {
    store: Arc<BlockStore>,
    sample_ratio: f64,
    running: AtomicBool,
    runs: AtomicUsize,
    last_report: RwLock<Option<ScrubReport>>,
}

/// Clears the running flag when the scrub ends, including on panic
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scrubber {
    pub fn new(store: Arc<BlockStore>, sample_ratio: f64) -> Self {
        Self {
            store,
            sample_ratio: sample_ratio.clamp(f64::MIN_POSITIVE, 1.0),
            running: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
            last_report: RwLock::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<ScrubReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Verify a sample of blocks. Refuses to overlap with a running scrub.
    pub fn scrub(&self) -> Result<ScrubReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::ScrubAlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let started_at = Utc::now();
        let hashes = self.store.hashes();
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        let sample = select_sample(&hashes, self.sample_ratio, run);
        info!(total = hashes.len(), sampled = sample.len(), "Scrub started");

        let mut corrupt = Vec::new();
        let mut missing = Vec::new();
        for hash in &sample {
            match self.store.verify(hash) {
                BlockStatus::Ok => {}
                BlockStatus::Corrupt => corrupt.push(hash.clone()),
                BlockStatus::NotFound => missing.push(hash.clone()),
            }
        }

        let report = ScrubReport {
            started_at,
            finished_at: Utc::now(),
            total_blocks: hashes.len(),
            checked: sample.len(),
            corrupt,
            missing,
        };

        if report.is_clean() {
            info!(checked = report.checked, "Scrub finished clean");
        } else {
            warn!(
                checked = report.checked,
                corrupt = report.corrupt.len(),
                missing = report.missing.len(),
                "Scrub found damaged blocks"
            );
        }

        *self
            .last_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        Ok(report)
    }
}

/// Every k-th hash (k = ceil(1 / ratio)) starting at `run % k`.
///
/// Always returns at least one hash when `hashes` is non-empty.
pub fn select_sample(hashes: &[String], ratio: f64, run: usize) -> Vec<String> {
    if hashes.is_empty() {
        return Vec::new();
    }
    let stride = (1.0 / ratio).ceil().max(1.0) as usize;
    let offset = run % stride;
    let sample: Vec<String> = hashes.iter().skip(offset).step_by(stride).cloned().collect();
    if sample.is_empty() {
        vec![hashes[offset % hashes.len()].clone()]
    } else {
        sample
    }
}
