//! Retention policy evaluation for a plan's snapshots.
//!
//! Snapshots are bucketed by calendar day, ISO week and month. For each rule
//! the newest snapshot of each of the N most recent buckets is kept.

use chrono::{DateTime, Datelike, IsoWeek, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
}

impl RetentionPolicy {
    /// A policy with every count at zero keeps everything.
    pub fn is_unbounded(&self) -> bool {
        self.keep_daily == 0 && self.keep_weekly == 0 && self.keep_monthly == 0
    }
}

/// One snapshot as seen by the pruner
#[derive(Debug, Clone)]
pub struct PruneCandidate {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneDecision {
    Keep { reasons: Vec<String> },
    Prune,
}

#[derive(Debug, Clone)]
pub struct PruneEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub decision: PruneDecision,
}

impl PruneEntry {
    pub fn is_pruned(&self) -> bool {
        self.decision == PruneDecision::Prune
    }
}

type DailyKey = (i32, u32); // (year, ordinal_day)
type WeeklyKey = (i32, u32); // (iso_year, iso_week)
type MonthlyKey = (i32, u32); // (year, month)

fn daily_key(t: &DateTime<Utc>) -> DailyKey {
    (t.year(), t.ordinal())
}

fn weekly_key(t: &DateTime<Utc>) -> WeeklyKey {
    let iw: IsoWeek = t.iso_week();
    (iw.year(), iw.week())
}

fn monthly_key(t: &DateTime<Utc>) -> MonthlyKey {
    (t.year(), t.month())
}

/// Walk newest-first; the first snapshot seen in a bucket represents it.
fn apply_bucket_rule<K: Eq + Hash>(
    order: &[usize],
    candidates: &[PruneCandidate],
    kept: &mut HashSet<usize>,
    reasons: &mut HashMap<usize, Vec<String>>,
    max_buckets: u32,
    key_fn: impl Fn(&DateTime<Utc>) -> K,
    rule_name: &str,
) {
    if max_buckets == 0 {
        return;
    }
    let mut seen: HashSet<K> = HashSet::new();
    for &idx in order {
        if seen.len() as u32 >= max_buckets {
            break;
        }
        if seen.insert(key_fn(&candidates[idx].timestamp)) {
            kept.insert(idx);
            reasons
                .entry(idx)
                .or_default()
                .push(format!("{rule_name} #{}", seen.len()));
        }
    }
}

/// Decide which snapshots to keep. Returns entries sorted newest-first.
pub fn apply_policy(candidates: &[PruneCandidate], policy: &RetentionPolicy) -> Vec<PruneEntry> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| candidates[b].timestamp.cmp(&candidates[a].timestamp));

    let mut kept: HashSet<usize> = HashSet::new();
    let mut reasons: HashMap<usize, Vec<String>> = HashMap::new();

    if policy.is_unbounded() {
        kept.extend(order.iter().copied());
    } else {
        apply_bucket_rule(&order, candidates, &mut kept, &mut reasons, policy.keep_daily, daily_key, "daily");
        apply_bucket_rule(&order, candidates, &mut kept, &mut reasons, policy.keep_weekly, weekly_key, "weekly");
        apply_bucket_rule(&order, candidates, &mut kept, &mut reasons, policy.keep_monthly, monthly_key, "monthly");
    }

    order
        .into_iter()
        .map(|idx| {
            let decision = if kept.contains(&idx) {
                PruneDecision::Keep {
                    reasons: reasons.remove(&idx).unwrap_or_default(),
                }
            } else {
                PruneDecision::Prune
            };
            PruneEntry {
                id: candidates[idx].id.clone(),
                timestamp: candidates[idx].timestamp,
                decision,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn candidate(id: &str, t: DateTime<Utc>) -> PruneCandidate {
        PruneCandidate {
            id: id.to_string(),
            timestamp: t,
        }
    }

    fn pruned_ids(entries: &[PruneEntry]) -> Vec<&str> {
        entries
            .iter()
            .filter(|e| e.is_pruned())
            .map(|e| e.id.as_str())
            .collect()
    }

    #[test]
    fn test_unbounded_policy_keeps_all() {
        let snaps = vec![candidate("a", at(2024, 1, 1, 0)), candidate("b", at(2024, 1, 2, 0))];
        let result = apply_policy(&snaps, &RetentionPolicy::default());
        assert!(pruned_ids(&result).is_empty());
    }

    #[test]
    fn test_keep_daily_keeps_newest_per_day() {
        let snaps = vec![
            candidate("d1-early", at(2024, 3, 1, 1)),
            candidate("d1-late", at(2024, 3, 1, 23)),
            candidate("d2", at(2024, 3, 2, 12)),
            candidate("d3", at(2024, 3, 3, 12)),
        ];
        let policy = RetentionPolicy {
            keep_daily: 2,
            ..Default::default()
        };
        let result = apply_policy(&snaps, &policy);

        assert_eq!(result[0].id, "d3");
        let mut pruned = pruned_ids(&result);
        pruned.sort();
        assert_eq!(pruned, vec!["d1-early", "d1-late"]);
    }

    #[test]
    fn test_rules_combine() {
        // Two months of weekly snapshots
        let snaps: Vec<PruneCandidate> = (0..8)
            .map(|i| candidate(&format!("s{i}"), at(2024, 1, 1, 0) + chrono::Duration::weeks(i)))
            .collect();
        let policy = RetentionPolicy {
            keep_daily: 1,
            keep_weekly: 2,
            keep_monthly: 2,
        };
        let result = apply_policy(&snaps, &policy);
        let kept: Vec<&str> = result
            .iter()
            .filter(|e| !e.is_pruned())
            .map(|e| e.id.as_str())
            .collect();
        // s7 (newest, daily+weekly+monthly), s6 (weekly #2), s4 (newest in January)
        assert_eq!(kept, vec!["s7", "s6", "s4"]);
    }
}
