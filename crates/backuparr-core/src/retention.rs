use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{BackupMetadata, StorageBackend};

/// How many backups to keep in each time bucket. Zero disables a bucket;
/// an all-zero policy keeps nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last: usize,
    #[serde(default)]
    pub keep_hourly: usize,
    #[serde(default)]
    pub keep_daily: usize,
    #[serde(default)]
    pub keep_weekly: usize,
    #[serde(default)]
    pub keep_monthly: usize,
    #[serde(default)]
    pub keep_yearly: usize,
}

/// Time bucket key types, one per retention dimension. Equality of keys is
/// equality of truncated timestamps.
type HourlyKey = (i32, u32, u32); // (year, ordinal_day, hour)
type DailyKey = (i32, u32); // (year, ordinal_day)
type WeeklyKey = (i32, u32); // (iso_year, iso_week)
type MonthlyKey = (i32, u32); // (year, month)
type YearlyKey = (i32,);

fn hourly_key(t: &DateTime<Utc>) -> HourlyKey {
    (t.year(), t.ordinal(), t.hour())
}

fn daily_key(t: &DateTime<Utc>) -> DailyKey {
    (t.year(), t.ordinal())
}

fn weekly_key(t: &DateTime<Utc>) -> WeeklyKey {
    let iw = t.iso_week();
    (iw.year(), iw.week())
}

fn monthly_key(t: &DateTime<Utc>) -> MonthlyKey {
    (t.year(), t.month())
}

fn yearly_key(t: &DateTime<Utc>) -> YearlyKey {
    (t.year(),)
}

/// Walk backups newest-first and mark the first entry of each distinct
/// bucket, stopping once `count` buckets have been seen. Newest-in-bucket
/// wins by construction of the walk order.
fn mark_by_bucket<K: Eq + Hash>(
    sorted_newest_first: &[&BackupMetadata],
    count: usize,
    key_fn: impl Fn(&DateTime<Utc>) -> K,
    mut mark: impl FnMut(&BackupMetadata),
) {
    let mut seen: HashSet<K> = HashSet::new();
    for b in sorted_newest_first {
        let bucket = key_fn(&b.created_at);
        if seen.insert(bucket) {
            mark(b);
            if seen.len() >= count {
                return;
            }
        }
    }
}

fn sorted_newest_first(backups: &[BackupMetadata]) -> Vec<&BackupMetadata> {
    let mut sorted: Vec<&BackupMetadata> = backups.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sorted
}

/// Select the set of backup keys the policy retains.
pub fn select_keep(backups: &[BackupMetadata], policy: &RetentionPolicy) -> HashSet<String> {
    let sorted = sorted_newest_first(backups);
    let mut keep: HashSet<String> = HashSet::new();

    for b in sorted.iter().take(policy.keep_last) {
        keep.insert(b.key.clone());
    }

    if policy.keep_hourly > 0 {
        mark_by_bucket(&sorted, policy.keep_hourly, hourly_key, |b| {
            keep.insert(b.key.clone());
        });
    }
    if policy.keep_daily > 0 {
        mark_by_bucket(&sorted, policy.keep_daily, daily_key, |b| {
            keep.insert(b.key.clone());
        });
    }
    if policy.keep_weekly > 0 {
        mark_by_bucket(&sorted, policy.keep_weekly, weekly_key, |b| {
            keep.insert(b.key.clone());
        });
    }
    if policy.keep_monthly > 0 {
        mark_by_bucket(&sorted, policy.keep_monthly, monthly_key, |b| {
            keep.insert(b.key.clone());
        });
    }
    if policy.keep_yearly > 0 {
        mark_by_bucket(&sorted, policy.keep_yearly, yearly_key, |b| {
            keep.insert(b.key.clone());
        });
    }

    keep
}

/// Map each backup key to the bucket labels that justify keeping it.
/// Entries with no labels are prunable; the UI renders them as such.
pub fn classify(
    backups: &[BackupMetadata],
    policy: &RetentionPolicy,
) -> HashMap<String, Vec<String>> {
    let mut labels: HashMap<String, Vec<String>> =
        backups.iter().map(|b| (b.key.clone(), Vec::new())).collect();

    let sorted = sorted_newest_first(backups);

    for b in sorted.iter().take(policy.keep_last) {
        if let Some(l) = labels.get_mut(&b.key) {
            l.push("latest".to_string());
        }
    }

    if policy.keep_hourly > 0 {
        mark_by_bucket(&sorted, policy.keep_hourly, hourly_key, |b| {
            if let Some(l) = labels.get_mut(&b.key) {
                l.push("hourly".to_string());
            }
        });
    }
    if policy.keep_daily > 0 {
        mark_by_bucket(&sorted, policy.keep_daily, daily_key, |b| {
            if let Some(l) = labels.get_mut(&b.key) {
                l.push("daily".to_string());
            }
        });
    }
    if policy.keep_weekly > 0 {
        mark_by_bucket(&sorted, policy.keep_weekly, weekly_key, |b| {
            if let Some(l) = labels.get_mut(&b.key) {
                l.push("weekly".to_string());
            }
        });
    }
    if policy.keep_monthly > 0 {
        mark_by_bucket(&sorted, policy.keep_monthly, monthly_key, |b| {
            if let Some(l) = labels.get_mut(&b.key) {
                l.push("monthly".to_string());
            }
        });
    }
    if policy.keep_yearly > 0 {
        mark_by_bucket(&sorted, policy.keep_yearly, yearly_key, |b| {
            if let Some(l) = labels.get_mut(&b.key) {
                l.push("yearly".to_string());
            }
        });
    }

    labels
}

/// List a backend, delete everything outside the keep set, and return the
/// number of backups deleted. Individual delete failures are logged and do
/// not abort the pass.
pub fn apply_retention(
    backend: &dyn StorageBackend,
    app_name: &str,
    policy: &RetentionPolicy,
) -> Result<usize> {
    let backups = backend.list(app_name)?;
    if backups.is_empty() {
        return Ok(0);
    }

    let keep = select_keep(&backups, policy);

    let mut deleted = 0;
    for b in &backups {
        if keep.contains(&b.key) {
            continue;
        }
        match backend.delete(&b.key) {
            Ok(()) => deleted += 1,
            Err(e) => {
                tracing::warn!(
                    "[{app_name}] failed to delete old backup {}: {e}",
                    b.file_name
                );
            }
        }
    }
    Ok(deleted)
}
