//! Day-bucketed trend series and the flat overall-health view.

use crate::classify::{classify_all, ClassificationRule};
use crate::errors::{ConfigError, SkipCounts};
use crate::history;
use crate::model::{AttemptRecord, TrendBucket, VerdictCounts};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DAY_MS: i64 = 86_400_000;

/// A trend window in whole days, parsed from `24h` or `<n>d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPeriod {
    pub days: u32,
}

impl TrendPeriod {
    pub fn days(days: u32) -> Self {
        Self { days }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("24h") {
            return Ok(Self { days: 1 });
        }
        let n = s
            .strip_suffix('d')
            .or_else(|| s.strip_suffix('D'))
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ConfigError(format!("invalid trend period '{}' (expected 24h or <n>d)", s))
            })?;
        Ok(Self { days: n })
    }

    pub fn label(&self) -> String {
        if self.days == 1 {
            "24h".to_string()
        } else {
            format!("{}d", self.days)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendSeries {
    pub period: String,
    pub buckets: Vec<TrendBucket>,
    pub skipped: SkipCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub total_tests: u64,
    pub passed: u64,
    pub failed: u64,
    pub flaky: u64,
    pub pass_rate: f64,
    pub avg_duration_ms: i64,
}

/// Bucketing time of an attempt: its run's start, else its own start.
fn run_time_ms(a: &AttemptRecord) -> i64 {
    if a.run_started_at_ms > 0 {
        a.run_started_at_ms
    } else {
        a.start_ms
    }
}

fn within(a: &AttemptRecord, now: DateTime<Utc>, days: u32) -> bool {
    let now_ms = now.timestamp_millis();
    let t = run_time_ms(a);
    t >= now_ms - i64::from(days) * DAY_MS && t <= now_ms
}

fn utc_date(ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|d| d.date_naive())
}

/// One bucket per calendar day, oldest first, ending with `now`'s UTC date.
///
/// Attempts are bucketed by the date their run started; within a day, attempts
/// from every run are merged before grouping so cross-run retries form one
/// history. Days without data are zero filled.
pub fn trend_series(
    attempts: &[AttemptRecord],
    period: TrendPeriod,
    now: DateTime<Utc>,
    rule: ClassificationRule,
) -> TrendSeries {
    let days = period.days.max(1);

    let mut by_day: BTreeMap<NaiveDate, Vec<AttemptRecord>> = BTreeMap::new();
    for a in attempts.iter().filter(|a| within(a, now, days)) {
        if let Some(date) = utc_date(run_time_ms(a)) {
            by_day.entry(date).or_default().push(a.clone());
        }
    }

    let mut skipped = SkipCounts::default();
    let mut counts: BTreeMap<NaiveDate, VerdictCounts> = BTreeMap::new();
    for (date, day_attempts) in by_day {
        let set = history::group(day_attempts);
        skipped.merge(&set.skipped());
        counts.insert(date, classify_all(&set, rule).counts);
    }

    let today = now.date_naive();
    let buckets = (0..days)
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(u64::from(back))))
        .map(|date| match counts.get(&date) {
            Some(c) => TrendBucket::from_counts(date, c),
            None => TrendBucket::empty(date),
        })
        .collect::<Vec<_>>();

    tracing::debug!(
        event = "flakewatch.trend.series",
        days,
        populated = counts.len(),
        "trend series built"
    );

    TrendSeries {
        period: period.label(),
        buckets,
        skipped,
    }
}

/// Classification over the whole window as one flat batch.
pub fn overall_health(
    attempts: &[AttemptRecord],
    now: DateTime<Utc>,
    days: u32,
    rule: ClassificationRule,
) -> HealthSummary {
    let windowed = attempts
        .iter()
        .filter(|a| within(a, now, days.max(1)))
        .cloned();
    let set = history::group(windowed);
    if set.is_empty() {
        return HealthSummary::default();
    }

    let counts = classify_all(&set, rule).counts;
    let total_duration: f64 = set
        .iter()
        .map(|h| {
            let sum: i64 = h.attempts().iter().map(AttemptRecord::duration_ms).sum();
            sum as f64 / h.len() as f64
        })
        .sum();

    HealthSummary {
        total_tests: counts.total,
        passed: counts.passed,
        failed: counts.failed,
        flaky: counts.flaky,
        pass_rate: counts.pass_rate(),
        avg_duration_ms: (total_duration / counts.total as f64) as i64,
    }
}
