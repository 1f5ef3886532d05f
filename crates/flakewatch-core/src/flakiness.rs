//! Flakiness scoring, pattern detection and fix-priority ranking.
//!
//! Operates on raw run counts over a window, independently of the per-history
//! verdict produced by [`crate::classify`].

use crate::config::EngineConfig;
use crate::errors::SkipCounts;
use crate::history::{self, TestCaseHistory};
use crate::model::{round_dp, AttemptRecord, AttemptStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DAY_MS: i64 = 86_400_000;
const TOP_N: usize = 10;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub total: u64,
    pub passed: u64,
    /// Failed plus Broken.
    pub failed: u64,
}

impl RunCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = AttemptStatus>,
    {
        let mut c = RunCounts::default();
        for s in statuses {
            c.total += 1;
            if s == AttemptStatus::Passed {
                c.passed += 1;
            } else if s.is_failure() {
                c.failed += 1;
            }
        }
        c
    }

    pub fn failure_rate_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round_dp(self.failed as f64 / self.total as f64 * 100.0, 2)
    }
}

/// `min(passed, failed) / total`, discounted until `total` reaches
/// `confidence_runs`, rounded to 3 decimals. Always within [0, 1].
pub fn flakiness_score(counts: &RunCounts, confidence_runs: u32) -> f64 {
    if counts.total == 0 {
        return 0.0;
    }
    let total = counts.total as f64;
    let minority = counts.passed.min(counts.failed) as f64;
    let confidence = (total / confidence_runs.max(1) as f64).min(1.0);
    round_dp(minority / total * confidence, 3)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Patterns {
    /// Longest run of one repeated failure status (Failed or Broken).
    pub consecutive_failures: u32,
    pub alternating: bool,
    pub environment_specific: bool,
    /// Failure rate per environment, only set when failures are environment specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_details: Option<BTreeMap<String, f64>>,
}

/// Informational only; patterns never feed back into the score.
pub fn detect_patterns(attempts: &[AttemptRecord], config: &EngineConfig) -> Patterns {
    let mut longest = 0u32;
    let mut current = 0u32;
    let mut prev: Option<AttemptStatus> = None;
    for a in attempts {
        if a.status.is_failure() {
            current = if prev == Some(a.status) { current + 1 } else { 1 };
            longest = longest.max(current);
        } else {
            current = 0;
        }
        prev = Some(a.status);
    }

    let changes = attempts
        .windows(2)
        .filter(|w| w[0].status != w[1].status)
        .count();
    let alternating = changes as f64 > attempts.len() as f64 * config.alternating_ratio;

    let mut per_env: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for a in attempts {
        let slot = per_env.entry(a.environment_or_default().to_string()).or_default();
        slot.0 += 1;
        if a.status.is_failure() {
            slot.1 += 1;
        }
    }

    let mut environment_specific = false;
    let mut environment_details = None;
    if per_env.len() > 1 {
        let rates: BTreeMap<String, f64> = per_env
            .into_iter()
            .map(|(env, (total, failed))| (env, failed as f64 / total as f64))
            .collect();
        let max = rates.values().cloned().fold(f64::MIN, f64::max);
        let min = rates.values().cloned().fold(f64::MAX, f64::min);
        if max - min > config.environment_spread {
            environment_specific = true;
            environment_details = Some(rates);
        }
    }

    Patterns {
        consecutive_failures: longest,
        alternating,
        environment_specific,
        environment_details,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn from_score(priority_score: f64) -> Self {
        if priority_score > 70.0 {
            Priority::Critical
        } else if priority_score > 50.0 {
            Priority::High
        } else if priority_score > 30.0 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

/// `flakiness * 70 + min(total_runs / 100 * 30, 30)`, rounded to 2 decimals.
pub fn priority_score(flakiness: f64, total_runs: u64) -> f64 {
    let volume = (total_runs as f64 / 100.0 * 30.0).min(30.0);
    round_dp(flakiness * 70.0 + volume, 2)
}

pub fn recommendation(flakiness: f64, patterns: &Patterns, config: &EngineConfig) -> String {
    let mut lines = Vec::new();

    if flakiness > 0.5 {
        lines.push("Critical: Test is highly unstable and should be fixed immediately or quarantined.");
    } else if flakiness > 0.3 {
        lines.push("High priority: Test shows significant instability.");
    } else {
        lines.push("Monitor: Test shows some instability.");
    }

    if patterns.alternating {
        lines.push("Pattern detected: Alternating pass/fail suggests timing or race condition issues.");
    }
    if patterns.environment_specific {
        lines.push("Pattern detected: Environment-specific failures suggest configuration issues.");
    }
    if patterns.consecutive_failures > config.consecutive_failure_hint {
        lines.push(
            "Pattern detected: Consecutive failures may indicate a persistent issue rather than flakiness.",
        );
    }

    lines.join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlakyEntry {
    pub test_id: String,
    pub test_name: String,
    pub flakiness_score: f64,
    pub total_runs: u64,
    pub passed_runs: u64,
    pub failed_runs: u64,
    pub failure_rate_pct: f64,
    pub priority: Priority,
    pub priority_score: f64,
    pub recommendation: String,
    pub patterns: Patterns,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopFlaky {
    pub name: String,
    pub flakiness_score: f64,
    pub priority: Priority,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlakySummary {
    pub time_period: String,
    pub total_flaky_tests: u64,
    pub average_flakiness_score: f64,
    pub average_failure_rate: f64,
    pub priority_breakdown: BTreeMap<Priority, u64>,
    pub top_flaky_tests: Vec<TopFlaky>,
    pub summary: String,
}

impl FlakySummary {
    /// Summarizes entries already ranked by priority.
    pub fn from_entries(entries: &[FlakyEntry], time_period: &str) -> Self {
        if entries.is_empty() {
            return Self {
                time_period: time_period.to_string(),
                total_flaky_tests: 0,
                average_flakiness_score: 0.0,
                average_failure_rate: 0.0,
                priority_breakdown: BTreeMap::new(),
                top_flaky_tests: Vec::new(),
                summary: format!("No flaky tests detected in the last {}", time_period),
            };
        }

        let n = entries.len() as f64;
        let avg_score = entries.iter().map(|e| e.flakiness_score).sum::<f64>() / n;
        let avg_rate = entries.iter().map(|e| e.failure_rate_pct).sum::<f64>() / n;

        let mut breakdown = BTreeMap::new();
        for e in entries {
            *breakdown.entry(e.priority).or_insert(0u64) += 1;
        }

        Self {
            time_period: time_period.to_string(),
            total_flaky_tests: entries.len() as u64,
            average_flakiness_score: round_dp(avg_score, 3),
            average_failure_rate: round_dp(avg_rate, 2),
            priority_breakdown: breakdown,
            top_flaky_tests: entries
                .iter()
                .take(TOP_N)
                .map(|e| TopFlaky {
                    name: e.test_name.clone(),
                    flakiness_score: e.flakiness_score,
                    priority: e.priority,
                    recommendation: e.recommendation.clone(),
                })
                .collect(),
            summary: format!(
                "Detected {} flaky tests with average flakiness score of {:.2}",
                entries.len(),
                avg_score
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlakyReport {
    pub window_days: u32,
    pub entries: Vec<FlakyEntry>,
    pub summary: FlakySummary,
    /// Histories below `min_runs`. They still count for classification and trends.
    pub excluded_insufficient_runs: u64,
    pub below_threshold: u64,
    pub skipped: SkipCounts,
}

pub fn period_label(days: u32) -> String {
    if days == 1 {
        "24 hours".to_string()
    } else {
        format!("{} days", days)
    }
}

/// Attempt time used for windowing: the attempt's own start, else its run's start.
fn observed_at_ms(a: &AttemptRecord) -> Option<i64> {
    if a.start_ms > 0 {
        Some(a.start_ms)
    } else if a.run_started_at_ms > 0 {
        Some(a.run_started_at_ms)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlakyDetector {
    config: EngineConfig,
}

impl FlakyDetector {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Analyzes one history. `None` when it is excluded or below the threshold.
    pub fn analyze(&self, history: &TestCaseHistory) -> Option<FlakyEntry> {
        let counts = RunCounts::from_statuses(history.statuses());
        if counts.total < u64::from(self.config.min_runs) {
            return None;
        }
        let score = flakiness_score(&counts, self.config.confidence_runs);
        if score < self.config.flakiness_threshold {
            return None;
        }

        let patterns = detect_patterns(history.attempts(), &self.config);
        let priority_score = priority_score(score, counts.total);
        Some(FlakyEntry {
            test_id: history.identity().to_string(),
            test_name: history.name().to_string(),
            flakiness_score: score,
            total_runs: counts.total,
            passed_runs: counts.passed,
            failed_runs: counts.failed,
            failure_rate_pct: counts.failure_rate_pct(),
            priority: Priority::from_score(priority_score),
            priority_score,
            recommendation: recommendation(score, &patterns, &self.config),
            patterns,
        })
    }

    /// Flaky report over the last `flaky_window_days` ending at `now`.
    ///
    /// Attempts with neither a start nor a run start are kept.
    pub fn detect(&self, attempts: &[AttemptRecord], now: DateTime<Utc>) -> FlakyReport {
        let days = self.config.flaky_window_days;
        let cutoff = now.timestamp_millis() - i64::from(days) * DAY_MS;

        let windowed = attempts
            .iter()
            .filter(|a| observed_at_ms(a).map_or(true, |t| t >= cutoff))
            .cloned();
        let set = history::group(windowed);

        let mut entries = Vec::new();
        let mut excluded = 0u64;
        let mut below = 0u64;
        for h in set.iter() {
            if (h.len() as u64) < u64::from(self.config.min_runs) {
                excluded += 1;
                continue;
            }
            match self.analyze(h) {
                Some(entry) => entries.push(entry),
                None => below += 1,
            }
        }

        entries.sort_by(|a, b| {
            b.priority_score
                .total_cmp(&a.priority_score)
                .then_with(|| a.test_id.cmp(&b.test_id))
        });

        tracing::info!(
            event = "flakewatch.flaky.detected",
            histories = set.len(),
            flaky = entries.len(),
            excluded_insufficient_runs = excluded,
            window_days = days,
            "flaky detection finished"
        );

        let summary = FlakySummary::from_entries(&entries, &period_label(days));
        FlakyReport {
            window_days: days,
            entries,
            summary,
            excluded_insufficient_runs: excluded,
            below_threshold: below,
            skipped: set.skipped(),
        }
    }
}
