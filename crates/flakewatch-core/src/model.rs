use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Outcome of a single recorded execution of a test case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Passed,
    Failed,
    Broken,
    Skipped,
    Unknown,
}

impl AttemptStatus {
    /// Case-insensitive parse. Anything outside the five known statuses is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passed" => Some(AttemptStatus::Passed),
            "failed" => Some(AttemptStatus::Failed),
            "broken" => Some(AttemptStatus::Broken),
            "skipped" => Some(AttemptStatus::Skipped),
            "unknown" => Some(AttemptStatus::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Passed => "passed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Broken => "broken",
            AttemptStatus::Skipped => "skipped",
            AttemptStatus::Unknown => "unknown",
        }
    }

    /// Failed or Broken.
    pub fn is_failure(&self) -> bool {
        matches!(self, AttemptStatus::Failed | AttemptStatus::Broken)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical, immutable form of one attempt after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    /// Ingestion sequence number, unique within a batch.
    pub seq: u64,
    pub history_id: Option<String>,
    pub test_case_id: Option<String>,
    pub full_name: Option<String>,
    pub name: String,
    pub status: AttemptStatus,
    pub start_ms: i64,
    pub stop_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub run_started_at_ms: i64,
    pub fingerprint: String,
}

impl AttemptRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.stop_ms - self.start_ms).max(0)
    }

    pub fn environment_or_default(&self) -> &str {
        self.environment.as_deref().unwrap_or("default")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Flaky,
    Failed,
}

impl Verdict {
    /// Capitalized label used by the tabular export.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Passed => "Passed",
            Verdict::Flaky => "Flaky",
            Verdict::Failed => "Failed",
        }
    }
}

/// Per-history classification output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerdictRecord {
    pub identity: String,
    pub name: String,
    pub verdict: Verdict,
    pub run_count: usize,
    pub status_sequence: Vec<AttemptStatus>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerdictCounts {
    pub total: u64,
    pub passed: u64,
    pub flaky: u64,
    pub failed: u64,
}

impl VerdictCounts {
    pub fn record(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Passed => self.passed += 1,
            Verdict::Flaky => self.flaky += 1,
            Verdict::Failed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &VerdictCounts) {
        self.total += other.total;
        self.passed += other.passed;
        self.flaky += other.flaky;
        self.failed += other.failed;
    }

    /// Flaky tests eventually passed, so they count towards the pass rate.
    pub fn pass_rate(&self) -> f64 {
        pass_rate(self.passed + self.flaky, self.total)
    }
}

/// One calendar day of classification counts. Present even for days without runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendBucket {
    pub date: NaiveDate,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub flaky: u64,
    pub pass_rate: f64,
}

impl TrendBucket {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total: 0,
            passed: 0,
            failed: 0,
            flaky: 0,
            pass_rate: 0.0,
        }
    }

    pub fn from_counts(date: NaiveDate, counts: &VerdictCounts) -> Self {
        Self {
            date,
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            flaky: counts.flaky,
            pass_rate: counts.pass_rate(),
        }
    }
}

/// Percentage rounded to 2 decimals, 0 when there is nothing to divide by.
pub fn pass_rate(passed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_dp(passed as f64 / total as f64 * 100.0, 2)
}

pub fn round_dp(value: f64, dp: i32) -> f64 {
    let factor = 10f64.powi(dp);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(AttemptStatus::parse("PASSED"), Some(AttemptStatus::Passed));
        assert_eq!(AttemptStatus::parse(" Broken "), Some(AttemptStatus::Broken));
        assert_eq!(AttemptStatus::parse("unknown"), Some(AttemptStatus::Unknown));
        assert_eq!(AttemptStatus::parse("pending"), None);
        assert_eq!(AttemptStatus::parse(""), None);
    }

    #[test]
    fn pass_rate_rounds_and_handles_zero() {
        assert_eq!(pass_rate(0, 0), 0.0);
        assert_eq!(pass_rate(2, 3), 66.67);
        assert_eq!(pass_rate(5, 5), 100.0);
    }

    #[test]
    fn counts_include_flaky_in_pass_rate() {
        let mut c = VerdictCounts::default();
        c.record(Verdict::Passed);
        c.record(Verdict::Flaky);
        c.record(Verdict::Failed);
        c.record(Verdict::Failed);
        assert_eq!(c.total, 4);
        assert_eq!(c.pass_rate(), 50.0);
    }

    #[test]
    fn duration_never_negative() {
        let a = AttemptRecord {
            seq: 0,
            history_id: None,
            test_case_id: None,
            full_name: Some("a".into()),
            name: "a".into(),
            status: AttemptStatus::Passed,
            start_ms: 500,
            stop_ms: 100,
            environment: None,
            run_started_at_ms: 0,
            fingerprint: "x".into(),
        };
        assert_eq!(a.duration_ms(), 0);
    }
}
