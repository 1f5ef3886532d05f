//! Cross-scan flaky ledger: per-identity run counts accumulated by upsert.

use crate::history::HistorySet;
use crate::model::{AttemptRecord, AttemptStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counts contributed by one scan for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerDelta {
    pub identity: String,
    pub test_name: String,
    pub total_runs: u64,
    pub passed_runs: u64,
    pub failed_runs: u64,
}

/// Deltas for identities whose scan history mixes Passed with Failed/Broken.
///
/// Only attempts accepted by `is_new` are counted, so attempts already folded
/// into the ledger by an earlier scan never count twice. Identities left with
/// no new attempts produce no delta.
pub fn ledger_deltas<F>(set: &HistorySet, is_new: F) -> Vec<LedgerDelta>
where
    F: Fn(&AttemptRecord) -> bool,
{
    let mut out = Vec::new();
    for h in set.iter() {
        let statuses = h.statuses();
        let mixed = statuses.contains(&AttemptStatus::Passed)
            && statuses.iter().any(AttemptStatus::is_failure);
        if !mixed {
            continue;
        }

        let mut delta = LedgerDelta {
            identity: h.identity().to_string(),
            test_name: h.name().to_string(),
            total_runs: 0,
            passed_runs: 0,
            failed_runs: 0,
        };
        for a in h.attempts().iter().filter(|a| is_new(a)) {
            delta.total_runs += 1;
            if a.status == AttemptStatus::Passed {
                delta.passed_runs += 1;
            } else if a.status.is_failure() {
                delta.failed_runs += 1;
            }
        }
        if delta.total_runs > 0 {
            out.push(delta);
        }
    }
    out
}

/// Unweighted `min(passed, failed) / total`; 0 for an empty entry.
pub fn ledger_score(passed: u64, failed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    passed.min(failed) as f64 / total as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyLedgerEntry {
    pub scope: String,
    pub identity: String,
    pub test_name: String,
    pub total_runs: u64,
    pub passed_runs: u64,
    pub failed_runs: u64,
    pub flakiness_score: f64,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FlakyLedgerEntry {
    pub fn new(scope: &str, delta: &LedgerDelta, now: DateTime<Utc>) -> Self {
        Self {
            scope: scope.to_string(),
            identity: delta.identity.clone(),
            test_name: delta.test_name.clone(),
            total_runs: delta.total_runs,
            passed_runs: delta.passed_runs,
            failed_runs: delta.failed_runs,
            flakiness_score: ledger_score(delta.passed_runs, delta.failed_runs, delta.total_runs),
            first_detected: now,
            last_detected: now,
            is_active: true,
            resolved_at: None,
        }
    }

    /// Adds a scan's counts. A resolved entry observed again becomes active.
    pub fn absorb(&mut self, delta: &LedgerDelta, now: DateTime<Utc>) {
        self.total_runs += delta.total_runs;
        self.passed_runs += delta.passed_runs;
        self.failed_runs += delta.failed_runs;
        self.flakiness_score = ledger_score(self.passed_runs, self.failed_runs, self.total_runs);
        self.last_detected = now;
        self.is_active = true;
        self.resolved_at = None;
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.resolved_at = Some(now);
    }
}

/// Folds a delta into the existing entry, or starts a new one.
pub fn upsert(
    existing: Option<FlakyLedgerEntry>,
    scope: &str,
    delta: &LedgerDelta,
    now: DateTime<Utc>,
) -> FlakyLedgerEntry {
    match existing {
        Some(mut entry) => {
            entry.absorb(delta, now);
            entry
        }
        None => FlakyLedgerEntry::new(scope, delta, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::group;
    use crate::history::test_support::attempt;
    use AttemptStatus::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn only_mixed_histories_produce_deltas() {
        let set = group(vec![
            attempt("flaky", Failed, 1, 0),
            attempt("flaky", Passed, 2, 1),
            attempt("flaky", Broken, 3, 2),
            attempt("green", Passed, 1, 3),
            attempt("green", Passed, 2, 4),
            attempt("red", Failed, 1, 5),
            attempt("red", Skipped, 2, 6),
        ]);
        let deltas = ledger_deltas(&set, |_| true);
        assert_eq!(deltas.len(), 1);
        let d = &deltas[0];
        assert_eq!(d.identity, "flaky");
        assert_eq!((d.total_runs, d.passed_runs, d.failed_runs), (3, 1, 2));
    }

    #[test]
    fn already_ledgered_attempts_are_not_counted() {
        let set = group(vec![
            attempt("t", Failed, 1, 0),
            attempt("t", Passed, 2, 1),
            attempt("t", Failed, 3, 2),
        ]);
        let deltas = ledger_deltas(&set, |a| a.seq == 2);
        assert_eq!(deltas[0].total_runs, 1);
        assert_eq!(deltas[0].failed_runs, 1);

        assert!(ledger_deltas(&set, |_| false).is_empty());
    }

    #[test]
    fn upsert_accumulates_and_rescores() {
        let d1 = LedgerDelta {
            identity: "t".into(),
            test_name: "t".into(),
            total_runs: 2,
            passed_runs: 1,
            failed_runs: 1,
        };
        let d2 = LedgerDelta {
            total_runs: 4,
            passed_runs: 4,
            failed_runs: 0,
            ..d1.clone()
        };
        let e = upsert(None, "default", &d1, at(100));
        assert_eq!(e.flakiness_score, 0.5);
        let e = upsert(Some(e), "default", &d2, at(200));
        assert_eq!((e.total_runs, e.passed_runs, e.failed_runs), (6, 5, 1));
        assert!((e.flakiness_score - 1.0 / 6.0).abs() < 1e-12);
        assert_eq!(e.first_detected, at(100));
        assert_eq!(e.last_detected, at(200));
    }

    #[test]
    fn resolved_entries_reactivate() {
        let d = LedgerDelta {
            identity: "t".into(),
            test_name: "t".into(),
            total_runs: 2,
            passed_runs: 1,
            failed_runs: 1,
        };
        let mut e = FlakyLedgerEntry::new("s", &d, at(1));
        e.resolve(at(2));
        assert!(!e.is_active);
        assert_eq!(e.resolved_at, Some(at(2)));
        e.absorb(&d, at(3));
        assert!(e.is_active);
        assert_eq!(e.resolved_at, None);
        assert_eq!(e.total_runs, 4);
    }

    #[test]
    fn empty_score_is_zero() {
        assert_eq!(ledger_score(0, 0, 0), 0.0);
    }
}
