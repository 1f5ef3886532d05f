use crate::history::{HistorySet, TestCaseHistory};
use crate::model::{AttemptStatus, Verdict, VerdictCounts, VerdictRecord};
use serde::{Deserialize, Serialize};

/// Which reading of a retry history decides the verdict.
///
/// The two rules disagree on fail→…→pass histories (Flaky vs Passed) and on
/// pass→…→fail histories (Passed vs Failed).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationRule {
    /// First attempt dominates: a history that starts passing stays Passed;
    /// one that starts Failed/Broken is Flaky iff its last attempt passed.
    #[default]
    FirstLastAsymmetric,
    /// Only the last attempt counts. Never yields Flaky for a retried history.
    LastStatusWins,
}

impl ClassificationRule {
    pub fn classify(&self, history: &TestCaseHistory) -> Verdict {
        let first = history.first().status;
        let last = history.last().status;
        classify_ends(*self, history.len(), first, last)
    }

    /// Same rule over a bare status sequence. `None` for an empty sequence.
    pub fn classify_sequence(&self, statuses: &[AttemptStatus]) -> Option<Verdict> {
        let first = *statuses.first()?;
        let last = *statuses.last()?;
        Some(classify_ends(*self, statuses.len(), first, last))
    }
}

fn classify_ends(rule: ClassificationRule, n: usize, first: AttemptStatus, last: AttemptStatus) -> Verdict {
    use AttemptStatus::*;

    if n == 1 {
        return if first == Passed {
            Verdict::Passed
        } else {
            Verdict::Failed
        };
    }

    match rule {
        ClassificationRule::FirstLastAsymmetric => match first {
            Failed | Broken if last == Passed => Verdict::Flaky,
            Failed | Broken => Verdict::Failed,
            // later statuses are ignored
            Passed => Verdict::Passed,
            Skipped | Unknown => Verdict::Failed,
        },
        ClassificationRule::LastStatusWins => {
            if last == Passed {
                Verdict::Passed
            } else {
                Verdict::Failed
            }
        }
    }
}

/// Classifies with the default rule.
pub fn classify(history: &TestCaseHistory) -> Verdict {
    ClassificationRule::default().classify(history)
}

pub fn verdict_record(history: &TestCaseHistory, rule: ClassificationRule) -> VerdictRecord {
    VerdictRecord {
        identity: history.identity().to_string(),
        name: history.name().to_string(),
        verdict: rule.classify(history),
        run_count: history.len(),
        status_sequence: history.statuses(),
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Classification {
    pub records: Vec<VerdictRecord>,
    pub counts: VerdictCounts,
}

impl Classification {
    pub fn merge(&mut self, other: Classification) {
        self.counts.merge(&other.counts);
        self.records.extend(other.records);
    }
}

pub fn classify_histories<'a, I>(histories: I, rule: ClassificationRule) -> Classification
where
    I: IntoIterator<Item = &'a TestCaseHistory>,
{
    let mut out = Classification::default();
    for h in histories {
        let record = verdict_record(h, rule);
        out.counts.record(record.verdict);
        out.records.push(record);
    }
    out
}

pub fn classify_all(set: &HistorySet, rule: ClassificationRule) -> Classification {
    classify_histories(set.iter(), rule)
}
