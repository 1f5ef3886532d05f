use crate::errors::RecordError;
use crate::model::AttemptRecord;
use serde::Serialize;

/// Which identifier produced the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    HistoryId,
    TestCaseId,
    FullName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIdentity<'a> {
    pub key: &'a str,
    pub source: IdentitySource,
}

/// Canonical identity key: `history_id`, then `test_case_id`, then `full_name`.
///
/// `history_id` is stable across retries and parameterizations; `full_name`
/// can merge distinct parameterized instances, so it is only a last resort.
/// `name` is never used as a key.
pub fn resolve(attempt: &AttemptRecord) -> Result<ResolvedIdentity<'_>, RecordError> {
    let candidates = [
        (attempt.history_id.as_deref(), IdentitySource::HistoryId),
        (attempt.test_case_id.as_deref(), IdentitySource::TestCaseId),
        (attempt.full_name.as_deref(), IdentitySource::FullName),
    ];

    candidates
        .into_iter()
        .find_map(|(value, source)| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|key| ResolvedIdentity { key, source })
        })
        .ok_or(RecordError::IdentityMissing)
}

pub fn resolve_key(attempt: &AttemptRecord) -> Result<&str, RecordError> {
    resolve(attempt).map(|r| r.key)
}
