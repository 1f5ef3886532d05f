use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub struct ConfigError(pub String);

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigError: {}", self.0)
    }
}
impl std::error::Error for ConfigError {}

/// Why a single record was dropped. Never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// history_id, test_case_id and full_name are all empty.
    IdentityMissing,
    MalformedRecord { field: &'static str, reason: String },
}

impl RecordError {
    pub fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        RecordError::MalformedRecord {
            field,
            reason: reason.into(),
        }
    }
}

impl Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::IdentityMissing => {
                write!(f, "identity missing: no history_id, test_case_id or full_name")
            }
            RecordError::MalformedRecord { field, reason } => {
                write!(f, "malformed record: field '{}': {}", field, reason)
            }
        }
    }
}
impl std::error::Error for RecordError {}

/// Counted, non-fatal skips accumulated across a batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkipCounts {
    pub identity_missing: u64,
    pub malformed: u64,
}

impl SkipCounts {
    pub fn count(&mut self, err: &RecordError) {
        match err {
            RecordError::IdentityMissing => self.identity_missing += 1,
            RecordError::MalformedRecord { .. } => self.malformed += 1,
        }
    }

    pub fn merge(&mut self, other: &SkipCounts) {
        self.identity_missing += other.identity_missing;
        self.malformed += other.malformed;
    }

    pub fn total(&self) -> u64 {
        self.identity_missing + self.malformed
    }
}
