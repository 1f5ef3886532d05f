//! Raw attempt payloads to canonical [`AttemptRecord`]s.
//!
//! Input is Allure-style result JSON (camelCase keys, snake_case accepted too).
//! Each record is parsed on its own so a malformed one is counted and skipped
//! without touching the rest of the batch.

use crate::errors::{RecordError, SkipCounts};
use crate::fingerprint::{self, AttemptContext};
use crate::model::{AttemptRecord, AttemptStatus};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub attempts: Vec<AttemptRecord>,
    pub skipped: SkipCounts,
}

/// Stateful so that sequence numbers keep increasing across several documents
/// belonging to the same batch.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    next_seq: u64,
    seen: u64,
    default_run_started_at_ms: i64,
    skipped: SkipCounts,
    // field fingerprint -> records seen so far in the current document
    occurrences: HashMap<String, u32>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parent-run start applied to records that do not carry `runStartedAt`.
    pub fn with_run_started_at(run_started_at_ms: i64) -> Self {
        Self {
            default_run_started_at_ms: run_started_at_ms,
            ..Self::default()
        }
    }

    pub fn skipped(&self) -> SkipCounts {
        self.skipped
    }

    pub fn normalize(&mut self, value: &Value) -> Result<AttemptRecord, RecordError> {
        let position = self.seen;
        self.seen += 1;
        match parse_record(value, self.default_run_started_at_ms) {
            Ok(parsed) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                Ok(parsed.into_record(seq, &mut self.occurrences))
            }
            Err(e) => {
                self.reject(position, &e);
                Err(e)
            }
        }
    }

    /// Feeds the output of [`parse_document`], counting unparsable entries too.
    ///
    /// Identical untimed records within one document are distinct attempts;
    /// across documents they are the same attempt re-exported.
    pub fn normalize_document(&mut self, entries: &[Result<Value, RecordError>]) -> Vec<AttemptRecord> {
        self.occurrences.clear();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Ok(v) => {
                    if let Ok(a) = self.normalize(v) {
                        out.push(a);
                    }
                }
                Err(e) => {
                    let position = self.seen;
                    self.seen += 1;
                    self.reject(position, e);
                }
            }
        }
        out
    }

    pub fn finish(self, attempts: Vec<AttemptRecord>) -> NormalizedBatch {
        if self.skipped.total() > 0 {
            tracing::info!(
                event = "flakewatch.normalize.summary",
                accepted = attempts.len(),
                malformed = self.skipped.malformed,
                "normalized batch with skipped records"
            );
        }
        NormalizedBatch {
            attempts,
            skipped: self.skipped,
        }
    }

    fn reject(&mut self, position: u64, err: &RecordError) {
        self.skipped.count(err);
        tracing::warn!(
            event = "flakewatch.normalize.skipped",
            position,
            reason = %err,
            "skipping attempt record"
        );
    }
}

pub fn normalize_batch(values: &[Value]) -> NormalizedBatch {
    let mut n = Normalizer::new();
    let attempts = values.iter().filter_map(|v| n.normalize(v).ok()).collect();
    n.finish(attempts)
}

/// Splits a document into record values. Accepts a JSON array, a single JSON
/// object, or JSON Lines. In JSON Lines mode each bad line is its own error.
pub fn parse_document(content: &str) -> Vec<Result<Value, RecordError>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Vec<Value>>(trimmed) {
            Ok(values) => values.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(RecordError::malformed("document", e.to_string()))],
        };
    }

    if trimmed.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            return vec![Ok(v)];
        }
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line)
                .map_err(|e| RecordError::malformed("document", e.to_string()))
        })
        .collect()
}

struct ParsedAttempt {
    uuid: Option<String>,
    history_id: Option<String>,
    test_case_id: Option<String>,
    full_name: Option<String>,
    name: String,
    status: AttemptStatus,
    start_ms: i64,
    stop_ms: i64,
    environment: Option<String>,
    run_started_at_ms: i64,
}

impl ParsedAttempt {
    fn context(&self, occurrence: u32) -> AttemptContext<'_> {
        AttemptContext {
            uuid: self.uuid.as_deref(),
            history_id: self.history_id.as_deref(),
            test_case_id: self.test_case_id.as_deref(),
            full_name: self.full_name.as_deref(),
            name: &self.name,
            status: self.status.as_str(),
            start_ms: self.start_ms,
            stop_ms: self.stop_ms,
            occurrence,
        }
    }

    fn into_record(self, seq: u64, occurrences: &mut HashMap<String, u32>) -> AttemptRecord {
        let base = fingerprint::attempt(self.context(0));
        let seen = occurrences.entry(base.clone()).or_insert(0);
        let occurrence = *seen;
        *seen += 1;
        let fingerprint = if occurrence == 0 {
            base
        } else {
            fingerprint::attempt(self.context(occurrence))
        };
        AttemptRecord {
            seq,
            history_id: self.history_id,
            test_case_id: self.test_case_id,
            full_name: self.full_name,
            name: self.name,
            status: self.status,
            start_ms: self.start_ms,
            stop_ms: self.stop_ms,
            environment: self.environment,
            run_started_at_ms: self.run_started_at_ms,
            fingerprint,
        }
    }
}

fn parse_record(value: &Value, default_run_started_at_ms: i64) -> Result<ParsedAttempt, RecordError> {
    let obj = value
        .as_object()
        .ok_or_else(|| RecordError::malformed("record", "expected a JSON object"))?;

    let status = match lookup(obj, &["status"]) {
        None => AttemptStatus::Unknown,
        Some(Value::String(s)) => AttemptStatus::parse(s)
            .ok_or_else(|| RecordError::malformed("status", format!("unrecognized status '{}'", s)))?,
        Some(other) => {
            return Err(RecordError::malformed(
                "status",
                format!("expected string, got {}", other),
            ))
        }
    };

    let full_name = opt_string(obj, "fullName", &["fullName", "full_name"])?;
    let name = opt_string(obj, "name", &["name"])?
        .filter(|n| !n.trim().is_empty())
        .or_else(|| full_name.clone().filter(|n| !n.trim().is_empty()))
        .unwrap_or_else(|| "Unknown".to_string());

    Ok(ParsedAttempt {
        uuid: opt_string(obj, "uuid", &["uuid"])?,
        history_id: opt_string(obj, "historyId", &["historyId", "history_id"])?,
        test_case_id: opt_string(obj, "testCaseId", &["testCaseId", "test_case_id"])?,
        full_name,
        name,
        status,
        start_ms: timestamp(obj, "start", &["start"])?,
        stop_ms: timestamp(obj, "stop", &["stop"])?,
        environment: opt_string(obj, "environment", &["environment", "env"])?
            .filter(|e| !e.trim().is_empty()),
        run_started_at_ms: run_started_at(obj)?.unwrap_or(default_run_started_at_ms),
    })
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn opt_string(
    obj: &Map<String, Value>,
    field: &'static str,
    keys: &[&str],
) -> Result<Option<String>, RecordError> {
    match lookup(obj, keys) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(RecordError::malformed(
            field,
            format!("expected string, got {}", other),
        )),
    }
}

fn timestamp(obj: &Map<String, Value>, field: &'static str, keys: &[&str]) -> Result<i64, RecordError> {
    match lookup(obj, keys) {
        None => Ok(0),
        Some(Value::Number(n)) => millis_from_number(n)
            .ok_or_else(|| RecordError::malformed(field, format!("invalid epoch millis {}", n))),
        Some(other) => Err(RecordError::malformed(
            field,
            format!("expected epoch millis, got {}", other),
        )),
    }
}

fn millis_from_number(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return (i >= 0).then_some(i);
    }
    if n.is_u64() {
        return None;
    }
    let f = n.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= i64::MAX as f64).then_some(f as i64)
}

fn run_started_at(obj: &Map<String, Value>) -> Result<Option<i64>, RecordError> {
    match lookup(obj, &["runStartedAt", "run_started_at"]) {
        None => Ok(None),
        Some(Value::Number(n)) => millis_from_number(n).map(Some).ok_or_else(|| {
            RecordError::malformed("runStartedAt", format!("invalid epoch millis {}", n))
        }),
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Some(dt.timestamp_millis()))
            .map_err(|e| RecordError::malformed("runStartedAt", format!("'{}': {}", s, e))),
        Some(other) => Err(RecordError::malformed(
            "runStartedAt",
            format!("expected epoch millis or RFC 3339, got {}", other),
        )),
    }
}
