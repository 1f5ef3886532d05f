//! One scan: pre-loaded source documents in, one atomic storage commit out.

use crate::errors::SkipCounts;
use crate::fingerprint;
use crate::history;
use crate::ledger::FlakyLedgerEntry;
use crate::normalize::{parse_document, Normalizer};
use crate::storage::{ProcessedSource, ScanCommit, Store};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// A raw result document as read by the caller. The scanner never touches
/// the filesystem.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub path: String,
    pub modified_ms: i64,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScanOutcome {
    /// `None` when every source had already been processed.
    pub run_id: Option<i64>,
    pub sources_seen: u64,
    pub sources_skipped: u64,
    pub attempts_normalized: u64,
    pub attempts_inserted: u64,
    pub attempts_duplicate: u64,
    pub skipped: SkipCounts,
    pub ledger: Vec<FlakyLedgerEntry>,
}

#[derive(Clone)]
pub struct Scanner {
    store: Store,
}

impl Scanner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Sources already processed for `scope` (by content hash) are skipped,
    /// so scanning the same content twice is a no-op. Storage failures abort
    /// the scan with nothing written.
    pub fn scan(
        &self,
        scope: &str,
        run_started_at_ms: i64,
        sources: &[SourceDocument],
        now: DateTime<Utc>,
    ) -> anyhow::Result<ScanOutcome> {
        let mut outcome = ScanOutcome {
            sources_seen: sources.len() as u64,
            ..ScanOutcome::default()
        };

        let mut normalizer = Normalizer::with_run_started_at(run_started_at_ms);
        let mut attempts = Vec::new();
        let mut fresh = Vec::new();
        let mut hashes = HashSet::new();

        for doc in sources {
            let hash = fingerprint::content_hash(&doc.content);
            let processed = self
                .store
                .is_source_processed(scope, &hash)
                .with_context(|| format!("failed to check source {}", doc.path))?;
            if processed || !hashes.insert(hash.clone()) {
                outcome.sources_skipped += 1;
                tracing::debug!(
                    event = "flakewatch.scan.source_skipped",
                    path = %doc.path,
                    "source already processed"
                );
                continue;
            }

            attempts.extend(normalizer.normalize_document(&parse_document(&doc.content)));
            fresh.push(ProcessedSource {
                content_hash: hash,
                path: doc.path.clone(),
                modified_ms: doc.modified_ms,
            });
        }

        let batch = normalizer.finish(attempts);
        outcome.skipped = batch.skipped;

        if fresh.is_empty() {
            tracing::info!(
                event = "flakewatch.scan.noop",
                scope,
                sources = outcome.sources_seen,
                "no new sources to scan"
            );
            return Ok(outcome);
        }

        let set = history::group(batch.attempts);
        outcome.skipped.merge(&set.skipped());
        let resolved: Vec<_> = set
            .into_histories()
            .into_iter()
            .flat_map(|h| h.attempts().to_vec())
            .collect();
        outcome.attempts_normalized = resolved.len() as u64;

        let write = self
            .store
            .commit_scan(&ScanCommit {
                scope,
                run_started_at_ms,
                sources: &fresh,
                attempts: &resolved,
                now,
            })
            .context("scan commit failed")?;

        outcome.run_id = Some(write.run_id);
        outcome.attempts_inserted = write.inserted;
        outcome.attempts_duplicate = write.duplicates;
        outcome.ledger = write.ledger;

        tracing::info!(
            event = "flakewatch.scan.committed",
            scope,
            run_id = write.run_id,
            sources = fresh.len(),
            inserted = outcome.attempts_inserted,
            duplicates = outcome.attempts_duplicate,
            ledger_updates = outcome.ledger.len(),
            skipped = outcome.skipped.total(),
            "scan committed"
        );
        Ok(outcome)
    }
}
