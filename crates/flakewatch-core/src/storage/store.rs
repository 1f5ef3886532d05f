use crate::history;
use crate::identity;
use crate::ledger::{self, FlakyLedgerEntry};
use crate::model::{AttemptRecord, AttemptStatus};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub runs: u64,
    pub attempts: u64,
    pub ledger_entries: u64,
    pub ledger_active: u64,
    pub processed_sources: u64,
    pub last_run_id: Option<i64>,
    pub last_run_at: Option<String>,
    pub schema_version: i64,
}

/// A source document to be marked processed once its scan commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedSource {
    pub content_hash: String,
    pub path: String,
    pub modified_ms: i64,
}

/// Everything one scan writes. Committed in a single transaction.
pub struct ScanCommit<'a> {
    pub scope: &'a str,
    pub run_started_at_ms: i64,
    pub sources: &'a [ProcessedSource],
    /// Attempts with a resolvable identity.
    pub attempts: &'a [AttemptRecord],
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanWrite {
    pub run_id: i64,
    pub inserted: u64,
    pub duplicates: u64,
    pub ledger: Vec<FlakyLedgerEntry>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        Ok(())
    }

    pub fn is_source_processed(&self, scope: &str, content_hash: &str) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_sources WHERE scope = ?1 AND content_hash = ?2",
                params![scope, content_hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Attempts of `scope` whose parent run, or the attempt itself, started at
    /// or after `since_ms`. The parent run is the record's own `runStartedAt`
    /// when it carried one, else the scan's run. Returned in insertion order;
    /// `seq` is the row id.
    pub fn fetch_attempts_since(
        &self,
        scope: &str,
        since_ms: i64,
    ) -> anyhow::Result<Vec<AttemptRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT
                a.id, a.history_id, a.test_case_id, a.full_name, a.name, a.status,
                a.start_ms, a.stop_ms, a.environment,
                COALESCE(a.run_started_at_ms, r.started_at_ms), a.fingerprint
             FROM attempts a
             JOIN runs r ON a.run_id = r.id
             WHERE a.scope = ?1
               AND (COALESCE(a.run_started_at_ms, r.started_at_ms) >= ?2 OR a.start_ms >= ?2)
             ORDER BY a.id ASC",
        )?;

        let rows = stmt.query_map(params![scope, since_ms], |row| {
            let status: String = row.get(5)?;
            Ok(AttemptRecord {
                seq: row.get::<_, i64>(0)? as u64,
                history_id: row.get(1)?,
                test_case_id: row.get(2)?,
                full_name: row.get(3)?,
                name: row.get(4)?,
                status: AttemptStatus::parse(&status).unwrap_or(AttemptStatus::Unknown),
                start_ms: row.get(6)?,
                stop_ms: row.get(7)?,
                environment: row.get(8)?,
                run_started_at_ms: row.get(9)?,
                fingerprint: row.get(10)?,
            })
        })?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Writes a scan atomically: run row, attempts (deduplicated by
    /// fingerprint), ledger upserts and processed-source markers.
    ///
    /// Ledger counts come only from attempts this call actually inserted.
    pub fn commit_scan(&self, scan: &ScanCommit<'_>) -> anyhow::Result<ScanWrite> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin scan transaction")?;

        tx.execute(
            "INSERT INTO runs(scope, started_at_ms, created_at, sources) VALUES (?1, ?2, ?3, ?4)",
            params![
                scan.scope,
                scan.run_started_at_ms,
                scan.now.to_rfc3339(),
                scan.sources.len() as i64
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        let mut new_seqs = HashSet::new();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO attempts(
                    run_id, scope, fingerprint, identity, history_id, test_case_id,
                    full_name, name, status, start_ms, stop_ms, environment, run_started_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for a in scan.attempts {
                let inserted = stmt.execute(params![
                    run_id,
                    scan.scope,
                    a.fingerprint,
                    identity::resolve_key(a).ok(),
                    a.history_id,
                    a.test_case_id,
                    a.full_name,
                    a.name,
                    a.status.as_str(),
                    a.start_ms,
                    a.stop_ms,
                    a.environment,
                    (a.run_started_at_ms > 0).then_some(a.run_started_at_ms),
                ])?;
                if inserted == 1 {
                    new_seqs.insert(a.seq);
                }
            }
        }

        let set = history::group(scan.attempts.iter().cloned());
        let deltas = ledger::ledger_deltas(&set, |a| new_seqs.contains(&a.seq));
        let mut entries = Vec::with_capacity(deltas.len());
        for delta in &deltas {
            let existing = ledger_entry_tx(&tx, scan.scope, &delta.identity)?;
            let entry = ledger::upsert(existing, scan.scope, delta, scan.now);
            write_ledger_entry(&tx, &entry)?;
            tracing::debug!(
                event = "flakewatch.ledger.upsert",
                scope = scan.scope,
                identity = %entry.identity,
                total_runs = entry.total_runs,
                score = entry.flakiness_score,
                "ledger entry updated"
            );
            entries.push(entry);
        }

        for s in scan.sources {
            tx.execute(
                "INSERT OR IGNORE INTO processed_sources(scope, content_hash, path, modified_ms, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    scan.scope,
                    s.content_hash,
                    s.path,
                    s.modified_ms,
                    scan.now.to_rfc3339()
                ],
            )?;
        }

        tx.commit().context("failed to commit scan transaction")?;

        let inserted = new_seqs.len() as u64;
        Ok(ScanWrite {
            run_id,
            inserted,
            duplicates: scan.attempts.len() as u64 - inserted,
            ledger: entries,
        })
    }

    /// Ledger entries ordered by score (highest first), then identity.
    pub fn ledger_entries(
        &self,
        scope: &str,
        active_only: bool,
        limit: u32,
    ) -> anyhow::Result<Vec<FlakyLedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT scope, identity, test_name, total_runs, passed_runs, failed_runs,
                    flakiness_score, first_detected_ms, last_detected_ms, is_active, resolved_at_ms
             FROM flaky_ledger
             WHERE scope = ?1 AND (?2 = 0 OR is_active = 1)
             ORDER BY flakiness_score DESC, identity ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![scope, active_only as i64, limit], ledger_from_row)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn ledger_entry(&self, scope: &str, identity: &str) -> anyhow::Result<Option<FlakyLedgerEntry>> {
        let conn = self.lock()?;
        ledger_entry_conn(&conn, scope, identity)
    }

    /// Marks an active entry resolved. Returns false when nothing was active.
    pub fn resolve_ledger_entry(
        &self,
        scope: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE flaky_ledger SET is_active = 0, resolved_at_ms = ?3
             WHERE scope = ?1 AND identity = ?2 AND is_active = 1",
            params![scope, identity, now.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn stats(&self) -> anyhow::Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> anyhow::Result<u64> {
            Ok(conn.query_row(sql, [], |r| r.get::<_, i64>(0))? as u64)
        };

        let runs = count("SELECT COUNT(*) FROM runs")?;
        let attempts = count("SELECT COUNT(*) FROM attempts")?;
        let ledger_entries = count("SELECT COUNT(*) FROM flaky_ledger")?;
        let ledger_active = count("SELECT COUNT(*) FROM flaky_ledger WHERE is_active = 1")?;
        let processed_sources = count("SELECT COUNT(*) FROM processed_sources")?;

        let last: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, created_at FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let schema_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        Ok(StoreStats {
            runs,
            attempts,
            ledger_entries,
            ledger_active,
            processed_sources,
            last_run_id: last.as_ref().map(|(id, _)| *id),
            last_run_at: last.map(|(_, at)| at),
            schema_version,
        })
    }
}

const LEDGER_SELECT: &str = "SELECT scope, identity, test_name, total_runs, passed_runs, failed_runs,
        flakiness_score, first_detected_ms, last_detected_ms, is_active, resolved_at_ms
 FROM flaky_ledger WHERE scope = ?1 AND identity = ?2";

fn ledger_entry_conn(
    conn: &Connection,
    scope: &str,
    identity: &str,
) -> anyhow::Result<Option<FlakyLedgerEntry>> {
    Ok(conn
        .query_row(LEDGER_SELECT, params![scope, identity], ledger_from_row)
        .optional()?)
}

fn ledger_entry_tx(
    tx: &Transaction<'_>,
    scope: &str,
    identity: &str,
) -> anyhow::Result<Option<FlakyLedgerEntry>> {
    ledger_entry_conn(tx, scope, identity)
}

fn write_ledger_entry(tx: &Transaction<'_>, e: &FlakyLedgerEntry) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO flaky_ledger(
            scope, identity, test_name, total_runs, passed_runs, failed_runs,
            flakiness_score, first_detected_ms, last_detected_ms, is_active, resolved_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(scope, identity) DO UPDATE SET
            test_name = excluded.test_name,
            total_runs = excluded.total_runs,
            passed_runs = excluded.passed_runs,
            failed_runs = excluded.failed_runs,
            flakiness_score = excluded.flakiness_score,
            last_detected_ms = excluded.last_detected_ms,
            is_active = excluded.is_active,
            resolved_at_ms = excluded.resolved_at_ms",
        params![
            e.scope,
            e.identity,
            e.test_name,
            e.total_runs as i64,
            e.passed_runs as i64,
            e.failed_runs as i64,
            e.flakiness_score,
            e.first_detected.timestamp_millis(),
            e.last_detected.timestamp_millis(),
            e.is_active,
            e.resolved_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn ledger_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlakyLedgerEntry> {
    Ok(FlakyLedgerEntry {
        scope: row.get(0)?,
        identity: row.get(1)?,
        test_name: row.get(2)?,
        total_runs: row.get::<_, i64>(3)? as u64,
        passed_runs: row.get::<_, i64>(4)? as u64,
        failed_runs: row.get::<_, i64>(5)? as u64,
        flakiness_score: row.get(6)?,
        first_detected: from_millis(row.get(7)?),
        last_detected: from_millis(row.get(8)?),
        is_active: row.get(9)?,
        resolved_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::test_support::attempt;
    use AttemptStatus::*;

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn commit(store: &Store, attempts: &[AttemptRecord], sources: &[ProcessedSource], now_ms: i64) -> ScanWrite {
        store
            .commit_scan(&ScanCommit {
                scope: "default",
                run_started_at_ms: now_ms,
                sources,
                attempts,
                now: at(now_ms),
            })
            .unwrap()
    }

    #[test]
    fn init_schema_is_repeatable() {
        let s = store();
        s.init_schema().unwrap();
        assert_eq!(s.stats().unwrap().schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn fresh_schema_has_every_column() {
        let s = store();
        let conn = s.conn.lock().unwrap();
        conn.prepare("SELECT environment, run_started_at_ms FROM attempts").unwrap();
        conn.prepare("SELECT resolved_at_ms FROM flaky_ledger").unwrap();
    }

    #[test]
    fn duplicate_fingerprints_are_ignored() {
        let s = store();
        let attempts = vec![attempt("t", Failed, 10, 0), attempt("t", Passed, 20, 1)];
        let first = commit(&s, &attempts, &[], 1_000);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.ledger.len(), 1);

        let second = commit(&s, &attempts, &[], 2_000);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert!(second.ledger.is_empty());

        let entry = s.ledger_entry("default", "t").unwrap().unwrap();
        assert_eq!(entry.total_runs, 2);
        assert_eq!(entry.flakiness_score, 0.5);
    }

    #[test]
    fn ledger_accumulates_across_scans() {
        let s = store();
        commit(&s, &[attempt("t", Failed, 10, 0), attempt("t", Passed, 20, 1)], &[], 1_000);
        commit(
            &s,
            &[
                attempt("t", Passed, 30, 2),
                attempt("t", Passed, 40, 3),
                attempt("t", Broken, 50, 4),
            ],
            &[],
            2_000,
        );
        let e = s.ledger_entry("default", "t").unwrap().unwrap();
        assert_eq!((e.total_runs, e.passed_runs, e.failed_runs), (5, 3, 2));
        assert_eq!(e.first_detected, at(1_000));
        assert_eq!(e.last_detected, at(2_000));
    }

    #[test]
    fn processed_sources_are_recorded() {
        let s = store();
        let src = ProcessedSource {
            content_hash: "sha256:abc".into(),
            path: "a-result.json".into(),
            modified_ms: 5,
        };
        assert!(!s.is_source_processed("default", "sha256:abc").unwrap());
        commit(&s, &[attempt("t", Passed, 1, 0)], std::slice::from_ref(&src), 1_000);
        assert!(s.is_source_processed("default", "sha256:abc").unwrap());
        assert!(!s.is_source_processed("other", "sha256:abc").unwrap());
    }

    #[test]
    fn fetch_attempts_since_respects_scope_and_time() {
        let s = store();
        let mut a = attempt("t", Failed, 0, 0);
        a.environment = Some("ci".into());
        commit(&s, &[a], &[], 5_000);

        let rows = s.fetch_attempts_since("default", 4_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].run_started_at_ms, 5_000);
        assert_eq!(rows[0].status, Failed);
        assert_eq!(rows[0].environment.as_deref(), Some("ci"));
        assert!(s.fetch_attempts_since("default", 6_000).unwrap().is_empty());
        assert!(s.fetch_attempts_since("other", 0).unwrap().is_empty());
    }

    #[test]
    fn attempts_keep_their_own_run_start() {
        let s = store();
        let mut older = attempt("t", Passed, 0, 0);
        older.run_started_at_ms = 2_000;
        let newer = attempt("u", Passed, 0, 1);
        commit(&s, &[older, newer], &[], 9_000);

        let rows = s.fetch_attempts_since("default", 0).unwrap();
        let starts: Vec<_> = rows.iter().map(|r| r.run_started_at_ms).collect();
        assert_eq!(starts, vec![2_000, 9_000]);

        let recent = s.fetch_attempts_since("default", 5_000).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].history_id.as_deref(), Some("u"));
    }

    #[test]
    fn resolve_then_reactivate() {
        let s = store();
        commit(&s, &[attempt("t", Failed, 10, 0), attempt("t", Passed, 20, 1)], &[], 1_000);
        assert!(s.resolve_ledger_entry("default", "t", at(1_500)).unwrap());
        assert!(!s.resolve_ledger_entry("default", "t", at(1_600)).unwrap());
        assert!(s.ledger_entries("default", true, 10).unwrap().is_empty());
        assert_eq!(s.ledger_entries("default", false, 10).unwrap().len(), 1);

        commit(&s, &[attempt("t", Failed, 30, 2), attempt("t", Passed, 40, 3)], &[], 2_000);
        let e = s.ledger_entry("default", "t").unwrap().unwrap();
        assert!(e.is_active);
        assert_eq!(e.resolved_at, None);
        assert_eq!(e.total_runs, 4);
    }

    #[test]
    fn stats_count_rows() {
        let s = store();
        commit(&s, &[attempt("t", Failed, 10, 0), attempt("t", Passed, 20, 1)], &[], 1_000);
        let st = s.stats().unwrap();
        assert_eq!(st.runs, 1);
        assert_eq!(st.attempts, 2);
        assert_eq!(st.ledger_active, 1);
        assert_eq!(st.last_run_id, Some(1));
    }
}
