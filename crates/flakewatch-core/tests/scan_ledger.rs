use chrono::{DateTime, Utc};
use flakewatch_core::classify::{classify_all, ClassificationRule};
use flakewatch_core::history::group;
use flakewatch_core::model::Verdict;
use flakewatch_core::normalize::normalize_batch;
use flakewatch_core::scan::{Scanner, SourceDocument};
use flakewatch_core::storage::Store;
use flakewatch_core::trend::{trend_series, TrendPeriod};
use serde_json::json;
use tempfile::TempDir;

const RUN_MS: i64 = 1_763_107_200_000;
const DAY: i64 = 86_400_000;

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

fn doc(path: &str, records: serde_json::Value) -> SourceDocument {
    SourceDocument {
        path: path.to_string(),
        modified_ms: RUN_MS,
        content: records.to_string(),
    }
}

fn file_store(dir: &TempDir) -> Store {
    let store = Store::open(&dir.path().join("flakewatch.db")).unwrap();
    store.init_schema().unwrap();
    store
}

fn retry_pair(id: &str, uuid_prefix: &str, first: &str, second: &str) -> serde_json::Value {
    json!([
        {"uuid": format!("{}-1", uuid_prefix), "historyId": id, "name": id, "status": first, "start": RUN_MS, "stop": RUN_MS + 10},
        {"uuid": format!("{}-2", uuid_prefix), "historyId": id, "name": id, "status": second, "start": RUN_MS + 20, "stop": RUN_MS + 30}
    ])
}

#[test]
fn rescanning_identical_content_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));
    let sources = vec![doc("a-result.json", retry_pair("login", "u1", "failed", "passed"))];

    let first = scanner.scan("web", RUN_MS, &sources, at(RUN_MS)).unwrap();
    assert!(first.run_id.is_some());
    assert_eq!(first.attempts_inserted, 2);
    assert_eq!(first.ledger.len(), 1);

    let second = scanner.scan("web", RUN_MS, &sources, at(RUN_MS + 1)).unwrap();
    assert_eq!(second.run_id, None);
    assert_eq!(second.sources_skipped, 1);

    let entries = scanner.store().ledger_entries("web", true, 10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].total_runs, 2);
    assert_eq!(scanner.store().stats().unwrap().runs, 1);
}

#[test]
fn overlapping_exports_do_not_double_count() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));

    scanner
        .scan("web", RUN_MS, &[doc("day1.json", retry_pair("login", "u1", "failed", "passed"))], at(RUN_MS))
        .unwrap();

    // same two attempts re-exported together with one new retry
    let overlap = json!([
        {"uuid": "u1-1", "historyId": "login", "status": "failed", "start": RUN_MS, "stop": RUN_MS + 10},
        {"uuid": "u1-2", "historyId": "login", "status": "passed", "start": RUN_MS + 20, "stop": RUN_MS + 30},
        {"uuid": "u1-3", "historyId": "login", "status": "failed", "start": RUN_MS + 40, "stop": RUN_MS + 50}
    ]);
    let out = scanner
        .scan("web", RUN_MS + 1000, &[doc("day1-again.json", overlap)], at(RUN_MS + 1000))
        .unwrap();
    assert_eq!(out.attempts_inserted, 1);
    assert_eq!(out.attempts_duplicate, 2);

    let e = scanner.store().ledger_entry("web", "login").unwrap().unwrap();
    assert_eq!((e.total_runs, e.passed_runs, e.failed_runs), (3, 1, 2));
    assert!((e.flakiness_score - 1.0 / 3.0).abs() < 1e-9);
}

#[test]
fn ledger_accumulates_and_reactivates_after_resolution() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));

    scanner
        .scan("web", RUN_MS, &[doc("r1.json", retry_pair("cart", "c1", "broken", "passed"))], at(RUN_MS))
        .unwrap();
    assert!(scanner
        .store()
        .resolve_ledger_entry("web", "cart", at(RUN_MS + 10))
        .unwrap());
    assert!(scanner.store().ledger_entries("web", true, 10).unwrap().is_empty());

    scanner
        .scan("web", RUN_MS + DAY, &[doc("r2.json", retry_pair("cart", "c2", "failed", "passed"))], at(RUN_MS + DAY))
        .unwrap();
    let active = scanner.store().ledger_entries("web", true, 10).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].total_runs, 4);
    assert_eq!(active[0].first_detected, at(RUN_MS));
    assert_eq!(active[0].last_detected, at(RUN_MS + DAY));
}

#[test]
fn stable_tests_never_enter_the_ledger() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));
    let out = scanner
        .scan(
            "web",
            RUN_MS,
            &[
                doc("green.json", retry_pair("green", "g", "passed", "passed")),
                doc("red.json", retry_pair("red", "r", "failed", "broken")),
            ],
            at(RUN_MS),
        )
        .unwrap();
    assert_eq!(out.attempts_inserted, 4);
    assert!(out.ledger.is_empty());
}

#[test]
fn scopes_are_isolated() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));
    let sources = vec![doc("a.json", retry_pair("login", "u1", "failed", "passed"))];
    scanner.scan("web", RUN_MS, &sources, at(RUN_MS)).unwrap();
    let other = scanner.scan("mobile", RUN_MS, &sources, at(RUN_MS)).unwrap();
    assert_eq!(other.attempts_inserted, 2);
    assert_eq!(scanner.store().fetch_attempts_since("mobile", 0).unwrap().len(), 2);
}

#[test]
fn malformed_and_orphan_records_are_counted() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));
    let records = json!([
        {"historyId": "ok", "status": "passed"},
        {"historyId": "bad", "status": 42},
        {"name": "orphan", "status": "passed"}
    ]);
    let out = scanner.scan("web", RUN_MS, &[doc("mixed.json", records)], at(RUN_MS)).unwrap();
    assert_eq!(out.attempts_inserted, 1);
    assert_eq!(out.skipped.malformed, 1);
    assert_eq!(out.skipped.identity_missing, 1);
}

#[test]
fn failed_commit_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    store
        .conn
        .lock()
        .unwrap()
        .execute("DROP TABLE flaky_ledger", [])
        .unwrap();

    let scanner = Scanner::new(store.clone());
    let sources = vec![doc("a.json", retry_pair("login", "u1", "failed", "passed"))];
    assert!(scanner.scan("web", RUN_MS, &sources, at(RUN_MS)).is_err());

    let conn = store.conn.lock().unwrap();
    let count = |table: &str| -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    };
    assert_eq!(count("runs"), 0);
    assert_eq!(count("attempts"), 0);
    assert_eq!(count("processed_sources"), 0);
}

#[test]
fn reopened_store_remembers_processed_sources() {
    let dir = TempDir::new().unwrap();
    let sources = vec![doc("a.json", retry_pair("login", "u1", "failed", "passed"))];
    {
        let scanner = Scanner::new(file_store(&dir));
        scanner.scan("web", RUN_MS, &sources, at(RUN_MS)).unwrap();
    }
    let scanner = Scanner::new(file_store(&dir));
    let out = scanner.scan("web", RUN_MS, &sources, at(RUN_MS)).unwrap();
    assert_eq!(out.sources_skipped, 1);
    assert_eq!(out.run_id, None);
}

#[test]
fn untimed_retries_with_repeated_status_are_all_stored() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));
    let records = json!([
        {"historyId": "t", "status": "failed"},
        {"historyId": "t", "status": "passed"},
        {"historyId": "t", "status": "failed"}
    ]);

    let out = scanner
        .scan("web", RUN_MS, &[doc("untimed-result.json", records.clone())], at(RUN_MS))
        .unwrap();
    assert_eq!(out.attempts_inserted, 3);
    assert_eq!(out.attempts_duplicate, 0);

    let stored = scanner.store().fetch_attempts_since("web", 0).unwrap();
    assert_eq!(stored.len(), 3);
    let verdict = |set| classify_all(&set, ClassificationRule::default()).records[0].verdict;
    assert_eq!(verdict(group(stored)), Verdict::Failed);
    let values = records.as_array().unwrap().clone();
    assert_eq!(verdict(group(normalize_batch(&values).attempts)), Verdict::Failed);

    let e = scanner.store().ledger_entry("web", "t").unwrap().unwrap();
    assert_eq!((e.total_runs, e.passed_runs, e.failed_runs), (3, 1, 2));

    // a later export repeating the same records plus one new retry
    let repeat = json!([
        {"historyId": "t", "status": "failed"},
        {"historyId": "t", "status": "passed"},
        {"historyId": "t", "status": "failed"},
        {"historyId": "t", "status": "failed"}
    ]);
    let again = scanner
        .scan("web", RUN_MS + DAY, &[doc("untimed-2-result.json", repeat)], at(RUN_MS + DAY))
        .unwrap();
    assert_eq!(again.attempts_inserted, 1);
    assert_eq!(again.attempts_duplicate, 3);
}

#[test]
fn stored_attempts_bucket_by_their_own_run_start() {
    let dir = TempDir::new().unwrap();
    let scanner = Scanner::new(file_store(&dir));
    let records = json!([
        {"historyId": "a", "status": "passed", "runStartedAt": RUN_MS - 3 * DAY},
        {"historyId": "b", "status": "passed", "runStartedAt": RUN_MS - 1000}
    ]);
    scanner
        .scan("web", RUN_MS, &[doc("multi-run-result.json", records.clone())], at(RUN_MS))
        .unwrap();

    let totals = |attempts: &[flakewatch_core::model::AttemptRecord]| {
        trend_series(attempts, TrendPeriod::days(7), at(RUN_MS), ClassificationRule::default())
            .buckets
            .iter()
            .map(|b| b.total)
            .collect::<Vec<_>>()
    };

    let stored = scanner.store().fetch_attempts_since("web", RUN_MS - 7 * DAY).unwrap();
    let values = records.as_array().unwrap().clone();
    let in_memory = normalize_batch(&values).attempts;
    assert_eq!(totals(&stored), vec![0, 0, 0, 1, 0, 0, 1]);
    assert_eq!(totals(&stored), totals(&in_memory));
}
