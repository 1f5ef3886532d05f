pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  scope TEXT NOT NULL,
  started_at_ms INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  sources INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id INTEGER NOT NULL REFERENCES runs(id),
  scope TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  identity TEXT,
  history_id TEXT,
  test_case_id TEXT,
  full_name TEXT,
  name TEXT NOT NULL,
  status TEXT NOT NULL,
  start_ms INTEGER NOT NULL DEFAULT 0,
  stop_ms INTEGER NOT NULL DEFAULT 0,
  environment TEXT,
  -- parent-run start carried by the record; NULL means the scan's run
  run_started_at_ms INTEGER,
  UNIQUE (scope, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_attempts_run ON attempts(run_id);
CREATE INDEX IF NOT EXISTS idx_runs_scope_started ON runs(scope, started_at_ms);

CREATE TABLE IF NOT EXISTS flaky_ledger (
  scope TEXT NOT NULL,
  identity TEXT NOT NULL,
  test_name TEXT NOT NULL,
  total_runs INTEGER NOT NULL,
  passed_runs INTEGER NOT NULL,
  failed_runs INTEGER NOT NULL,
  flakiness_score REAL NOT NULL,
  first_detected_ms INTEGER NOT NULL,
  last_detected_ms INTEGER NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1,
  resolved_at_ms INTEGER,
  PRIMARY KEY (scope, identity)
);

CREATE TABLE IF NOT EXISTS processed_sources (
  scope TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  path TEXT NOT NULL,
  modified_ms INTEGER NOT NULL DEFAULT 0,
  processed_at TEXT NOT NULL,
  PRIMARY KEY (scope, content_hash)
);
"#;
