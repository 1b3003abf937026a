//! Database schema.

use anyhow::Result;
use rusqlite::Connection;

/// Create tables and indexes. Safe to run on every open.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS test_executions (
            id INTEGER PRIMARY KEY,
            test_case_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('passed', 'failed')),
            execution_time_ms INTEGER NOT NULL,
            dom_stability_score REAL,
            wait_condition_failures INTEGER,
            network_call_count INTEGER,
            error_message TEXT,
            executed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flaky_tests (
            id TEXT PRIMARY KEY,
            test_case_id TEXT NOT NULL UNIQUE,
            flakiness_score REAL NOT NULL,
            timing_variance REAL NOT NULL,
            failure_rate REAL NOT NULL,
            total_runs INTEGER NOT NULL,
            failed_runs INTEGER NOT NULL,
            root_causes_json TEXT NOT NULL,
            last_failed_at TEXT,
            is_resolved INTEGER NOT NULL DEFAULT 0,
            detected_at TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_test_executions_case ON test_executions(test_case_id, executed_at);
        CREATE INDEX IF NOT EXISTS idx_flaky_tests_score ON flaky_tests(is_resolved, flakiness_score);",
    )?;

    Ok(())
}
