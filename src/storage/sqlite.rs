use crate::flaky::{
    ExecutionRecord, ExecutionStatus, FlakyError, FlakyTestRecord, FlakyTestUpdate, NewExecution,
    RootCauseHypothesis, MAX_EXECUTION_TIME_MS,
};
use crate::storage::{ExecutionStore, Pool, Recorded};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

const EXECUTION_COLUMNS: &str = "id, test_case_id, status, execution_time_ms, dom_stability_score,
     wait_condition_failures, network_call_count, error_message, executed_at";

const FLAKY_COLUMNS: &str = "id, test_case_id, flakiness_score, timing_variance, failure_rate,
     total_runs, failed_runs, root_causes_json, last_failed_at, is_resolved, detected_at";

/// SQLite-backed store sharing the daemon's connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(2)?;
    let status = status.parse::<ExecutionStatus>().map_err(|e| conversion_error(2, e))?;
    Ok(ExecutionRecord {
        id: Some(row.get(0)?),
        test_case_id: row.get(1)?,
        status,
        execution_time_ms: row.get::<_, i64>(3)?.max(0) as u64,
        dom_stability_score: row.get(4)?,
        wait_condition_failures: row.get(5)?,
        network_call_count: row.get(6)?,
        error_message: row.get(7)?,
        executed_at: parse_time(8, row.get(8)?)?,
    })
}

fn flaky_from_row(row: &Row<'_>) -> rusqlite::Result<FlakyTestRecord> {
    let id: String = row.get(0)?;
    let root_causes_json: String = row.get(7)?;
    let root_causes: Vec<RootCauseHypothesis> =
        serde_json::from_str(&root_causes_json).map_err(|e| conversion_error(7, e))?;
    let last_failed_at = match row.get::<_, Option<String>>(8)? {
        Some(s) => Some(parse_time(8, s)?),
        None => None,
    };

    Ok(FlakyTestRecord {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        test_case_id: row.get(1)?,
        flakiness_score: row.get(2)?,
        timing_variance: row.get(3)?,
        failure_rate: row.get(4)?,
        total_runs: row.get::<_, i64>(5)?.max(0) as u64,
        failed_runs: row.get::<_, i64>(6)?.max(0) as u64,
        root_causes,
        last_failed_at,
        is_resolved: row.get::<_, i64>(9)? != 0,
        detected_at: parse_time(10, row.get(10)?)?,
    })
}

fn query_executions(conn: &Connection, test_case_id: &str) -> rusqlite::Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM test_executions
         WHERE test_case_id = ?1
         ORDER BY executed_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![test_case_id], execution_from_row)?;

    let mut executions = Vec::new();
    for r in rows {
        executions.push(r?);
    }
    Ok(executions)
}

fn query_flaky_by_test_case(
    conn: &Connection,
    test_case_id: &str,
) -> rusqlite::Result<Option<FlakyTestRecord>> {
    conn.query_row(
        &format!("SELECT {FLAKY_COLUMNS} FROM flaky_tests WHERE test_case_id = ?1"),
        params![test_case_id],
        flaky_from_row,
    )
    .optional()
}

fn query_flaky_by_id(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<FlakyTestRecord>> {
    conn.query_row(
        &format!("SELECT {FLAKY_COLUMNS} FROM flaky_tests WHERE id = ?1"),
        params![id.to_string()],
        flaky_from_row,
    )
    .optional()
}

/// Create or update the flaky record keyed by test case id.
fn upsert_flaky(conn: &Connection, update: &FlakyTestUpdate) -> Result<FlakyTestRecord, FlakyError> {
    let report = &update.report;
    let root_causes_json = serde_json::to_string(&report.root_causes)?;
    let last_failed_at = update.last_failed_at.as_ref().map(format_time);

    conn.execute(
        "INSERT INTO flaky_tests (
            id, test_case_id, flakiness_score, timing_variance, failure_rate,
            total_runs, failed_runs, root_causes_json, last_failed_at,
            is_resolved, detected_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)
        ON CONFLICT(test_case_id) DO UPDATE SET
            flakiness_score = excluded.flakiness_score,
            timing_variance = excluded.timing_variance,
            failure_rate = excluded.failure_rate,
            total_runs = excluded.total_runs,
            failed_runs = excluded.failed_runs,
            root_causes_json = excluded.root_causes_json,
            last_failed_at = COALESCE(excluded.last_failed_at, flaky_tests.last_failed_at),
            updated_at = datetime('now')",
        params![
            Uuid::new_v4().to_string(),
            update.test_case_id,
            report.flakiness_score,
            report.timing_variance,
            report.failure_rate,
            update.total_runs as i64,
            update.failed_runs as i64,
            root_causes_json,
            last_failed_at,
            format_time(&Utc::now()),
        ],
    )?;

    query_flaky_by_test_case(conn, &update.test_case_id)?
        .ok_or_else(|| FlakyError::NotFound(format!("flaky test for '{}'", update.test_case_id)))
}

impl ExecutionStore for SqliteStore {
    fn record_execution<F>(&self, execution: NewExecution, assess: F) -> Result<Recorded, FlakyError>
    where
        F: FnOnce(&[ExecutionRecord]) -> Option<FlakyTestUpdate>,
    {
        execution.validate()?;
        let mut conn = self.pool.get()?;
        // Take the write lock up front; a deferred read-then-write upgrade fails
        // with SQLITE_BUSY without consulting busy_timeout.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = execution.into_record(None);
        record.executed_at = record.executed_at.trunc_subsecs(6);
        let execution_time_ms =
            i64::try_from(record.execution_time_ms).map_err(|_| FlakyError::InvalidExecution {
                field: "execution_time_ms",
                reason: format!("must be at most {}", MAX_EXECUTION_TIME_MS),
            })?;
        tx.execute(
            "INSERT INTO test_executions (
                test_case_id, status, execution_time_ms, dom_stability_score,
                wait_condition_failures, network_call_count, error_message, executed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.test_case_id,
                record.status.as_str(),
                execution_time_ms,
                record.dom_stability_score,
                record.wait_condition_failures,
                record.network_call_count,
                record.error_message,
                format_time(&record.executed_at),
            ],
        )?;
        let record = ExecutionRecord {
            id: Some(tx.last_insert_rowid()),
            ..record
        };

        let history = query_executions(&tx, &record.test_case_id)?;
        let flaky_test = match assess(&history) {
            Some(update) => Some(upsert_flaky(&tx, &update)?),
            None => None,
        };
        tx.commit()?;

        Ok(Recorded {
            execution: record,
            history,
            flaky_test,
        })
    }

    fn executions_for(&self, test_case_id: &str) -> Result<Vec<ExecutionRecord>, FlakyError> {
        let conn = self.pool.get()?;
        Ok(query_executions(&conn, test_case_id)?)
    }

    fn count_test_cases(&self) -> Result<u64, FlakyError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT test_case_id) FROM test_executions",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn flaky_by_id(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError> {
        let conn = self.pool.get()?;
        Ok(query_flaky_by_id(&conn, id)?)
    }

    fn list_unresolved_flaky(&self) -> Result<Vec<FlakyTestRecord>, FlakyError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FLAKY_COLUMNS} FROM flaky_tests
             WHERE is_resolved = 0
             ORDER BY flakiness_score DESC, detected_at ASC"
        ))?;
        let rows = stmt.query_map([], flaky_from_row)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    fn mark_resolved(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE flaky_tests SET is_resolved = 1, updated_at = datetime('now') WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(query_flaky_by_id(&conn, id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flaky::{FlakinessReport, RootCauseKind};
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Barrier};

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flakescope.db");
        let pool = crate::storage::open_pool(path.to_str().unwrap()).unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn new_execution(test_case_id: &str, status: ExecutionStatus, minute: i64) -> NewExecution {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        NewExecution {
            test_case_id: test_case_id.to_string(),
            status,
            execution_time_ms: 1000 + minute as u64 * 10,
            dom_stability_score: Some(75.5),
            wait_condition_failures: Some(0),
            network_call_count: None,
            error_message: (status == ExecutionStatus::Failed).then(|| "timeout".to_string()),
            executed_at: Some(base + Duration::minutes(minute)),
        }
    }

    fn update(test_case_id: &str, score: f64, last_failed_at: Option<DateTime<Utc>>) -> FlakyTestUpdate {
        FlakyTestUpdate {
            test_case_id: test_case_id.to_string(),
            report: FlakinessReport {
                is_flaky: true,
                flakiness_score: score,
                timing_variance: 41.5,
                failure_rate: 20.0,
                dom_stability: 100.0,
                root_causes: vec![RootCauseHypothesis::new(
                    RootCauseKind::Timing,
                    62.0,
                    "jittery".to_string(),
                )],
            },
            total_runs: 5,
            failed_runs: 1,
            last_failed_at,
        }
    }

    fn append(store: &SqliteStore, exec: NewExecution) -> Recorded {
        store.record_execution(exec, |_| None).unwrap()
    }

    /// Flag the test case as flaky with run counts taken from the history it saw.
    fn counted_update(history: &[ExecutionRecord]) -> Option<FlakyTestUpdate> {
        let newest = history.first()?;
        let mut flagged = update(&newest.test_case_id, 50.0, None);
        flagged.total_runs = history.len() as u64;
        flagged.failed_runs = history.iter().filter(|e| e.is_failed()).count() as u64;
        Some(flagged)
    }

    #[test]
    fn test_record_returns_history_newest_first() {
        let (_dir, store) = temp_store();
        append(&store, new_execution("login", ExecutionStatus::Passed, 0));
        append(&store, new_execution("other", ExecutionStatus::Passed, 1));
        let recorded = append(&store, new_execution("login", ExecutionStatus::Failed, 2));

        assert!(recorded.execution.id.is_some());
        assert!(recorded.flaky_test.is_none());
        assert_eq!(recorded.history.len(), 2);
        assert_eq!(recorded.history[0], recorded.execution);
        assert_eq!(recorded.history[1].status, ExecutionStatus::Passed);
        assert_eq!(recorded.history[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(store.count_test_cases().unwrap(), 2);
        assert!(store.list_unresolved_flaky().unwrap().is_empty());
    }

    #[test]
    fn test_record_rejects_invalid() {
        let (_dir, store) = temp_store();
        let mut exec = new_execution("login", ExecutionStatus::Passed, 0);
        exec.dom_stability_score = Some(-3.0);
        assert!(matches!(
            store.record_execution(exec, counted_update),
            Err(FlakyError::InvalidExecution { .. })
        ));

        let mut exec = new_execution("login", ExecutionStatus::Passed, 0);
        exec.execution_time_ms = u64::MAX;
        assert!(matches!(
            store.record_execution(exec, counted_update),
            Err(FlakyError::InvalidExecution { field: "execution_time_ms", .. })
        ));
        assert!(store.executions_for("login").unwrap().is_empty());
    }

    #[test]
    fn test_record_writes_flaky_update_from_same_history() {
        let (_dir, store) = temp_store();
        append(&store, new_execution("login", ExecutionStatus::Passed, 0));
        let recorded = store
            .record_execution(new_execution("login", ExecutionStatus::Failed, 1), counted_update)
            .unwrap();

        let flaky = recorded.flaky_test.unwrap();
        assert_eq!(flaky.total_runs, 2);
        assert_eq!(flaky.failed_runs, 1);
        assert_eq!(store.flaky_by_id(flaky.id).unwrap(), Some(flaky));
    }

    #[test]
    fn test_upsert_keeps_one_record_per_test_case() {
        let (_dir, store) = temp_store();
        let conn = store.pool.get().unwrap();
        let failed_at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        let created = upsert_flaky(&conn, &update("login", 30.0, Some(failed_at))).unwrap();
        assert!(!created.is_resolved);
        assert_eq!(created.root_causes.len(), 1);

        let updated = upsert_flaky(&conn, &update("login", 44.0, None)).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.flakiness_score, 44.0);
        assert_eq!(updated.last_failed_at, Some(failed_at));
        assert_eq!(updated.detected_at, created.detected_at);

        assert_eq!(store.list_unresolved_flaky().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_hides_from_list() {
        let (_dir, store) = temp_store();
        let conn = store.pool.get().unwrap();
        let low = upsert_flaky(&conn, &update("a", 10.0, None)).unwrap();
        let high = upsert_flaky(&conn, &update("b", 80.0, None)).unwrap();
        drop(conn);

        let listed: Vec<_> = store.list_unresolved_flaky().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![high.id, low.id]);

        let resolved = store.mark_resolved(high.id).unwrap().unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(store.list_unresolved_flaky().unwrap().len(), 1);
        assert!(store.flaky_by_id(high.id).unwrap().unwrap().is_resolved);

        assert!(store.mark_resolved(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_records_are_serialized() {
        let (_dir, store) = temp_store();
        let threads = 8;

        for round in 1..=20u64 {
            let barrier = Arc::new(Barrier::new(threads));
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let store = store.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        store.record_execution(
                            new_execution("checkout", ExecutionStatus::Failed, 0),
                            counted_update,
                        )
                    })
                })
                .collect();

            let failures: Vec<String> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap().err().map(|e| e.to_string()))
                .collect();
            assert!(failures.is_empty(), "round {}: {:?}", round, failures);

            // the last writer saw every committed execution
            let flaky = store.list_unresolved_flaky().unwrap();
            assert_eq!(flaky.len(), 1);
            assert_eq!(flaky[0].total_runs, round * threads as u64);
        }
    }
}
