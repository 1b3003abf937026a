//! In-memory store for ephemeral runs and tests. Nothing survives a restart.

use crate::flaky::{ExecutionRecord, FlakyError, FlakyTestRecord, FlakyTestUpdate, NewExecution};
use crate::storage::{ExecutionStore, Recorded};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    next_execution_id: i64,
    executions: Vec<ExecutionRecord>,
    flaky_tests: HashMap<Uuid, FlakyTestRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No mutation can panic halfway, so a poisoned lock still holds consistent state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn history(&self, test_case_id: &str) -> Vec<ExecutionRecord> {
        let mut history: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|e| e.test_case_id == test_case_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.executed_at.cmp(&a.executed_at).then(b.id.cmp(&a.id)));
        history
    }

    fn by_test_case(&self, test_case_id: &str) -> Option<&FlakyTestRecord> {
        self.flaky_tests.values().find(|f| f.test_case_id == test_case_id)
    }

    fn upsert_flaky(&mut self, update: &FlakyTestUpdate) -> FlakyTestRecord {
        let report = &update.report;

        let record = match self.by_test_case(&update.test_case_id).cloned() {
            Some(existing) => FlakyTestRecord {
                flakiness_score: report.flakiness_score,
                timing_variance: report.timing_variance,
                failure_rate: report.failure_rate,
                total_runs: update.total_runs,
                failed_runs: update.failed_runs,
                root_causes: report.root_causes.clone(),
                last_failed_at: update.last_failed_at.or(existing.last_failed_at),
                ..existing
            },
            None => FlakyTestRecord {
                id: Uuid::new_v4(),
                test_case_id: update.test_case_id.clone(),
                flakiness_score: report.flakiness_score,
                timing_variance: report.timing_variance,
                failure_rate: report.failure_rate,
                total_runs: update.total_runs,
                failed_runs: update.failed_runs,
                root_causes: report.root_causes.clone(),
                last_failed_at: update.last_failed_at,
                is_resolved: false,
                detected_at: Utc::now(),
            },
        };

        self.flaky_tests.insert(record.id, record.clone());
        record
    }
}

impl ExecutionStore for MemoryStore {
    fn record_execution<F>(&self, execution: NewExecution, assess: F) -> Result<Recorded, FlakyError>
    where
        F: FnOnce(&[ExecutionRecord]) -> Option<FlakyTestUpdate>,
    {
        execution.validate()?;
        let mut inner = self.lock();
        inner.next_execution_id += 1;
        let record = execution.into_record(Some(inner.next_execution_id));
        inner.executions.push(record.clone());
        let history = inner.history(&record.test_case_id);
        let flaky_test = assess(&history).map(|update| inner.upsert_flaky(&update));
        Ok(Recorded {
            execution: record,
            history,
            flaky_test,
        })
    }

    fn executions_for(&self, test_case_id: &str) -> Result<Vec<ExecutionRecord>, FlakyError> {
        Ok(self.lock().history(test_case_id))
    }

    fn count_test_cases(&self) -> Result<u64, FlakyError> {
        let inner = self.lock();
        let mut ids: Vec<&str> = inner.executions.iter().map(|e| e.test_case_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids.len() as u64)
    }

    fn flaky_by_id(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError> {
        Ok(self.lock().flaky_tests.get(&id).cloned())
    }

    fn list_unresolved_flaky(&self) -> Result<Vec<FlakyTestRecord>, FlakyError> {
        let inner = self.lock();
        let mut records: Vec<FlakyTestRecord> = inner
            .flaky_tests
            .values()
            .filter(|f| !f.is_resolved)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.flakiness_score
                .total_cmp(&a.flakiness_score)
                .then(a.detected_at.cmp(&b.detected_at))
        });
        Ok(records)
    }

    fn mark_resolved(&self, id: Uuid) -> Result<Option<FlakyTestRecord>, FlakyError> {
        let mut inner = self.lock();
        Ok(inner.flaky_tests.get_mut(&id).map(|record| {
            record.is_resolved = true;
            record.clone()
        }))
    }
}
