//! Records executions and keeps flaky test verdicts current.
//!
//! Every appended execution triggers a full re-analysis of its test case once
//! enough history exists. Storage calls run on the blocking pool.

use crate::flaky::{
    DashboardStats, ExecutionRecord, FlakinessAnalyzer, FlakinessReport, FlakyError,
    FlakyTestRecord, FlakyTestUpdate, NewExecution,
};
use crate::storage::ExecutionStore;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executions required before the tracker asks the analyzer for a verdict.
pub const DEFAULT_MIN_EXECUTIONS: usize = 5;

/// What happened when an execution was recorded.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub execution: ExecutionRecord,
    /// `None` while the test case has fewer than `min_executions` runs.
    pub report: Option<FlakinessReport>,
    /// The created or updated record when the report was flaky.
    pub flaky_test: Option<FlakyTestRecord>,
}

#[derive(Clone)]
pub struct FlakinessTracker<S> {
    store: S,
    analyzer: FlakinessAnalyzer,
    min_executions: usize,
}

impl<S: ExecutionStore> FlakinessTracker<S> {
    pub fn new(store: S, min_executions: usize) -> Self {
        Self {
            store,
            analyzer: FlakinessAnalyzer::new(),
            min_executions,
        }
    }

    pub fn min_executions(&self) -> usize {
        self.min_executions
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, FlakyError>
    where
        F: FnOnce(S) -> Result<T, FlakyError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| FlakyError::Task(e.to_string()))?
    }

    /// Append an execution and re-analyse its test case. The append and the
    /// flaky upsert commit together, so the stored verdict always reflects the
    /// newest history.
    pub async fn record_execution(&self, execution: NewExecution) -> Result<RecordOutcome, FlakyError> {
        let analyzer = self.analyzer;
        let min_executions = self.min_executions;

        let outcome = self
            .blocking(move |store| {
                let mut report = None;
                let recorded = store.record_execution(execution, |history| {
                    if history.len() < min_executions {
                        return None;
                    }
                    let analyzed = analyzer.analyze(history);
                    let update = analyzed.is_flaky.then(|| flaky_update(&analyzed, history));
                    report = Some(analyzed);
                    update
                })?;
                debug!(
                    test_case_id = %recorded.execution.test_case_id,
                    status = %recorded.execution.status,
                    runs = recorded.history.len(),
                    "Execution recorded"
                );

                Ok(RecordOutcome {
                    execution: recorded.execution,
                    report,
                    flaky_test: recorded.flaky_test,
                })
            })
            .await?;

        if let Some(flaky) = &outcome.flaky_test {
            warn!(
                test_case_id = %flaky.test_case_id,
                score = flaky.flakiness_score,
                failed_runs = flaky.failed_runs,
                total_runs = flaky.total_runs,
                top_cause = flaky.root_causes.first().map(|c| c.kind.as_str()).unwrap_or("none"),
                "Flaky test detected"
            );
        }

        Ok(outcome)
    }

    /// Analyse the full stored history on demand, regardless of `min_executions`.
    pub async fn analysis_for(&self, test_case_id: &str) -> Result<FlakinessReport, FlakyError> {
        let analyzer = self.analyzer;
        let test_case_id = test_case_id.to_string();
        self.blocking(move |store| {
            let history = store.executions_for(&test_case_id)?;
            Ok(analyzer.analyze(&history))
        })
        .await
    }

    pub async fn executions_for(&self, test_case_id: &str) -> Result<Vec<ExecutionRecord>, FlakyError> {
        let test_case_id = test_case_id.to_string();
        self.blocking(move |store| store.executions_for(&test_case_id)).await
    }

    pub async fn list_flaky(&self) -> Result<Vec<FlakyTestRecord>, FlakyError> {
        self.blocking(|store| store.list_unresolved_flaky()).await
    }

    pub async fn get_flaky(&self, id: Uuid) -> Result<FlakyTestRecord, FlakyError> {
        self.blocking(move |store| store.flaky_by_id(id))
            .await?
            .ok_or_else(|| FlakyError::NotFound(format!("flaky test {}", id)))
    }

    pub async fn resolve(&self, id: Uuid) -> Result<FlakyTestRecord, FlakyError> {
        let record = self
            .blocking(move |store| store.mark_resolved(id))
            .await?
            .ok_or_else(|| FlakyError::NotFound(format!("flaky test {}", id)))?;
        info!(id = %record.id, test_case_id = %record.test_case_id, "Flaky test marked resolved");
        Ok(record)
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, FlakyError> {
        self.blocking(|store| {
            let total_tests = store.count_test_cases()?;
            let flaky_test_count = store.list_unresolved_flaky()?.len() as u64;
            Ok(DashboardStats::new(total_tests, flaky_test_count))
        })
        .await
    }
}

/// Flaky record fields for a history (newest first) judged flaky.
fn flaky_update(report: &FlakinessReport, history: &[ExecutionRecord]) -> FlakyTestUpdate {
    let newest = history.first();
    FlakyTestUpdate {
        test_case_id: newest.map(|e| e.test_case_id.clone()).unwrap_or_default(),
        report: report.clone(),
        total_runs: history.len() as u64,
        failed_runs: history.iter().filter(|e| e.is_failed()).count() as u64,
        last_failed_at: newest.filter(|e| e.is_failed()).map(|e| e.executed_at),
    }
}
