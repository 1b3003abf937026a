//! Flaky test detection -- execution records, flakiness reports, root-cause ranking.

pub mod analyzer;
pub mod root_cause;
pub mod stats;

pub use self::analyzer::{analyze, FlakinessAnalyzer, MIN_SAMPLES};
pub use self::root_cause::{RootCauseHypothesis, RootCauseKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlakyError {
    #[error("invalid execution: {field} {reason}")]
    InvalidExecution { field: &'static str, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Outcome of a single test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Passed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = FlakyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passed" | "pass" => Ok(ExecutionStatus::Passed),
            "failed" | "fail" => Ok(ExecutionStatus::Failed),
            other => Err(FlakyError::InvalidExecution {
                field: "status",
                reason: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// One completed run of a test case. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub test_case_id: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub dom_stability_score: Option<f64>,
    #[serde(default)]
    pub wait_condition_failures: Option<u32>,
    #[serde(default)]
    pub network_call_count: Option<u32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default = "Utc::now")]
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    /// Same checks as [`NewExecution::validate`], for histories supplied by callers.
    pub fn validate(&self) -> Result<(), FlakyError> {
        check_fields(&self.test_case_id, self.execution_time_ms, self.dom_stability_score)
    }
}

/// Largest duration the store can hold (SQLite integers are signed 64-bit).
pub const MAX_EXECUTION_TIME_MS: u64 = i64::MAX as u64;

fn check_fields(
    test_case_id: &str,
    execution_time_ms: u64,
    dom_stability_score: Option<f64>,
) -> Result<(), FlakyError> {
    if test_case_id.trim().is_empty() {
        return Err(FlakyError::InvalidExecution {
            field: "test_case_id",
            reason: "must not be empty".to_string(),
        });
    }
    if execution_time_ms > MAX_EXECUTION_TIME_MS {
        return Err(FlakyError::InvalidExecution {
            field: "execution_time_ms",
            reason: format!("must be at most {}, got {}", MAX_EXECUTION_TIME_MS, execution_time_ms),
        });
    }
    if let Some(score) = dom_stability_score {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(FlakyError::InvalidExecution {
                field: "dom_stability_score",
                reason: format!("must be within 0..=100, got {}", score),
            });
        }
    }
    Ok(())
}

/// An execution as submitted by a test runner, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub test_case_id: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub dom_stability_score: Option<f64>,
    #[serde(default)]
    pub wait_condition_failures: Option<u32>,
    #[serde(default)]
    pub network_call_count: Option<u32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

impl NewExecution {
    /// Reject records the analyzer cannot reason about.
    pub fn validate(&self) -> Result<(), FlakyError> {
        check_fields(&self.test_case_id, self.execution_time_ms, self.dom_stability_score)
    }

    /// Materialize into a record. `executed_at` defaults to now.
    pub fn into_record(self, id: Option<i64>) -> ExecutionRecord {
        ExecutionRecord {
            id,
            test_case_id: self.test_case_id,
            status: self.status,
            execution_time_ms: self.execution_time_ms,
            dom_stability_score: self.dom_stability_score,
            wait_condition_failures: self.wait_condition_failures,
            network_call_count: self.network_call_count,
            error_message: self.error_message,
            executed_at: self.executed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Result of analysing the execution history of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakinessReport {
    pub is_flaky: bool,
    pub flakiness_score: f64,
    pub timing_variance: f64,
    pub failure_rate: f64,
    pub dom_stability: f64,
    pub root_causes: Vec<RootCauseHypothesis>,
}

impl FlakinessReport {
    /// Report returned when there is too little history to judge.
    pub fn insufficient_data() -> Self {
        Self {
            is_flaky: false,
            flakiness_score: 0.0,
            timing_variance: 0.0,
            failure_rate: 0.0,
            dom_stability: 0.0,
            root_causes: Vec::new(),
        }
    }
}

/// Persisted verdict for a test case that was detected as flaky.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyTestRecord {
    pub id: uuid::Uuid,
    pub test_case_id: String,
    pub flakiness_score: f64,
    pub timing_variance: f64,
    pub failure_rate: f64,
    pub total_runs: u64,
    pub failed_runs: u64,
    pub root_causes: Vec<RootCauseHypothesis>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub is_resolved: bool,
    pub detected_at: DateTime<Utc>,
}

/// Fields written on every create-or-update of a flaky test record.
#[derive(Debug, Clone)]
pub struct FlakyTestUpdate {
    pub test_case_id: String,
    pub report: FlakinessReport,
    pub total_runs: u64,
    pub failed_runs: u64,
    /// `Some` only when the newest execution failed; `None` keeps the stored value.
    pub last_failed_at: Option<DateTime<Utc>>,
}

/// Aggregate numbers for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_tests: u64,
    pub flaky_test_count: u64,
    pub flaky_percentage: f64,
}

impl DashboardStats {
    pub fn new(total_tests: u64, flaky_test_count: u64) -> Self {
        let flaky_percentage = if total_tests > 0 {
            let pct = flaky_test_count as f64 / total_tests as f64 * 100.0;
            (pct * 10.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            total_tests,
            flaky_test_count,
            flaky_percentage,
        }
    }
}
