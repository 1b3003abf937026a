//! Flakiness verdict and score over an execution history.

use crate::flaky::root_cause::{
    self, Signals, DOM_STABILITY_THRESHOLD, NETWORK_CALL_THRESHOLD, TIMING_VARIANCE_THRESHOLD,
};
use crate::flaky::stats::DurationSeries;
use crate::flaky::{ExecutionRecord, FlakinessReport};
use tracing::debug;

/// Below this many executions no statistic is meaningful.
pub const MIN_SAMPLES: usize = 3;

/// DOM stability assumed when no run measured it.
const DEFAULT_DOM_STABILITY: f64 = 100.0;

const FAILURE_RATE_WEIGHT: f64 = 0.5;
const TIMING_VARIANCE_WEIGHT: f64 = 0.3;
const DOM_INSTABILITY_WEIGHT: f64 = 0.2;

/// Stateless analyzer. Cheap to construct and safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlakinessAnalyzer;

impl FlakinessAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, executions: &[ExecutionRecord]) -> FlakinessReport {
        if executions.len() < MIN_SAMPLES {
            return FlakinessReport::insufficient_data();
        }

        let total = executions.len();
        let failed: Vec<&ExecutionRecord> = executions.iter().filter(|e| e.is_failed()).collect();
        let failure_rate = failed.len() as f64 * 100.0 / total as f64;

        let durations = DurationSeries::from_millis(executions.iter().map(|e| e.execution_time_ms));
        let timing_variance = durations.coefficient_of_variation();
        let dom_stability = dom_stability(executions);

        let intermittent = !failed.is_empty() && failed.len() < total;
        let high_variance = timing_variance > TIMING_VARIANCE_THRESHOLD;
        let low_dom_stability = dom_stability < DOM_STABILITY_THRESHOLD;
        let is_flaky = intermittent && (high_variance || low_dom_stability);

        let flakiness_score = if is_flaky {
            (failure_rate * FAILURE_RATE_WEIGHT
                + timing_variance * TIMING_VARIANCE_WEIGHT
                + (100.0 - dom_stability) * DOM_INSTABILITY_WEIGHT)
                .clamp(0.0, 100.0)
                .round()
        } else {
            0.0
        };

        let signals = Signals {
            timing_variance,
            mean_execution_ms: durations.mean(),
            dom_stability,
            spread_ratio: durations.spread_ratio(),
            failed_with_wait_failures: failed
                .iter()
                .any(|e| e.wait_condition_failures.is_some_and(|n| n > 0)),
            failed_with_network_calls: failed
                .iter()
                .any(|e| e.network_call_count.is_some_and(|n| n > NETWORK_CALL_THRESHOLD)),
        };
        let root_causes = root_cause::rank(&signals);

        debug!(
            total,
            failed = failed.len(),
            failure_rate,
            timing_variance,
            dom_stability,
            is_flaky,
            flakiness_score,
            causes = root_causes.len(),
            "analyzed execution history"
        );

        FlakinessReport {
            is_flaky,
            flakiness_score,
            timing_variance,
            failure_rate,
            dom_stability,
            root_causes,
        }
    }
}

/// Analyze with the default analyzer.
pub fn analyze(executions: &[ExecutionRecord]) -> FlakinessReport {
    FlakinessAnalyzer::new().analyze(executions)
}

/// Mean of the measured DOM stability scores, or 100 when none were measured.
fn dom_stability(executions: &[ExecutionRecord]) -> f64 {
    let mut scores: Vec<f64> = executions.iter().filter_map(|e| e.dom_stability_score).collect();
    if scores.is_empty() {
        return DEFAULT_DOM_STABILITY;
    }
    scores.sort_by(f64::total_cmp);
    scores.iter().sum::<f64>() / scores.len() as f64
}
