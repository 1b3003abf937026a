//! Root-cause hypotheses for flaky tests.
//!
//! Every kind is evaluated independently against the same [`Signals`]; a test
//! can match several at once. Hypotheses are ranked by confidence with ties
//! kept in declaration order (timing, dom, resource, concurrency).

use serde::{Deserialize, Serialize};

/// Timing variance (CV %) above which timing is suspected.
pub const TIMING_VARIANCE_THRESHOLD: f64 = 30.0;
/// Timing variance above which a wide duration spread points at contention.
pub const CONCURRENCY_VARIANCE_THRESHOLD: f64 = 40.0;
/// Average DOM stability below which locators are suspected.
pub const DOM_STABILITY_THRESHOLD: f64 = 70.0;
/// Network calls in a failed run above which external dependencies are suspected.
pub const NETWORK_CALL_THRESHOLD: u32 = 5;
/// Slowest/fastest duration ratio above which runs are considered spread out.
pub const SPREAD_RATIO_THRESHOLD: f64 = 2.0;

const TIMING_CONFIDENCE_CAP: f64 = 95.0;
const TIMING_CONFIDENCE_FACTOR: f64 = 1.5;
const RESOURCE_CONFIDENCE: f64 = 65.0;
const CONCURRENCY_CONFIDENCE_CAP: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootCauseKind {
    Timing,
    Dom,
    Resource,
    Concurrency,
}

impl RootCauseKind {
    /// All kinds, in tie-break order.
    pub const ALL: [RootCauseKind; 4] = [
        RootCauseKind::Timing,
        RootCauseKind::Dom,
        RootCauseKind::Resource,
        RootCauseKind::Concurrency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RootCauseKind::Timing => "timing",
            RootCauseKind::Dom => "dom",
            RootCauseKind::Resource => "resource",
            RootCauseKind::Concurrency => "concurrency",
        }
    }

    /// Build this hypothesis if its trigger holds for `signals`.
    pub fn evaluate(self, signals: &Signals) -> Option<RootCauseHypothesis> {
        match self {
            RootCauseKind::Timing => {
                if signals.timing_variance <= TIMING_VARIANCE_THRESHOLD {
                    return None;
                }
                let confidence = (signals.timing_variance * TIMING_CONFIDENCE_FACTOR)
                    .min(TIMING_CONFIDENCE_CAP)
                    .round();
                let description = if signals.failed_with_wait_failures {
                    format!(
                        "High timing variance ({}%) together with wait condition failures. \
                         Runs average {}ms and fluctuate significantly around it.",
                        signals.timing_variance.round(),
                        signals.mean_execution_ms.round()
                    )
                } else {
                    format!(
                        "High timing variance ({}%) points to inconsistent async operations or network delays.",
                        signals.timing_variance.round()
                    )
                };
                Some(RootCauseHypothesis::new(self, confidence, description))
            }
            RootCauseKind::Dom => {
                if signals.dom_stability >= DOM_STABILITY_THRESHOLD {
                    return None;
                }
                let confidence = (100.0 - signals.dom_stability).round();
                let description = format!(
                    "Low DOM stability ({}%) suggests inconsistent element locators or a page structure that changes dynamically.",
                    signals.dom_stability.round()
                );
                Some(RootCauseHypothesis::new(self, confidence, description))
            }
            RootCauseKind::Resource => {
                if !signals.failed_with_network_calls {
                    return None;
                }
                Some(RootCauseHypothesis::new(
                    self,
                    RESOURCE_CONFIDENCE,
                    format!(
                        "Failed runs made more than {} network calls, indicating a dependency on external APIs.",
                        NETWORK_CALL_THRESHOLD
                    ),
                ))
            }
            RootCauseKind::Concurrency => {
                let spread = signals.spread_ratio?;
                if spread <= SPREAD_RATIO_THRESHOLD
                    || signals.timing_variance <= CONCURRENCY_VARIANCE_THRESHOLD
                {
                    return None;
                }
                let confidence = signals
                    .timing_variance
                    .min(CONCURRENCY_CONFIDENCE_CAP)
                    .round();
                Some(RootCauseHypothesis::new(
                    self,
                    confidence,
                    format!(
                        "Slowest run took {:.1}x the fastest, suggesting race conditions or resource contention.",
                        spread
                    ),
                ))
            }
        }
    }
}

impl std::fmt::Display for RootCauseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One candidate explanation for a flaky test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseHypothesis {
    pub kind: RootCauseKind,
    pub confidence: f64,
    pub description: String,
}

impl RootCauseHypothesis {
    pub fn new(kind: RootCauseKind, confidence: f64, description: String) -> Self {
        Self {
            kind,
            confidence: confidence.clamp(0.0, 100.0),
            description,
        }
    }
}

/// Aggregates over an execution history that the hypotheses are judged on.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub timing_variance: f64,
    pub mean_execution_ms: f64,
    pub dom_stability: f64,
    /// `None` when the fastest run took 0ms.
    pub spread_ratio: Option<f64>,
    pub failed_with_wait_failures: bool,
    pub failed_with_network_calls: bool,
}

/// Evaluate every kind and rank the matches by descending confidence.
pub fn rank(signals: &Signals) -> Vec<RootCauseHypothesis> {
    let mut causes: Vec<RootCauseHypothesis> = RootCauseKind::ALL
        .iter()
        .filter_map(|kind| kind.evaluate(signals))
        .collect();
    // sort_by is stable, so equal confidences keep ALL order
    causes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    causes
}
