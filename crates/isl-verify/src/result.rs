//! Evidence, per-run results and the domain roll-up.

use std::fmt;
use std::time::Duration;

use isl_eval::Value;
use isl_trust::{CheckRecord, TrustVerdict, VerdictThresholds};
use serde::Serialize;
use smol_str::SmolStr;
use tracing::info;

use crate::Trace;

// ============================================================================
// Evidence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
    Precondition,
    Postcondition,
    Invariant,
}

impl CheckCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckCategory::Precondition => "precondition",
            CheckCategory::Postcondition => "postcondition",
            CheckCategory::Invariant => "invariant",
        }
    }
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one clause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckEvidence {
    pub category: CheckCategory,

    /// Clause text
    pub expression: String,

    pub passed: bool,

    /// Literal side of a failed equality or comparison
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,

    /// Observed side of a failed equality or comparison
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,

    /// Evaluation error or non-boolean result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration: Duration,
}

impl CheckEvidence {
    pub(crate) fn new(category: CheckCategory, expression: &str) -> Self {
        Self {
            category,
            expression: expression.to_string(),
            passed: false,
            expected: None,
            actual: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    fn to_record(&self, skipped: bool) -> CheckRecord {
        let name = self.expression.as_str();
        let category = self.category.as_str();
        if skipped {
            CheckRecord::skipped(name, category, "precondition not met")
        } else if self.passed {
            CheckRecord::passed(name, category, self.duration)
        } else {
            let reason = self
                .error
                .clone()
                .unwrap_or_else(|| "evaluated to false".to_string());
            CheckRecord::failed(name, category, reason, self.duration)
        }
    }
}

// ============================================================================
// Behavior Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorVerdict {
    Pass,
    Fail,
    Skipped,
    #[serde(rename = "timeout")]
    TimedOut,
    Errored,
}

impl fmt::Display for BehaviorVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BehaviorVerdict::Pass => "pass",
            BehaviorVerdict::Fail => "fail",
            BehaviorVerdict::Skipped => "skipped",
            BehaviorVerdict::TimedOut => "timeout",
            BehaviorVerdict::Errored => "errored",
        })
    }
}

/// Where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    SnapshotTaken,
    PreconditionsChecked,
    Skipped,
    Executing,
    PostconditionsChecked,
    InvariantsChecked,
    Scored,
    TimedOut,
    Errored,
}

/// Everything recorded about one behavior run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorVerificationResult {
    pub domain: SmolStr,
    pub behavior: SmolStr,
    pub scenario: SmolStr,
    pub input: Value,
    pub preconditions: Vec<CheckEvidence>,
    pub postconditions: Vec<CheckEvidence>,
    pub invariants: Vec<CheckEvidence>,

    /// All postconditions and invariants held
    pub success: bool,

    /// Weighted pass percentage in `[0, 100]`
    pub score: f64,

    pub verdict: BehaviorVerdict,
    pub phase: RunPhase,
    pub duration_ms: u64,

    /// Engine error or timeout message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Value returned by the implementation, or its failure envelope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    pub trace: Trace,
}

impl BehaviorVerificationResult {
    pub(crate) fn new(domain: &str, behavior: &str, scenario: &str, input: Value) -> Self {
        Self {
            domain: domain.into(),
            behavior: behavior.into(),
            scenario: scenario.into(),
            input,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            invariants: Vec::new(),
            success: false,
            score: 0.0,
            verdict: BehaviorVerdict::Errored,
            phase: RunPhase::Init,
            duration_ms: 0,
            error: None,
            result: None,
            trace: Trace::default(),
        }
    }

    /// Evidence in evaluation order.
    pub fn checks(&self) -> impl Iterator<Item = &CheckEvidence> {
        self.preconditions
            .iter()
            .chain(&self.postconditions)
            .chain(&self.invariants)
    }

    pub fn passed_checks(&self) -> usize {
        self.checks().filter(|c| c.passed).count()
    }

    pub fn failed_checks(&self) -> usize {
        self.checks().filter(|c| !c.passed).count()
    }

    /// Evidence as trust-calculator records. Checks of a skipped run are
    /// reported as skipped.
    pub fn check_records(&self) -> Vec<CheckRecord> {
        let skipped = self.verdict == BehaviorVerdict::Skipped;
        self.checks().map(|c| c.to_record(skipped)).collect()
    }
}

// ============================================================================
// Domain Summary
// ============================================================================

/// Aggregate over the runs of one domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainSummary {
    pub domain: SmolStr,
    pub total_behaviors: usize,
    pub passed_behaviors: usize,

    /// Includes timed-out and errored runs
    pub failed_behaviors: usize,

    pub skipped_behaviors: usize,
    pub errored_behaviors: usize,
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,

    /// Mean score of the counted runs
    pub score: f64,

    pub verdict: TrustVerdict,
}

/// Summarize with default thresholds, excluding skipped runs.
pub fn summarize(results: &[BehaviorVerificationResult]) -> DomainSummary {
    summarize_with(results, &VerdictThresholds::default(), false)
}

/// Summarize runs.
///
/// Skipped runs are left out of the score unless `skipped_as_failure` is
/// set, in which case they count as failed with a score of 0. Timed-out and
/// errored runs always count as failed.
pub fn summarize_with(
    results: &[BehaviorVerificationResult],
    thresholds: &VerdictThresholds,
    skipped_as_failure: bool,
) -> DomainSummary {
    let mut summary = DomainSummary {
        domain: results.first().map(|r| r.domain.clone()).unwrap_or_default(),
        total_behaviors: results.len(),
        passed_behaviors: 0,
        failed_behaviors: 0,
        skipped_behaviors: 0,
        errored_behaviors: 0,
        total_checks: 0,
        passed_checks: 0,
        failed_checks: 0,
        score: 0.0,
        verdict: TrustVerdict::Unsafe,
    };

    let mut score_sum = 0.0;
    let mut counted = 0usize;

    for result in results {
        summary.total_checks += result.checks().count();
        summary.passed_checks += result.passed_checks();
        summary.failed_checks += result.failed_checks();

        match result.verdict {
            BehaviorVerdict::Pass => summary.passed_behaviors += 1,
            BehaviorVerdict::Fail | BehaviorVerdict::TimedOut => summary.failed_behaviors += 1,
            BehaviorVerdict::Errored => {
                summary.errored_behaviors += 1;
                summary.failed_behaviors += 1;
            }
            BehaviorVerdict::Skipped => {
                summary.skipped_behaviors += 1;
                if !skipped_as_failure {
                    continue;
                }
                summary.failed_behaviors += 1;
                counted += 1;
                continue;
            }
        }
        score_sum += result.score;
        counted += 1;
    }

    if counted > 0 {
        summary.score = score_sum / counted as f64;
    }
    summary.verdict = thresholds.classify(summary.score, summary.failed_behaviors);

    info!(
        domain = %summary.domain,
        behaviors = summary.total_behaviors,
        passed = summary.passed_behaviors,
        failed = summary.failed_behaviors,
        skipped = summary.skipped_behaviors,
        score = summary.score,
        verdict = %summary.verdict,
        "domain summarized"
    );
    summary
}
