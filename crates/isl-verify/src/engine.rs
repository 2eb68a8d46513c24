//! The verification engine.
//!
//! One behavior run walks the phases of [`RunPhase`]: snapshot,
//! preconditions, execution, postconditions, invariants, scoring. The store
//! lock is held for the whole run, so concurrent runs on one engine
//! serialize and never see each other's snapshots or rollbacks.
//!
//! A check that fails to evaluate is recorded as a failed check, unless the
//! failure came from the store: then no score is meaningful and the run
//! ends `errored`, rolled back when `restore_on_abort` is set.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use isl_eval::{
    EntityStore, EvaluationContext, EvaluationError, Evaluator, StateHandle, StoreError, Value,
};
use isl_ir::IrKind;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::result::summarize_with;
use crate::{
    BehaviorVerdict, BehaviorVerificationResult, CheckCategory, CheckEvidence, Clause, Domain,
    DomainSummary, PlannedRun, Result, RunPhase, Scenario, TraceRecorder, VerifierConfig,
    VerifyError,
};

/// Source of timestamps for `now()` and trace events.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A domain-level failure returned by an implementation.
///
/// It becomes the result value `{success: false, error: {code, message}}`,
/// so postconditions can inspect `result.error.code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BehaviorFailure {
    pub code: SmolStr,
    pub message: String,
}

impl BehaviorFailure {
    pub fn new(code: impl Into<SmolStr>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    fn to_value(&self) -> Value {
        Value::map([
            ("success", Value::Bool(false)),
            (
                "error",
                Value::map([
                    ("code", Value::String(self.code.clone())),
                    ("message", Value::from(self.message.as_str())),
                ]),
            ),
        ])
    }
}

/// The code under test.
#[async_trait]
pub trait BehaviorImplementation: Send + Sync {
    async fn execute(
        &self,
        input: &Value,
        store: &mut dyn EntityStore,
    ) -> std::result::Result<Value, BehaviorFailure>;
}

/// Maps successful results to their evaluated form. Maps without a
/// `success` field gain `success: true`.
fn success_value(value: Value) -> Value {
    match value {
        Value::Map(mut fields) => {
            if !fields.contains_key("success") {
                fields.shift_insert(0, "success".into(), Value::Bool(true));
            }
            Value::Map(fields)
        }
        other => other,
    }
}

/// Runs behaviors against their contracts.
pub struct VerificationEngine<S> {
    store: Arc<Mutex<S>>,
    config: VerifierConfig,
    evaluator: Evaluator,
    clock: Clock,
}

impl<S: EntityStore + 'static> VerificationEngine<S> {
    /// Create an engine owning `store`. Fails if the configuration is invalid.
    pub fn new(store: S, config: VerifierConfig) -> Result<Self> {
        config.validate()?;
        let evaluator = Evaluator::new().with_max_depth(config.max_eval_depth);
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            config,
            evaluator,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the wall clock, e.g. with a fixed instant in tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Shared handle on the store, for seeding and inspection between runs.
    pub fn store(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Access the evaluator to register domain-specific builtins.
    pub fn evaluator_mut(&mut self) -> &mut Evaluator {
        &mut self.evaluator
    }

    // ========================================================================
    // Behavior Runs
    // ========================================================================

    /// Verify one behavior against one scenario.
    ///
    /// Never fails: engine errors are recorded on the returned result with
    /// the `errored` verdict.
    #[instrument(skip(self, domain, implementation, scenario), fields(domain = %domain.name, scenario = %scenario.name))]
    pub async fn verify_behavior(
        &self,
        domain: &Domain,
        behavior: &str,
        implementation: &dyn BehaviorImplementation,
        scenario: &Scenario,
    ) -> BehaviorVerificationResult {
        let started = Instant::now();
        let mut result =
            BehaviorVerificationResult::new(&domain.name, behavior, &scenario.name, scenario.input.clone());
        let mut trace = TraceRecorder::new(Arc::clone(&self.clock), self.config.redact_traces);

        let Some(spec) = domain.behavior(behavior) else {
            let err = VerifyError::UnknownBehavior {
                name: behavior.into(),
            };
            return self.abort(result, trace, err, started);
        };

        info!("verifying behavior");
        let mut store = self.store.lock().await;

        let snapshot = match store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => return self.abort(result, trace, e.into(), started),
        };
        trace.snapshot(&snapshot);
        result.phase = RunPhase::SnapshotTaken;
        debug!(version = snapshot.version(), "snapshot taken");

        // Preconditions see the input and the live store only.
        let checked = {
            let ctx = EvaluationContext::new(&*store)
                .with_input(scenario.input.clone())
                .with_now((self.clock)());
            self.run_checks(
                CheckCategory::Precondition,
                &spec.preconditions,
                &ctx,
                &mut result.preconditions,
                &mut trace,
            )
        };
        if let Err(e) = checked {
            return self.abort(result, trace, e.into(), started);
        }
        result.phase = RunPhase::PreconditionsChecked;

        if let Some(failed) = result.preconditions.iter().find(|c| !c.passed) {
            warn!(precondition = %failed.expression, "precondition not met, skipping behavior");
            result.phase = RunPhase::Skipped;
            result.verdict = BehaviorVerdict::Skipped;
            return self.finish(result, trace, started);
        }

        result.phase = RunPhase::Executing;
        trace.call(&spec.name, &scenario.input);
        let call_started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeout(),
            implementation.execute(&scenario.input, &mut *store),
        )
        .await;
        let elapsed_ms = call_started.elapsed().as_millis() as u64;

        let (value, error_code) = match outcome {
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "implementation timed out");
                trace.timeout(self.config.timeout_ms);
                result.phase = RunPhase::TimedOut;
                result.verdict = BehaviorVerdict::TimedOut;
                result.error = Some(VerifyError::Timeout(self.config.timeout()).to_string());
                if self.config.restore_on_abort {
                    if let Err(e) = self.rollback(&mut *store, &snapshot, &mut trace) {
                        return self.abort(result, trace, e, started);
                    }
                }
                return self.finish(result, trace, started);
            }
            Ok(Ok(value)) => {
                let value = success_value(value);
                trace.returned(&value, elapsed_ms);
                (value, None)
            }
            Ok(Err(failure)) => {
                debug!(code = %failure.code, "implementation returned failure");
                trace.failure(&failure.code, &failure.message);
                (failure.to_value(), Some(failure.code))
            }
        };
        let succeeded = error_code.is_none();
        result.result = Some(value.clone());

        let after = match store.snapshot() {
            Ok(after) => after,
            Err(e) => {
                return self.abort_executed(&mut *store, &snapshot, result, trace, e.into(), started);
            }
        };
        for change in snapshot.diff(&after) {
            trace.state_change(&spec.name, &change);
        }

        // Postconditions and invariants see everything.
        let checked = {
            let ctx = EvaluationContext::new(&*store)
                .with_input(scenario.input.clone())
                .with_result(value)
                .with_snapshot(&snapshot)
                .with_now((self.clock)());
            let postconditions = spec
                .postconditions
                .iter()
                .filter(|post| post.guard.applies(succeeded, error_code.as_deref()))
                .map(|post| &post.clause);

            self.run_checks(
                CheckCategory::Postcondition,
                postconditions,
                &ctx,
                &mut result.postconditions,
                &mut trace,
            )
            .and_then(|()| {
                result.phase = RunPhase::PostconditionsChecked;
                self.run_checks(
                    CheckCategory::Invariant,
                    spec.invariants.iter().chain(&domain.invariants),
                    &ctx,
                    &mut result.invariants,
                    &mut trace,
                )
            })
        };
        if let Err(e) = checked {
            return self.abort_executed(&mut *store, &snapshot, result, trace, e.into(), started);
        }
        result.phase = RunPhase::InvariantsChecked;

        if self.config.isolate_runs {
            if let Err(e) = self.rollback(&mut *store, &snapshot, &mut trace) {
                return self.abort(result, trace, e, started);
            }
        }
        drop(store);

        result.success = result
            .postconditions
            .iter()
            .chain(&result.invariants)
            .all(|c| c.passed);
        result.score = self.score(&result);
        result.verdict = if result.success {
            BehaviorVerdict::Pass
        } else {
            BehaviorVerdict::Fail
        };
        result.phase = RunPhase::Scored;
        self.finish(result, trace, started)
    }

    /// Verify a sequence of runs in order and summarize them.
    ///
    /// Runs whose behavior is excluded by the configured filter are not
    /// executed. With `fail_fast`, the first failing run ends the sequence.
    #[instrument(skip_all, fields(domain = %domain.name, runs = runs.len()))]
    pub async fn verify_domain(
        &self,
        domain: &Domain,
        implementations: &IndexMap<SmolStr, Arc<dyn BehaviorImplementation>>,
        runs: &[PlannedRun],
    ) -> (Vec<BehaviorVerificationResult>, DomainSummary) {
        let mut results = Vec::with_capacity(runs.len());

        for run in runs {
            if !self.config.filter.matches(&run.behavior) {
                debug!(behavior = %run.behavior, "filtered out");
                continue;
            }

            let result = match implementations.get(&run.behavior) {
                Some(implementation) => {
                    self.verify_behavior(domain, &run.behavior, implementation.as_ref(), &run.scenario)
                        .await
                }
                None => {
                    let result = BehaviorVerificationResult::new(
                        &domain.name,
                        &run.behavior,
                        &run.scenario.name,
                        run.scenario.input.clone(),
                    );
                    let trace =
                        TraceRecorder::new(Arc::clone(&self.clock), self.config.redact_traces);
                    let err = VerifyError::MissingImplementation {
                        name: run.behavior.clone(),
                    };
                    self.abort(result, trace, err, Instant::now())
                }
            };

            let stop = self.config.fail_fast && self.is_failure(result.verdict);
            results.push(result);
            if stop {
                info!(behavior = %run.behavior, "stopping after first failure");
                break;
            }
        }

        let summary = summarize_with(
            &results,
            &self.config.thresholds,
            self.config.treat_skipped_as_failure,
        );
        (results, summary)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn is_failure(&self, verdict: BehaviorVerdict) -> bool {
        match verdict {
            BehaviorVerdict::Pass => false,
            BehaviorVerdict::Skipped => self.config.treat_skipped_as_failure,
            BehaviorVerdict::Fail | BehaviorVerdict::TimedOut | BehaviorVerdict::Errored => true,
        }
    }

    /// Evaluate `clauses` in order, recording evidence and trace events.
    /// Stops at the first store failure.
    fn run_checks<'c>(
        &self,
        category: CheckCategory,
        clauses: impl IntoIterator<Item = &'c Clause>,
        ctx: &EvaluationContext<'_>,
        evidence: &mut Vec<CheckEvidence>,
        trace: &mut TraceRecorder,
    ) -> std::result::Result<(), StoreError> {
        for clause in clauses {
            let checked = self.check(category, clause, ctx)?;
            trace.check(checked.category, &checked.expression, checked.passed);
            evidence.push(checked);
        }
        Ok(())
    }

    /// Evaluate one clause. Evaluation errors become part of the evidence,
    /// except store failures, which are returned.
    fn check(
        &self,
        category: CheckCategory,
        clause: &Clause,
        ctx: &EvaluationContext<'_>,
    ) -> std::result::Result<CheckEvidence, StoreError> {
        let started = Instant::now();
        let mut evidence = CheckEvidence::new(category, &clause.source);

        match self.evaluator.evaluate_condition(&clause.expr, ctx) {
            Ok(true) => evidence.passed = true,
            Ok(false) => {
                if let Some((actual, expected)) = self.explain(clause, ctx) {
                    evidence.actual = Some(actual);
                    evidence.expected = Some(expected);
                }
            }
            Err(EvaluationError::Store(e)) => {
                warn!(%category, expression = %clause.source, error = %e, "store failed during check");
                return Err(e);
            }
            Err(e) => evidence.error = Some(e.to_string()),
        }

        evidence.duration = started.elapsed();
        debug!(
            %category,
            expression = %clause.source,
            passed = evidence.passed,
            "check evaluated"
        );
        Ok(evidence)
    }

    /// Observed and expected values of a failed top-level comparison. The
    /// literal side, when there is one, is the expected value.
    fn explain(&self, clause: &Clause, ctx: &EvaluationContext<'_>) -> Option<(Value, Value)> {
        let (left, right) = match &clause.expr.kind {
            IrKind::Equality { left, right, .. } | IrKind::Comparison { left, right, .. } => {
                (left, right)
            }
            _ => return None,
        };
        let (observed, reference) = if left.is_literal() && !right.is_literal() {
            (right, left)
        } else {
            (left, right)
        };
        let actual = self.evaluator.evaluate(observed, ctx).ok()?;
        let expected = self.evaluator.evaluate(reference, ctx).ok()?;
        Some((actual, expected))
    }

    /// Weighted share of passing checks. A run without checks scores 100.
    fn score(&self, result: &BehaviorVerificationResult) -> f64 {
        let weights = &self.config.weights;
        let mut earned = 0.0;
        let mut possible = 0.0;
        for check in result.checks() {
            let weight = match check.category {
                CheckCategory::Precondition => weights.precondition,
                CheckCategory::Postcondition => weights.postcondition,
                CheckCategory::Invariant => weights.invariant,
            };
            possible += weight;
            if check.passed {
                earned += weight;
            }
        }
        if possible > 0.0 {
            earned * 100.0 / possible
        } else {
            100.0
        }
    }

    fn rollback(
        &self,
        store: &mut S,
        snapshot: &StateHandle,
        trace: &mut TraceRecorder,
    ) -> Result<()> {
        store.restore(snapshot)?;
        trace.restore(snapshot.version());
        debug!(version = snapshot.version(), "store restored");
        Ok(())
    }

    /// Abort a run whose implementation already executed, rolling back its
    /// writes when `restore_on_abort` is set.
    fn abort_executed(
        &self,
        store: &mut S,
        snapshot: &StateHandle,
        result: BehaviorVerificationResult,
        mut trace: TraceRecorder,
        err: VerifyError,
        started: Instant,
    ) -> BehaviorVerificationResult {
        if self.config.restore_on_abort {
            if let Err(restore_err) = self.rollback(store, snapshot, &mut trace) {
                warn!(error = %restore_err, "restore after store failure failed");
            }
        }
        self.abort(result, trace, err, started)
    }

    fn abort(
        &self,
        mut result: BehaviorVerificationResult,
        trace: TraceRecorder,
        err: VerifyError,
        started: Instant,
    ) -> BehaviorVerificationResult {
        warn!(behavior = %result.behavior, error = %err, "behavior run errored");
        result.phase = RunPhase::Errored;
        result.verdict = BehaviorVerdict::Errored;
        result.success = false;
        result.score = 0.0;
        result.error = Some(err.to_string());
        self.finish(result, trace, started)
    }

    fn finish(
        &self,
        mut result: BehaviorVerificationResult,
        trace: TraceRecorder,
        started: Instant,
    ) -> BehaviorVerificationResult {
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.trace = trace.finish(
            result.verdict == BehaviorVerdict::Pass,
            result.duration_ms,
        );
        info!(
            behavior = %result.behavior,
            verdict = %result.verdict,
            score = result.score,
            duration_ms = result.duration_ms,
            "behavior verified"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failure_envelope() {
        let value = BehaviorFailure::new("NOT_FOUND", "no such user").to_value();
        assert_eq!(value.get("success"), Some(&Value::Bool(false)));
        let error = value.get("error").unwrap();
        assert_eq!(error.get("code"), Some(&Value::from("NOT_FOUND")));
    }

    #[test]
    fn test_success_injection() {
        let value = success_value(Value::map([("token", Value::from("t"))]));
        assert_eq!(value.get("success"), Some(&Value::Bool(true)));

        let explicit = success_value(Value::map([("success", Value::Bool(false))]));
        assert_eq!(explicit.get("success"), Some(&Value::Bool(false)));

        assert_eq!(success_value(Value::Int(3)), Value::Int(3));
    }
}
