//! Configuration for the verification engine.

use std::time::Duration;

use isl_eval::DEFAULT_MAX_DEPTH;
use isl_trust::VerdictThresholds;
use serde::{Deserialize, Serialize};

use crate::{Result, VerifyError};

/// Per-category weights used when scoring a single behavior run.
///
/// All categories weigh 1.0 by default, so the score is the plain share of
/// passing checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub precondition: f64,
    pub postcondition: f64,
    pub invariant: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            precondition: 1.0,
            postcondition: 1.0,
            invariant: 1.0,
        }
    }
}

impl ScoreWeights {
    fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("precondition", self.precondition),
            ("postcondition", self.postcondition),
            ("invariant", self.invariant),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(VerifyError::Config(format!(
                    "weight for {} must be finite and non-negative, got {}",
                    name, weight
                )));
            }
        }
        // Scored runs passed every precondition, so these weights decide the score.
        if self.postcondition + self.invariant == 0.0 {
            return Err(VerifyError::Config(
                "postcondition and invariant weights cannot both be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Selects which behaviors a domain run verifies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorFilter {
    /// Name patterns to include (`*` wildcards at either end); empty means all
    pub include: Vec<String>,

    /// Name patterns to exclude
    pub exclude: Vec<String>,
}

impl BehaviorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Check whether a behavior name passes the filter
    pub fn matches(&self, behavior: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| pattern_matches(p, behavior)) {
            return false;
        }
        !self.exclude.iter().any(|p| pattern_matches(p, behavior))
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(_), Some(_)) => text.contains(&pattern[1..pattern.len() - 1]),
        (Some(suffix), None) => text.ends_with(suffix),
        (None, Some(prefix)) => text.starts_with(prefix),
        (None, None) => pattern == text,
    }
}

/// Configuration for [`crate::VerificationEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Time allowed for one implementation call, in milliseconds
    pub timeout_ms: u64,

    /// Roll the store back to the snapshot when a run times out
    pub restore_on_abort: bool,

    /// Roll the store back after every run so runs cannot observe each other
    pub isolate_runs: bool,

    /// Stop a domain run at the first failing behavior
    pub fail_fast: bool,

    /// Count skipped behaviors as failures in the domain summary
    pub treat_skipped_as_failure: bool,

    /// Maximum expression nesting the evaluator accepts
    pub max_eval_depth: usize,

    /// Mask secrets and personal data in recorded traces
    pub redact_traces: bool,

    pub weights: ScoreWeights,

    pub thresholds: VerdictThresholds,

    pub filter: BehaviorFilter,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            restore_on_abort: true,
            isolate_runs: false,
            fail_fast: false,
            treat_skipped_as_failure: false,
            max_eval_depth: DEFAULT_MAX_DEPTH,
            redact_traces: true,
            weights: ScoreWeights::default(),
            thresholds: VerdictThresholds::default(),
            filter: BehaviorFilter::default(),
        }
    }
}

impl VerifierConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for CI gates: skipped coverage fails and the first
    /// failing behavior stops the run.
    pub fn strict() -> Self {
        Self {
            fail_fast: true,
            treat_skipped_as_failure: true,
            thresholds: VerdictThresholds::new(95.0, 75.0),
            ..Default::default()
        }
    }

    /// Configuration for exploratory runs against slow implementations.
    pub fn lenient() -> Self {
        Self {
            timeout_ms: 30_000,
            thresholds: VerdictThresholds::new(80.0, 40.0),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| VerifyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_restore_on_abort(mut self, restore: bool) -> Self {
        self.restore_on_abort = restore;
        self
    }

    pub fn with_isolated_runs(mut self, isolate: bool) -> Self {
        self.isolate_runs = isolate;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_skipped_as_failure(mut self, treat: bool) -> Self {
        self.treat_skipped_as_failure = treat;
        self
    }

    pub fn with_max_eval_depth(mut self, depth: usize) -> Self {
        self.max_eval_depth = depth;
        self
    }

    pub fn with_trace_redaction(mut self, redact: bool) -> Self {
        self.redact_traces = redact;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_thresholds(mut self, thresholds: VerdictThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_filter(mut self, filter: BehaviorFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(VerifyError::Config(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_eval_depth == 0 {
            return Err(VerifyError::Config(
                "max_eval_depth must be greater than 0".to_string(),
            ));
        }
        self.weights.validate()?;
        self.thresholds
            .validate()
            .map_err(|e| VerifyError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        assert!(VerifierConfig::default().validate().is_ok());
        assert!(VerifierConfig::strict().validate().is_ok());
        assert!(VerifierConfig::lenient().validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = VerifierConfig::from_toml_str(
            r#"
            timeout_ms = 250
            fail_fast = true

            [thresholds]
            verified = 85.0

            [filter]
            exclude = ["*Admin"]
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert!(config.fail_fast);
        assert_eq!(config.thresholds.verified, 85.0);
        assert_eq!(config.thresholds.risky, 50.0);
        assert_eq!(config.weights, ScoreWeights::default());
        assert!(!config.filter.matches("DeleteAdmin"));
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        assert!(matches!(
            VerifierConfig::from_toml_str("timeout_ms = 0"),
            Err(VerifyError::Config(_))
        ));
        assert!(matches!(
            VerifierConfig::from_toml_str("timeout_ms = \"soon\""),
            Err(VerifyError::Config(_))
        ));
        assert!(matches!(
            VerifierConfig::from_toml_str("[weights]\ninvariant = -2.0"),
            Err(VerifyError::Config(_))
        ));
    }

    #[test]
    fn test_zero_weight_total_rejected() {
        let zeroed = ScoreWeights {
            precondition: 0.0,
            postcondition: 0.0,
            invariant: 0.0,
        };
        assert!(VerifierConfig::default().with_weights(zeroed).validate().is_err());

        let preconditions_only = ScoreWeights {
            precondition: 3.0,
            ..zeroed
        };
        assert!(VerifierConfig::default()
            .with_weights(preconditions_only)
            .validate()
            .is_err());
        assert!(matches!(
            VerifierConfig::from_toml_str("[weights]\npostcondition = 0.0\ninvariant = 0.0"),
            Err(VerifyError::Config(_))
        ));

        let invariants_only = ScoreWeights {
            invariant: 1.0,
            ..zeroed
        };
        assert!(VerifierConfig::default()
            .with_weights(invariants_only)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_filter_patterns() {
        let filter = BehaviorFilter::new().include("Login*").exclude("*Legacy");

        assert!(filter.matches("Login"));
        assert!(filter.matches("LoginWithOtp"));
        assert!(!filter.matches("LoginLegacy"));
        assert!(!filter.matches("Register"));
        assert!(BehaviorFilter::new().matches("Anything"));
        assert!(pattern_matches("*Pass*", "ResetPassword"));
    }
}
