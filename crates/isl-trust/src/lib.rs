//! Trust Score Calculation
//!
//! Turns a flat list of contract check outcomes into a single trust score
//! and a three-tier verdict. This is the scorer CI pipelines consume; the
//! verification engine feeds it through
//! `BehaviorVerificationResult::check_records`.
//!
//! # Scoring
//!
//! - Skipped records never contribute to the score.
//! - The score is the weighted share of passing records, in percent.
//! - No scoring records means a score of 0.
//! - Records are folded once, in input order, so the same input always
//!   yields the same report.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use isl_trust::{CheckRecord, TrustCalculator, TrustVerdict};
//!
//! let records = vec![
//!     CheckRecord::passed("post: session exists", "postcondition", Duration::from_millis(3)),
//!     CheckRecord::passed("inv: password never stored", "invariant", Duration::from_millis(1)),
//! ];
//!
//! let report = TrustCalculator::new().calculate(&records);
//! assert_eq!(report.score, 100.0);
//! assert_eq!(report.verdict, TrustVerdict::Verified);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Errors
// ============================================================================

/// Invalid trust configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrustError {
    #[error("thresholds must satisfy 0 <= risky <= verified <= 100 (got risky={risky}, verified={verified})")]
    InvalidThresholds { verified: f64, risky: f64 },

    #[error("weight for `{category}` must be finite and non-negative, got {weight}")]
    InvalidWeight { category: String, weight: f64 },
}

/// Result type for trust configuration.
pub type Result<T> = std::result::Result<T, TrustError>;

// ============================================================================
// Check Records
// ============================================================================

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

impl CheckStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, CheckStatus::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckStatus::Failed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CheckStatus::Skipped)
    }
}

/// One scored check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    /// Check name, usually the clause text
    pub name: String,

    /// Grouping used by category weighting (`precondition`, `postcondition`, ...)
    pub category: String,

    pub status: CheckStatus,

    pub duration: Duration,

    /// Failure or skip reason
    pub error: Option<String>,
}

impl CheckRecord {
    /// Create a passing record
    pub fn passed(name: impl Into<String>, category: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            status: CheckStatus::Passed,
            duration,
            error: None,
        }
    }

    /// Create a failing record
    pub fn failed(
        name: impl Into<String>,
        category: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            status: CheckStatus::Failed,
            duration,
            error: Some(error.into()),
        }
    }

    /// Create a skipped record
    pub fn skipped(
        name: impl Into<String>,
        category: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            status: CheckStatus::Skipped,
            duration: Duration::ZERO,
            error: Some(reason.into()),
        }
    }
}

// ============================================================================
// Verdicts
// ============================================================================

/// Three-tier trust verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustVerdict {
    Verified,
    Risky,
    Unsafe,
}

impl fmt::Display for TrustVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrustVerdict::Verified => "verified",
            TrustVerdict::Risky => "risky",
            TrustVerdict::Unsafe => "unsafe",
        })
    }
}

/// Score cut-offs for each verdict tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictThresholds {
    /// Minimum score for `verified` (also requires zero failures)
    pub verified: f64,

    /// Minimum score for `risky`
    pub risky: f64,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            verified: 90.0,
            risky: 50.0,
        }
    }
}

impl VerdictThresholds {
    pub fn new(verified: f64, risky: f64) -> Self {
        Self { verified, risky }
    }

    /// Classify a score. Any failure rules out `verified`.
    pub fn classify(&self, score: f64, failures: usize) -> TrustVerdict {
        if score >= self.verified && failures == 0 {
            TrustVerdict::Verified
        } else if score >= self.risky {
            TrustVerdict::Risky
        } else {
            TrustVerdict::Unsafe
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !(in_range(self.verified) && in_range(self.risky) && self.risky <= self.verified) {
            return Err(TrustError::InvalidThresholds {
                verified: self.verified,
                risky: self.risky,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// How individual records are weighted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Weighting {
    /// Every record counts once
    #[default]
    Uniform,

    /// Weight is the record's duration in milliseconds, at least 1
    DurationWeighted,

    /// Weight per category; unlisted categories weigh 1.0
    CategoryWeighted { weights: BTreeMap<String, f64> },
}

impl Weighting {
    fn weight_of(&self, record: &CheckRecord) -> f64 {
        match self {
            Weighting::Uniform => 1.0,
            Weighting::DurationWeighted => (record.duration.as_millis().max(1)) as f64,
            Weighting::CategoryWeighted { weights } => {
                weights.get(&record.category).copied().unwrap_or(1.0)
            }
        }
    }
}

/// Calculator settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub weighting: Weighting,
    pub thresholds: VerdictThresholds,
}

impl TrustConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weighting(mut self, weighting: Weighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_thresholds(mut self, thresholds: VerdictThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Check thresholds and category weights.
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if let Weighting::CategoryWeighted { weights } = &self.weighting {
            for (category, weight) in weights {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(TrustError::InvalidWeight {
                        category: category.clone(),
                        weight: *weight,
                    });
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Calculator
// ============================================================================

/// Aggregate over a set of check records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustReport {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,

    /// Weighted pass percentage in `[0, 100]`
    pub score: f64,

    pub verdict: TrustVerdict,
}

/// Computes [`TrustReport`]s.
#[derive(Debug, Clone, Default)]
pub struct TrustCalculator {
    config: TrustConfig,
}

impl TrustCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a validated configuration.
    pub fn with_config(config: TrustConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Score `records`.
    pub fn calculate(&self, records: &[CheckRecord]) -> TrustReport {
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut earned = 0.0;
        let mut possible = 0.0;

        for record in records {
            match record.status {
                CheckStatus::Skipped => {
                    skipped += 1;
                    continue;
                }
                CheckStatus::Passed => passed += 1,
                CheckStatus::Failed => failed += 1,
            }
            let weight = self.config.weighting.weight_of(record);
            possible += weight;
            if record.status.is_passed() {
                earned += weight;
            }
        }

        let score = if possible > 0.0 {
            (earned * 100.0 / possible).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let verdict = self.config.thresholds.classify(score, failed);
        debug!(passed, failed, skipped, score, %verdict, "trust score calculated");

        TrustReport {
            passed,
            failed,
            skipped,
            total: records.len(),
            score,
            verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_empty_records_score_zero() {
        let report = TrustCalculator::new().calculate(&[]);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.total, 0);
        assert_eq!(report.verdict, TrustVerdict::Unsafe);
    }

    #[test]
    fn test_skipped_records_are_excluded() {
        let records = vec![
            CheckRecord::passed("a", "postcondition", ms(1)),
            CheckRecord::skipped("b", "postcondition", "precondition failed"),
        ];
        let report = TrustCalculator::new().calculate(&records);

        assert_eq!(report.score, 100.0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.total, 2);
        assert_eq!(report.verdict, TrustVerdict::Verified);
    }

    #[test]
    fn test_only_skipped_scores_zero() {
        let records = vec![CheckRecord::skipped("a", "invariant", "n/a")];
        assert_eq!(TrustCalculator::new().calculate(&records).score, 0.0);
    }

    #[test]
    fn test_failures_block_verified() {
        let mut records: Vec<_> = (0..19)
            .map(|i| CheckRecord::passed(format!("c{}", i), "postcondition", ms(1)))
            .collect();
        records.push(CheckRecord::failed("bad", "postcondition", "false", ms(1)));
        let report = TrustCalculator::new().calculate(&records);

        assert_eq!(report.score, 95.0);
        assert_eq!(report.verdict, TrustVerdict::Risky);
    }

    #[test]
    fn test_duration_weighting() {
        let records = vec![
            CheckRecord::passed("slow", "postcondition", ms(30)),
            CheckRecord::failed("fast", "postcondition", "false", Duration::ZERO),
        ];
        let config = TrustConfig::new().with_weighting(Weighting::DurationWeighted);
        let report = TrustCalculator::with_config(config).unwrap().calculate(&records);

        // 30 / (30 + 1)
        assert!((report.score - 96.774).abs() < 0.01);
    }

    #[test]
    fn test_category_weighting() {
        let mut weights = BTreeMap::new();
        weights.insert("invariant".to_string(), 3.0);
        let config = TrustConfig::new().with_weighting(Weighting::CategoryWeighted { weights });
        let records = vec![
            CheckRecord::passed("inv", "invariant", ms(1)),
            CheckRecord::failed("post", "postcondition", "false", ms(1)),
        ];
        let report = TrustCalculator::with_config(config).unwrap().calculate(&records);

        assert_eq!(report.score, 75.0);
        assert_eq!(report.verdict, TrustVerdict::Risky);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrustConfig::new().with_thresholds(VerdictThresholds::new(40.0, 60.0));
        assert!(matches!(
            TrustCalculator::with_config(config),
            Err(TrustError::InvalidThresholds { .. })
        ));

        let mut weights = BTreeMap::new();
        weights.insert("invariant".to_string(), -1.0);
        let config = TrustConfig::new().with_weighting(Weighting::CategoryWeighted { weights });
        assert!(matches!(
            config.validate(),
            Err(TrustError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_threshold_tiers() {
        let t = VerdictThresholds::default();
        assert_eq!(t.classify(90.0, 0), TrustVerdict::Verified);
        assert_eq!(t.classify(89.9, 0), TrustVerdict::Risky);
        assert_eq!(t.classify(50.0, 3), TrustVerdict::Risky);
        assert_eq!(t.classify(49.9, 0), TrustVerdict::Unsafe);
    }
}
