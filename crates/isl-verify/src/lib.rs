//! Behavior Verification Engine
//!
//! Runs behavior implementations against their ISL contracts and collects
//! evidence for every precondition, postcondition and invariant.
//!
//! # Run Lifecycle
//!
//! 1. Snapshot the entity store
//! 2. Check preconditions against the input (a failure skips the run)
//! 3. Execute the implementation under a timeout and trace the records it
//!    changed
//! 4. Check postconditions and invariants against input, result, snapshot
//!    and the live store
//! 5. Score the run
//!
//! A store failure at any step ends the run with the `errored` verdict.
//!
//! Results roll up into a [`DomainSummary`] with a verified / risky / unsafe
//! verdict.

use std::time::Duration;

use smol_str::SmolStr;
use thiserror::Error;

mod config;
mod domain;
mod engine;
mod result;
mod trace;

pub use config::{BehaviorFilter, ScoreWeights, VerifierConfig};
pub use domain::{
    BehaviorSpec, Clause, Domain, PlannedRun, Postcondition, PostconditionGuard, Scenario,
};
pub use engine::{BehaviorFailure, BehaviorImplementation, Clock, VerificationEngine};
pub use result::{
    summarize, summarize_with, BehaviorVerdict, BehaviorVerificationResult, CheckCategory,
    CheckEvidence, DomainSummary, RunPhase,
};
pub use trace::{Trace, TraceEvent, TraceEventKind, TraceMetadata, TraceRecorder};

pub use isl_trust::{TrustVerdict, VerdictThresholds};

/// Engine-level failures.
///
/// These never escape `verify_behavior`; they are recorded on the run
/// result. Configuration errors surface from constructors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("unknown behavior: {name}")]
    UnknownBehavior { name: SmolStr },

    #[error("no implementation registered for behavior {name}")]
    MissingImplementation { name: SmolStr },

    #[error(transparent)]
    Store(#[from] isl_eval::StoreError),

    #[error("implementation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for the verification engine.
pub type Result<T> = std::result::Result<T, VerifyError>;
