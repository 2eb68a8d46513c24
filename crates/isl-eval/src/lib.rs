//! Contract expression evaluator for ISL.
//!
//! Walks normalized [`isl_ir::IrExpr`] trees against an
//! [`EvaluationContext`]: the behavior input, its result, the pre-execution
//! snapshot used by `old(...)`, and a read handle on the entity store.
//!
//! Evaluation is synchronous and never mutates the context.

use smol_str::SmolStr;
use thiserror::Error;

mod builtins;
mod context;
mod environment;
mod eval;
mod store;
mod value;

pub use builtins::{Arity, Builtin, BuiltinFn};
pub use context::EvaluationContext;
pub use environment::Environment;
pub use eval::{evaluate_expression, Evaluator, DEFAULT_MAX_DEPTH};
pub use store::{
    criteria_matches, EntityQuery, EntityStore, InMemoryStore, Record, RecordChange, StateHandle,
    StoreError, ID_FIELD,
};
pub use value::Value;

/// Errors that can occur while evaluating a contract expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: SmolStr },

    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
        context: String,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("no {entity} record matches {criteria}")]
    EntityNotFound { entity: SmolStr, criteria: String },

    #[error("result is not available before execution")]
    NoResultAvailable,

    #[error("old() requires a pre-execution snapshot")]
    NoSnapshotAvailable,

    #[error("unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    #[error("invalid pattern /{pattern}/: {message}")]
    InvalidPattern { pattern: SmolStr, message: String },

    #[error("unknown function: {name}")]
    UnknownFunction { name: SmolStr },

    #[error("arity mismatch calling {function}: expected {expected}, got {got}")]
    ArityMismatch {
        function: SmolStr,
        expected: Arity,
        got: usize,
    },

    #[error("expression nesting exceeds the limit of {max}")]
    RecursionLimit { max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EvaluationError {
    pub(crate) fn type_mismatch(
        expected: &'static str,
        found: &Value,
        context: impl Into<String>,
    ) -> Self {
        EvaluationError::TypeMismatch {
            expected,
            found: found.type_name(),
            context: context.into(),
        }
    }
}

/// Result type for evaluation.
pub type Result<T> = std::result::Result<T, EvaluationError>;
