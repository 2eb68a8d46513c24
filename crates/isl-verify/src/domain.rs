//! Contract model: domains, behaviors and their clauses.
//!
//! Clauses are normalized once when they are attached, so the engine only
//! ever evaluates canonical IR.

use indexmap::IndexMap;
use isl_eval::Value;
use isl_ir::{normalize_ir, serialize_ir, IrExpr};
use serde::Serialize;
use smol_str::SmolStr;

/// A single contract expression with its display text.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    /// Text shown in evidence, either supplied by the front-end or the
    /// canonical serialization
    pub source: String,
    pub expr: IrExpr,
}

impl Clause {
    /// Normalize `expr` and label it with its canonical text.
    pub fn new(expr: &IrExpr) -> Self {
        let expr = normalize_ir(expr);
        Self {
            source: serialize_ir(&expr),
            expr,
        }
    }

    /// Normalize `expr` but keep the clause text as written.
    pub fn with_source(source: impl Into<String>, expr: &IrExpr) -> Self {
        Self {
            source: source.into(),
            expr: normalize_ir(expr),
        }
    }
}

/// When a postcondition applies, after the implementation returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostconditionGuard {
    Always,
    OnSuccess,
    /// Any error, or only errors with the given code
    OnError(Option<SmolStr>),
}

impl PostconditionGuard {
    pub fn applies(&self, success: bool, error_code: Option<&str>) -> bool {
        match self {
            PostconditionGuard::Always => true,
            PostconditionGuard::OnSuccess => success,
            PostconditionGuard::OnError(None) => !success,
            PostconditionGuard::OnError(Some(code)) => {
                !success && error_code == Some(code.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Postcondition {
    pub guard: PostconditionGuard,
    pub clause: Clause,
}

/// Contract of one behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorSpec {
    pub name: SmolStr,
    pub preconditions: Vec<Clause>,
    pub postconditions: Vec<Postcondition>,
    pub invariants: Vec<Clause>,
}

impl BehaviorSpec {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            invariants: Vec::new(),
        }
    }

    pub fn requires(mut self, clause: Clause) -> Self {
        self.preconditions.push(clause);
        self
    }

    /// Postcondition checked on every outcome.
    pub fn ensures(mut self, clause: Clause) -> Self {
        self.postconditions.push(Postcondition {
            guard: PostconditionGuard::Always,
            clause,
        });
        self
    }

    pub fn ensures_on_success(mut self, clause: Clause) -> Self {
        self.postconditions.push(Postcondition {
            guard: PostconditionGuard::OnSuccess,
            clause,
        });
        self
    }

    /// Postcondition checked when the implementation fails with `code`,
    /// or with any code when `code` is `None`.
    pub fn ensures_on_error(mut self, code: Option<&str>, clause: Clause) -> Self {
        self.postconditions.push(Postcondition {
            guard: PostconditionGuard::OnError(code.map(SmolStr::new)),
            clause,
        });
        self
    }

    pub fn invariant(mut self, clause: Clause) -> Self {
        self.invariants.push(clause);
        self
    }
}

/// A set of behaviors sharing entity types and global invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    pub name: SmolStr,
    pub behaviors: IndexMap<SmolStr, BehaviorSpec>,
    /// Checked after every behavior, following that behavior's own invariants
    pub invariants: Vec<Clause>,
}

impl Domain {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            behaviors: IndexMap::new(),
            invariants: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: BehaviorSpec) -> Self {
        self.behaviors.insert(behavior.name.clone(), behavior);
        self
    }

    pub fn invariant(mut self, clause: Clause) -> Self {
        self.invariants.push(clause);
        self
    }

    pub fn behavior(&self, name: &str) -> Option<&BehaviorSpec> {
        self.behaviors.get(name)
    }
}

/// A named input for one behavior run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub name: SmolStr,
    pub input: Value,
}

impl Scenario {
    pub fn new(name: impl Into<SmolStr>, input: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
        }
    }
}

/// One entry of a domain run: which behavior to drive with which scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRun {
    pub behavior: SmolStr,
    pub scenario: Scenario,
}

impl PlannedRun {
    pub fn new(behavior: impl Into<SmolStr>, scenario: Scenario) -> Self {
        Self {
            behavior: behavior.into(),
            scenario,
        }
    }
}
