//! ISL Expression Intermediate Representation
//!
//! Defines the canonical expression tree that behavior contracts
//! (preconditions, postconditions, invariants) are lowered into, together
//! with the three operations every downstream consumer relies on:
//!
//! - **Construction** through an [`IrBuilder`], which owns the per-build
//!   node id counter.
//! - **Normalization** ([`normalize_ir`]), which rewrites semantically
//!   equivalent trees into one canonical form.
//! - **Serialization** ([`serialize_ir`]), which renders a tree into a fully
//!   parenthesized, deterministic string.
//!
//! # Node identity
//!
//! Every node carries a [`NodeId`] for tracing. Ids depend on allocation
//! order and are never part of equality, ordering, or serialization:
//! `IrExpr: PartialEq` compares the [`IrKind`] only.
//!
//! ```rust
//! use isl_ir::{IrBuilder, normalize_ir, serialize_ir};
//!
//! let mut b = IrBuilder::new();
//! let a = b.var("a");
//! let c = b.var("c");
//! let left = b.and(vec![a.clone(), c.clone()]);
//! let right = b.and(vec![c, a]);
//!
//! assert_ne!(left.id, right.id);
//! assert_eq!(serialize_ir(&normalize_ir(&left)), serialize_ir(&normalize_ir(&right)));
//! ```

use std::fmt;

pub use smol_str::SmolStr;
use thiserror::Error;

mod builder;
mod normalize;
mod serialize;

pub use builder::IrBuilder;
pub use normalize::{normalize_ir, sort_key, Normalizer, SortKey};
pub use serialize::serialize_ir;

// ============================================================================
// Source Locations
// ============================================================================

/// Source span representing a range in the contract source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Opaque node identifier, unique within one [`IrBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Shape errors reported while building IR.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("cannot bind reserved name `{name}`")]
    ReservedBinding { name: SmolStr },

    #[error("bound variable name must not be empty")]
    EmptyBinding,

    #[error("expression depth {depth} exceeds the maximum of {max}")]
    TooDeep { depth: usize, max: usize },
}

/// Names that refer to special forms and can never be rebound.
pub const RESERVED_NAMES: &[&str] = &["input", "result", "old"];

// ============================================================================
// Operators
// ============================================================================

/// Ordering comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    /// The operator that gives the same answer with swapped operands.
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }
}

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

/// Two-operand string predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringPredicateOp {
    Includes,
    StartsWith,
    EndsWith,
}

impl StringPredicateOp {
    pub fn method(self) -> &'static str {
        match self {
            StringPredicateOp::Includes => "includes",
            StringPredicateOp::StartsWith => "startsWith",
            StringPredicateOp::EndsWith => "endsWith",
        }
    }
}

/// Array operations that bind a loop variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayIterOp {
    Every,
    Some,
    Filter,
    Map,
}

impl ArrayIterOp {
    pub fn method(self) -> &'static str {
        match self {
            ArrayIterOp::Every => "every",
            ArrayIterOp::Some => "some",
            ArrayIterOp::Filter => "filter",
            ArrayIterOp::Map => "map",
        }
    }
}

/// Quantifiers over a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantifier {
    All,
    Any,
    None,
    Count,
}

impl Quantifier {
    pub fn keyword(self) -> &'static str {
        match self {
            Quantifier::All => "all",
            Quantifier::Any => "any",
            Quantifier::None => "none",
            Quantifier::Count => "count",
        }
    }
}

/// Entity store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityOp {
    Exists,
    Lookup,
    Count,
}

impl EntityOp {
    pub fn method(self) -> &'static str {
        match self {
            EntityOp::Exists => "exists",
            EntityOp::Lookup => "lookup",
            EntityOp::Count => "count",
        }
    }
}

// ============================================================================
// Expression Tree
// ============================================================================

/// A node of the expression IR.
#[derive(Debug, Clone)]
pub struct IrExpr {
    pub kind: IrKind,
    pub id: NodeId,
    pub span: Option<Span>,
}

impl PartialEq for IrExpr {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

/// The closed set of expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum IrKind {
    // Literals
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(SmolStr),
    Regex {
        pattern: SmolStr,
        flags: SmolStr,
    },
    List(Vec<IrExpr>),
    Map(Vec<(SmolStr, IrExpr)>),

    // Access
    Variable(SmolStr),
    Property {
        object: Box<IrExpr>,
        property: SmolStr,
    },
    Index {
        object: Box<IrExpr>,
        index: Box<IrExpr>,
    },

    // Tests
    Existence {
        target: Box<IrExpr>,
        exists: bool,
    },
    Comparison {
        op: CompareOp,
        left: Box<IrExpr>,
        right: Box<IrExpr>,
    },
    Equality {
        left: Box<IrExpr>,
        right: Box<IrExpr>,
        negated: bool,
    },

    // Strings
    StringLength {
        target: Box<IrExpr>,
    },
    StringMatches {
        target: Box<IrExpr>,
        pattern: Box<IrExpr>,
    },
    StringPredicate {
        op: StringPredicateOp,
        target: Box<IrExpr>,
        argument: Box<IrExpr>,
    },

    // Ranges and sets
    Between {
        value: Box<IrExpr>,
        low: Box<IrExpr>,
        high: Box<IrExpr>,
        inclusive: bool,
    },
    InSet {
        value: Box<IrExpr>,
        set: Vec<IrExpr>,
        negated: bool,
    },

    // Boolean logic
    And(Vec<IrExpr>),
    Or(Vec<IrExpr>),
    Not(Box<IrExpr>),
    Implies {
        antecedent: Box<IrExpr>,
        consequent: Box<IrExpr>,
    },

    // Arrays
    ArrayLength {
        array: Box<IrExpr>,
    },
    ArrayIncludes {
        array: Box<IrExpr>,
        element: Box<IrExpr>,
    },
    ArrayIter {
        op: ArrayIterOp,
        array: Box<IrExpr>,
        variable: SmolStr,
        body: Box<IrExpr>,
    },

    // Quantifiers
    Quantifier {
        quantifier: Quantifier,
        collection: Box<IrExpr>,
        variable: SmolStr,
        predicate: Box<IrExpr>,
    },

    Arithmetic {
        op: ArithOp,
        left: Box<IrExpr>,
        right: Box<IrExpr>,
    },
    Conditional {
        condition: Box<IrExpr>,
        then_branch: Box<IrExpr>,
        else_branch: Box<IrExpr>,
    },

    // Special forms
    Old(Box<IrExpr>),
    Result(Option<SmolStr>),
    Input(SmolStr),

    Call {
        function: SmolStr,
        args: Vec<IrExpr>,
    },

    Entity {
        op: EntityOp,
        entity: SmolStr,
        criteria: Option<Box<IrExpr>>,
    },
}

impl IrExpr {
    /// Attach a source span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Short variant name, used in diagnostics and traces.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            IrKind::Null => "Null",
            IrKind::Bool(_) => "Bool",
            IrKind::Int(_) => "Int",
            IrKind::Float(_) => "Float",
            IrKind::String(_) => "String",
            IrKind::Regex { .. } => "Regex",
            IrKind::List(_) => "List",
            IrKind::Map(_) => "Map",
            IrKind::Variable(_) => "Variable",
            IrKind::Property { .. } => "Property",
            IrKind::Index { .. } => "Index",
            IrKind::Existence { .. } => "Existence",
            IrKind::Comparison { .. } => "Comparison",
            IrKind::Equality { .. } => "Equality",
            IrKind::StringLength { .. } => "StringLength",
            IrKind::StringMatches { .. } => "StringMatches",
            IrKind::StringPredicate { .. } => "StringPredicate",
            IrKind::Between { .. } => "Between",
            IrKind::InSet { .. } => "InSet",
            IrKind::And(_) => "And",
            IrKind::Or(_) => "Or",
            IrKind::Not(_) => "Not",
            IrKind::Implies { .. } => "Implies",
            IrKind::ArrayLength { .. } => "ArrayLength",
            IrKind::ArrayIncludes { .. } => "ArrayIncludes",
            IrKind::ArrayIter { .. } => "ArrayIter",
            IrKind::Quantifier { .. } => "Quantifier",
            IrKind::Arithmetic { .. } => "Arithmetic",
            IrKind::Conditional { .. } => "Conditional",
            IrKind::Old(_) => "Old",
            IrKind::Result(_) => "Result",
            IrKind::Input(_) => "Input",
            IrKind::Call { .. } => "Call",
            IrKind::Entity { .. } => "Entity",
        }
    }

    /// Returns true for literal nodes (including list and map literals).
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            IrKind::Null
                | IrKind::Bool(_)
                | IrKind::Int(_)
                | IrKind::Float(_)
                | IrKind::String(_)
                | IrKind::Regex { .. }
                | IrKind::List(_)
                | IrKind::Map(_)
        )
    }

    /// The boolean value of a `Bool` literal.
    pub fn as_bool_literal(&self) -> Option<bool> {
        match self.kind {
            IrKind::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Direct children in source order.
    pub fn children(&self) -> Vec<&IrExpr> {
        match &self.kind {
            IrKind::Null
            | IrKind::Bool(_)
            | IrKind::Int(_)
            | IrKind::Float(_)
            | IrKind::String(_)
            | IrKind::Regex { .. }
            | IrKind::Variable(_)
            | IrKind::Result(_)
            | IrKind::Input(_) => Vec::new(),
            IrKind::List(items) | IrKind::And(items) | IrKind::Or(items) => items.iter().collect(),
            IrKind::Call { args, .. } => args.iter().collect(),
            IrKind::Map(entries) => entries.iter().map(|(_, v)| v).collect(),
            IrKind::Property { object, .. } => vec![object],
            IrKind::Index { object, index } => vec![object, index],
            IrKind::Existence { target, .. } | IrKind::StringLength { target } => vec![target],
            IrKind::Comparison { left, right, .. }
            | IrKind::Equality { left, right, .. }
            | IrKind::Arithmetic { left, right, .. } => vec![left, right],
            IrKind::StringMatches { target, pattern } => vec![target, pattern],
            IrKind::StringPredicate {
                target, argument, ..
            } => vec![target, argument],
            IrKind::Between {
                value, low, high, ..
            } => vec![value, low, high],
            IrKind::InSet { value, set, .. } => {
                let mut children = vec![value.as_ref()];
                children.extend(set.iter());
                children
            }
            IrKind::Not(inner) | IrKind::Old(inner) => vec![inner],
            IrKind::Implies {
                antecedent,
                consequent,
            } => vec![antecedent, consequent],
            IrKind::ArrayLength { array } => vec![array],
            IrKind::ArrayIncludes { array, element } => vec![array, element],
            IrKind::ArrayIter { array, body, .. } => vec![array, body],
            IrKind::Quantifier {
                collection,
                predicate,
                ..
            } => vec![collection, predicate],
            IrKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => vec![condition, then_branch, else_branch],
            IrKind::Entity { criteria, .. } => criteria.iter().map(|c| c.as_ref()).collect(),
        }
    }

    /// Height of the tree rooted at this node (a leaf has depth 1).
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(IrExpr::depth)
            .max()
            .unwrap_or(0)
    }

    /// Total number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(IrExpr::node_count)
            .sum::<usize>()
    }
}

impl fmt::Display for IrExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize_ir(self))
    }
}
