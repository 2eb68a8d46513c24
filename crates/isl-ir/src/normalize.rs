//! IR normalization.
//!
//! Rewrites semantically equivalent expressions into one canonical form so
//! that serialized text can be compared, hashed and cached.
//!
//! # Rules
//!
//! - **Conjunction / disjunction**: flatten nested operands of the same kind,
//!   collapse to the absorbing literal, drop identity literals, sort by
//!   [`sort_key`] and remove duplicates. An empty list becomes the identity
//!   literal and a single operand is unwrapped.
//! - **Set membership**: members are sorted and deduplicated.
//! - **Symmetric and mirrored operators**: equality operands are ordered,
//!   `>`/`>=` become `<`/`<=` with swapped operands.
//! - **Negation folding**: `!true`, `!!x`, and negated existence, equality
//!   and membership tests fold into the inner polarity.
//! - **Constant conditions**: conditionals and implications with a literal
//!   condition reduce to the selected branch.
//!
//! Every rule is idempotent: `normalize(normalize(e))` serializes exactly like
//! `normalize(e)`.

use std::collections::BTreeMap;

use crate::{serialize_ir, CompareOp, IrBuilder, IrExpr, IrKind, SmolStr};

/// Total order over expressions derived only from their content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    pub rank: u8,
    pub text: String,
}

/// Compute the content sort key of an expression.
pub fn sort_key(expr: &IrExpr) -> SortKey {
    SortKey {
        rank: rank(&expr.kind),
        text: serialize_ir(expr),
    }
}

fn rank(kind: &IrKind) -> u8 {
    match kind {
        IrKind::Null => 0,
        IrKind::Bool(_) => 1,
        IrKind::Int(_) => 2,
        IrKind::Float(_) => 3,
        IrKind::String(_) => 4,
        IrKind::Regex { .. } => 5,
        IrKind::List(_) => 6,
        IrKind::Map(_) => 7,
        IrKind::Variable(_) => 8,
        IrKind::Input(_) => 9,
        IrKind::Result(_) => 10,
        IrKind::Property { .. } => 11,
        IrKind::Index { .. } => 12,
        IrKind::Old(_) => 13,
        IrKind::Call { .. } => 14,
        IrKind::Entity { .. } => 15,
        IrKind::Arithmetic { .. } => 16,
        IrKind::StringLength { .. } => 17,
        IrKind::ArrayLength { .. } => 18,
        IrKind::Existence { .. } => 19,
        IrKind::Equality { .. } => 20,
        IrKind::Comparison { .. } => 21,
        IrKind::Between { .. } => 22,
        IrKind::InSet { .. } => 23,
        IrKind::StringMatches { .. } => 24,
        IrKind::StringPredicate { .. } => 25,
        IrKind::ArrayIncludes { .. } => 26,
        IrKind::ArrayIter { .. } => 27,
        IrKind::Quantifier { .. } => 28,
        IrKind::Conditional { .. } => 29,
        IrKind::Not(_) => 30,
        IrKind::Implies { .. } => 31,
        IrKind::And(_) => 32,
        IrKind::Or(_) => 33,
    }
}

/// Normalize an expression with a fresh builder.
pub fn normalize_ir(expr: &IrExpr) -> IrExpr {
    let mut builder = IrBuilder::new();
    Normalizer::new(&mut builder).normalize(expr)
}

/// Normalizer that allocates result nodes from a caller-owned builder.
pub struct Normalizer<'b> {
    builder: &'b mut IrBuilder,
}

impl<'b> Normalizer<'b> {
    pub fn new(builder: &'b mut IrBuilder) -> Self {
        Self { builder }
    }

    /// Produce the canonical form of `expr`. The input is never modified.
    pub fn normalize(&mut self, expr: &IrExpr) -> IrExpr {
        let mut out = self.rewrite(expr);
        if out.span.is_none() {
            out.span = expr.span;
        }
        out
    }

    fn boxed(&mut self, expr: &IrExpr) -> Box<IrExpr> {
        Box::new(self.normalize(expr))
    }

    fn all(&mut self, exprs: &[IrExpr]) -> Vec<IrExpr> {
        exprs.iter().map(|e| self.normalize(e)).collect()
    }

    fn rewrite(&mut self, expr: &IrExpr) -> IrExpr {
        let kind = match &expr.kind {
            IrKind::Null => IrKind::Null,
            IrKind::Bool(b) => IrKind::Bool(*b),
            IrKind::Int(n) => IrKind::Int(*n),
            IrKind::Float(f) => IrKind::Float(*f),
            IrKind::String(s) => IrKind::String(s.clone()),
            IrKind::Regex { pattern, flags } => IrKind::Regex {
                pattern: pattern.clone(),
                flags: flags.clone(),
            },
            IrKind::List(items) => IrKind::List(self.all(items)),
            IrKind::Map(entries) => {
                let mut sorted: BTreeMap<SmolStr, IrExpr> = BTreeMap::new();
                for (key, value) in entries {
                    let value = self.normalize(value);
                    sorted.insert(key.clone(), value);
                }
                IrKind::Map(sorted.into_iter().collect())
            }

            IrKind::Variable(name) => IrKind::Variable(name.clone()),
            IrKind::Property { object, property } => IrKind::Property {
                object: self.boxed(object),
                property: property.clone(),
            },
            IrKind::Index { object, index } => IrKind::Index {
                object: self.boxed(object),
                index: self.boxed(index),
            },

            IrKind::Existence { target, exists } => IrKind::Existence {
                target: self.boxed(target),
                exists: *exists,
            },
            IrKind::Comparison { op, left, right } => {
                let left = self.boxed(left);
                let right = self.boxed(right);
                match op {
                    CompareOp::Gt | CompareOp::Ge => IrKind::Comparison {
                        op: op.flip(),
                        left: right,
                        right: left,
                    },
                    CompareOp::Lt | CompareOp::Le => IrKind::Comparison {
                        op: *op,
                        left,
                        right,
                    },
                }
            }
            IrKind::Equality {
                left,
                right,
                negated,
            } => {
                let left = self.boxed(left);
                let right = self.boxed(right);
                let (left, right) = if sort_key(&right) < sort_key(&left) {
                    (right, left)
                } else {
                    (left, right)
                };
                IrKind::Equality {
                    left,
                    right,
                    negated: *negated,
                }
            }

            IrKind::StringLength { target } => IrKind::StringLength {
                target: self.boxed(target),
            },
            IrKind::StringMatches { target, pattern } => IrKind::StringMatches {
                target: self.boxed(target),
                pattern: self.boxed(pattern),
            },
            IrKind::StringPredicate {
                op,
                target,
                argument,
            } => IrKind::StringPredicate {
                op: *op,
                target: self.boxed(target),
                argument: self.boxed(argument),
            },

            IrKind::Between {
                value,
                low,
                high,
                inclusive,
            } => IrKind::Between {
                value: self.boxed(value),
                low: self.boxed(low),
                high: self.boxed(high),
                inclusive: *inclusive,
            },
            IrKind::InSet {
                value,
                set,
                negated,
            } => {
                let value = self.boxed(value);
                let members = self.all(set);
                IrKind::InSet {
                    value,
                    set: sorted_unique(members),
                    negated: *negated,
                }
            }

            IrKind::And(operands) => return self.junction(operands, true),
            IrKind::Or(operands) => return self.junction(operands, false),
            IrKind::Not(inner) => return self.negate(inner),
            IrKind::Implies {
                antecedent,
                consequent,
            } => {
                let antecedent = self.normalize(antecedent);
                match antecedent.as_bool_literal() {
                    Some(false) => IrKind::Bool(true),
                    Some(true) => return self.normalize(consequent),
                    None => IrKind::Implies {
                        antecedent: Box::new(antecedent),
                        consequent: self.boxed(consequent),
                    },
                }
            }

            IrKind::ArrayLength { array } => IrKind::ArrayLength {
                array: self.boxed(array),
            },
            IrKind::ArrayIncludes { array, element } => IrKind::ArrayIncludes {
                array: self.boxed(array),
                element: self.boxed(element),
            },
            IrKind::ArrayIter {
                op,
                array,
                variable,
                body,
            } => IrKind::ArrayIter {
                op: *op,
                array: self.boxed(array),
                variable: variable.clone(),
                body: self.boxed(body),
            },

            IrKind::Quantifier {
                quantifier,
                collection,
                variable,
                predicate,
            } => IrKind::Quantifier {
                quantifier: *quantifier,
                collection: self.boxed(collection),
                variable: variable.clone(),
                predicate: self.boxed(predicate),
            },

            IrKind::Arithmetic { op, left, right } => IrKind::Arithmetic {
                op: *op,
                left: self.boxed(left),
                right: self.boxed(right),
            },
            IrKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.normalize(condition);
                match condition.as_bool_literal() {
                    Some(true) => return self.normalize(then_branch),
                    Some(false) => return self.normalize(else_branch),
                    None => IrKind::Conditional {
                        condition: Box::new(condition),
                        then_branch: self.boxed(then_branch),
                        else_branch: self.boxed(else_branch),
                    },
                }
            }

            IrKind::Old(inner) => IrKind::Old(self.boxed(inner)),
            IrKind::Result(property) => IrKind::Result(property.clone()),
            IrKind::Input(property) => IrKind::Input(property.clone()),
            IrKind::Call { function, args } => IrKind::Call {
                function: function.clone(),
                args: self.all(args),
            },
            IrKind::Entity {
                op,
                entity,
                criteria,
            } => IrKind::Entity {
                op: *op,
                entity: entity.clone(),
                criteria: criteria.as_deref().map(|c| self.boxed(c)),
            },
        };
        self.builder.node(kind)
    }

    /// Shared rule for `And` (`is_and`) and `Or`.
    fn junction(&mut self, operands: &[IrExpr], is_and: bool) -> IrExpr {
        let identity = is_and;
        let mut flat = Vec::with_capacity(operands.len());

        for operand in operands {
            let operand = self.normalize(operand);
            match operand.kind {
                IrKind::And(inner) if is_and => flat.extend(inner),
                IrKind::Or(inner) if !is_and => flat.extend(inner),
                kind => flat.push(IrExpr { kind, ..operand }),
            }
        }

        if flat.iter().any(|e| e.as_bool_literal() == Some(!identity)) {
            return self.builder.bool(!identity);
        }
        flat.retain(|e| e.as_bool_literal() != Some(identity));

        let mut flat = sorted_unique(flat);
        match flat.len() {
            0 => self.builder.bool(identity),
            1 => flat.remove(0),
            _ if is_and => self.builder.node(IrKind::And(flat)),
            _ => self.builder.node(IrKind::Or(flat)),
        }
    }

    fn negate(&mut self, inner: &IrExpr) -> IrExpr {
        let inner = self.normalize(inner);
        let kind = match inner.kind {
            IrKind::Bool(b) => IrKind::Bool(!b),
            IrKind::Not(x) => return *x,
            IrKind::Existence { target, exists } => IrKind::Existence {
                target,
                exists: !exists,
            },
            IrKind::Equality {
                left,
                right,
                negated,
            } => IrKind::Equality {
                left,
                right,
                negated: !negated,
            },
            IrKind::InSet {
                value,
                set,
                negated,
            } => IrKind::InSet {
                value,
                set,
                negated: !negated,
            },
            kind => IrKind::Not(Box::new(IrExpr { kind, ..inner })),
        };
        self.builder.node(kind)
    }
}

fn sorted_unique(exprs: Vec<IrExpr>) -> Vec<IrExpr> {
    let mut keyed: Vec<(SortKey, IrExpr)> = exprs.into_iter().map(|e| (sort_key(&e), e)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    keyed.into_iter().map(|(_, e)| e).collect()
}
