//! Canonical text rendering for IR.
//!
//! Every composite that could bind ambiguously is parenthesized, so two trees
//! serialize to the same text exactly when they are structurally equal.
//! Node ids never appear in the output.

use std::fmt::Write;

use crate::{IrExpr, IrKind};

/// Render an expression into its canonical text.
pub fn serialize_ir(expr: &IrExpr) -> String {
    let mut out = String::new();
    let mut serializer = Serializer::new(&mut out);
    serializer.expr(expr);
    out
}

struct Serializer<'a> {
    out: &'a mut String,
}

impl<'a> Serializer<'a> {
    fn new(out: &'a mut String) -> Self {
        Self { out }
    }

    fn push(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn separated(&mut self, items: &[IrExpr], sep: &str) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(sep);
            }
            self.expr(item);
        }
    }

    fn binary(&mut self, left: &IrExpr, op: &str, right: &IrExpr) {
        self.push("(");
        self.expr(left);
        self.push(" ");
        self.push(op);
        self.push(" ");
        self.expr(right);
        self.push(")");
    }

    fn method(&mut self, target: &IrExpr, name: &str, args: &[&IrExpr]) {
        self.expr(target);
        self.push(".");
        self.push(name);
        self.push("(");
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(arg);
        }
        self.push(")");
    }

    fn float(&mut self, value: f64) {
        let text = format!("{:?}", value);
        self.push(&text);
        if value.is_finite() && !text.contains(['.', 'e', 'E']) {
            self.push(".0");
        }
    }

    /// `/pattern/` with unescaped slashes escaped, so the closing delimiter
    /// is always the first unescaped `/`.
    fn regex(&mut self, pattern: &str) {
        self.out.push('/');
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => {
                        self.out.push('\\');
                        self.out.push(escaped);
                    }
                    None => self.push("\\\\"),
                },
                '/' => self.push("\\/"),
                c => self.out.push(c),
            }
        }
        self.out.push('/');
    }

    fn expr(&mut self, expr: &IrExpr) {
        match &expr.kind {
            IrKind::Null => self.push("null"),
            IrKind::Bool(b) => self.push(if *b { "true" } else { "false" }),
            IrKind::Int(n) => {
                let _ = write!(self.out, "{}", n);
            }
            IrKind::Float(f) => self.float(*f),
            IrKind::String(s) => {
                let _ = write!(self.out, "{:?}", s.as_str());
            }
            IrKind::Regex { pattern, flags } => {
                self.regex(pattern);
                self.push(flags);
            }
            IrKind::List(items) => {
                self.push("[");
                self.separated(items, ", ");
                self.push("]");
            }
            IrKind::Map(entries) => {
                self.push("{");
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    let _ = write!(self.out, "{:?}: ", key.as_str());
                    self.expr(value);
                }
                self.push("}");
            }

            IrKind::Variable(name) => self.push(name),
            IrKind::Property { object, property } => {
                self.expr(object);
                self.push(".");
                self.push(property);
            }
            IrKind::Index { object, index } => {
                self.expr(object);
                self.push("[");
                self.expr(index);
                self.push("]");
            }

            IrKind::Existence { target, exists } => {
                self.push("(");
                self.expr(target);
                self.push(if *exists { " != null)" } else { " == null)" });
            }
            IrKind::Comparison { op, left, right } => self.binary(left, op.symbol(), right),
            IrKind::Equality {
                left,
                right,
                negated,
            } => self.binary(left, if *negated { "!=" } else { "==" }, right),

            IrKind::StringLength { target } => self.method(target, "length", &[]),
            IrKind::StringMatches { target, pattern } => self.method(target, "matches", &[pattern]),
            IrKind::StringPredicate {
                op,
                target,
                argument,
            } => self.method(target, op.method(), &[argument]),

            IrKind::Between {
                value,
                low,
                high,
                inclusive,
            } => {
                let op = if *inclusive { " <= " } else { " < " };
                self.push("(");
                self.expr(low);
                self.push(op);
                self.expr(value);
                self.push(op);
                self.expr(high);
                self.push(")");
            }
            IrKind::InSet {
                value,
                set,
                negated,
            } => {
                self.push("(");
                self.expr(value);
                self.push(if *negated { " not in [" } else { " in [" });
                self.separated(set, ", ");
                self.push("])");
            }

            IrKind::And(operands) => {
                self.push("(");
                self.separated(operands, " && ");
                self.push(")");
            }
            IrKind::Or(operands) => {
                self.push("(");
                self.separated(operands, " || ");
                self.push(")");
            }
            IrKind::Not(inner) => {
                self.push("(!");
                self.expr(inner);
                self.push(")");
            }
            IrKind::Implies {
                antecedent,
                consequent,
            } => self.binary(antecedent, "implies", consequent),

            IrKind::ArrayLength { array } => self.method(array, "size", &[]),
            IrKind::ArrayIncludes { array, element } => self.method(array, "contains", &[element]),
            IrKind::ArrayIter {
                op,
                array,
                variable,
                body,
            } => {
                self.expr(array);
                let _ = write!(self.out, ".{}({} => ", op.method(), variable);
                self.expr(body);
                self.push(")");
            }

            IrKind::Quantifier {
                quantifier,
                collection,
                variable,
                predicate,
            } => {
                let _ = write!(self.out, "{}({} in ", quantifier.keyword(), variable);
                self.expr(collection);
                self.push(": ");
                self.expr(predicate);
                self.push(")");
            }

            IrKind::Arithmetic { op, left, right } => self.binary(left, op.symbol(), right),
            IrKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                self.push("(");
                self.expr(condition);
                self.push(" ? ");
                self.expr(then_branch);
                self.push(" : ");
                self.expr(else_branch);
                self.push(")");
            }

            IrKind::Old(inner) => {
                self.push("old(");
                self.expr(inner);
                self.push(")");
            }
            IrKind::Result(property) => {
                self.push("result");
                if let Some(property) = property {
                    self.push(".");
                    self.push(property);
                }
            }
            IrKind::Input(property) => {
                self.push("input.");
                self.push(property);
            }

            IrKind::Call { function, args } => {
                self.push(function);
                self.push("(");
                self.separated(args, ", ");
                self.push(")");
            }

            IrKind::Entity {
                op,
                entity,
                criteria,
            } => {
                let _ = write!(self.out, "{}.{}(", entity, op.method());
                if let Some(criteria) = criteria {
                    self.expr(criteria);
                }
                self.push(")");
            }
        }
    }
}
