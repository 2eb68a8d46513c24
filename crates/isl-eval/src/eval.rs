//! Expression evaluation.

use isl_ir::{
    ArithOp, ArrayIterOp, CompareOp, EntityOp, IrExpr, IrKind, Quantifier, StringPredicateOp,
};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::trace;

use crate::builtins::{self, Arity, Builtin, BuiltinFn};
use crate::{
    EntityQuery, Environment, EvaluationContext, EvaluationError, Result, Value,
};

/// Default bound on expression nesting.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Evaluate `expr` with a default [`Evaluator`].
pub fn evaluate_expression(expr: &IrExpr, ctx: &EvaluationContext<'_>) -> Result<Value> {
    Evaluator::new().evaluate(expr, ctx)
}

/// Tree-walking evaluator for contract expressions.
///
/// An evaluator holds no per-evaluation state beyond a compiled-regex cache,
/// so one instance can be shared across runs and threads.
pub struct Evaluator {
    builtins: FxHashMap<SmolStr, Builtin>,
    regex_cache: Mutex<FxHashMap<(SmolStr, SmolStr), Regex>>,
    max_depth: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Store view and scope for one point in the walk.
#[derive(Clone, Copy)]
struct Frame<'f> {
    store: &'f dyn EntityQuery,
    env: &'f Environment<'f>,
    depth: usize,
}

impl Evaluator {
    /// Create an evaluator with the default builtins.
    pub fn new() -> Self {
        let mut registry = FxHashMap::default();
        builtins::register(&mut registry);
        Self {
            builtins: registry,
            regex_cache: Mutex::new(FxHashMap::default()),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Add or replace a builtin function.
    pub fn register(&mut self, name: impl Into<SmolStr>, arity: Arity, func: BuiltinFn) {
        let name = name.into();
        self.builtins.insert(
            name.clone(),
            Builtin {
                name,
                arity,
                func,
            },
        );
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Evaluate an expression to a value.
    pub fn evaluate(&self, expr: &IrExpr, ctx: &EvaluationContext<'_>) -> Result<Value> {
        let frame = Frame {
            store: ctx.store(),
            env: ctx.variables(),
            depth: 0,
        };
        self.eval(expr, ctx, frame)
    }

    /// Evaluate an expression that must produce a boolean.
    pub fn evaluate_condition(&self, expr: &IrExpr, ctx: &EvaluationContext<'_>) -> Result<bool> {
        let value = self.evaluate(expr, ctx)?;
        value
            .as_bool()
            .ok_or_else(|| EvaluationError::type_mismatch("Bool", &value, "condition"))
    }

    fn eval(&self, expr: &IrExpr, ctx: &EvaluationContext<'_>, frame: Frame<'_>) -> Result<Value> {
        if frame.depth >= self.max_depth {
            return Err(EvaluationError::RecursionLimit {
                max: self.max_depth,
            });
        }
        let inner = Frame {
            depth: frame.depth + 1,
            ..frame
        };

        match &expr.kind {
            IrKind::Null => Ok(Value::Null),
            IrKind::Bool(b) => Ok(Value::Bool(*b)),
            IrKind::Int(n) => Ok(Value::Int(*n)),
            IrKind::Float(f) => Ok(Value::Float(*f)),
            IrKind::String(s) => Ok(Value::String(s.clone())),
            // A bare regex literal only carries meaning as a `matches` argument.
            IrKind::Regex { pattern, .. } => Ok(Value::String(pattern.clone())),
            IrKind::List(items) => Ok(Value::List(self.eval_all(items, ctx, inner)?)),
            IrKind::Map(entries) => {
                let mut map = indexmap::IndexMap::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value, ctx, inner)?);
                }
                Ok(Value::Map(map))
            }

            IrKind::Variable(name) => frame
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| EvaluationError::UndefinedVariable { name: name.clone() }),
            IrKind::Property { object, property } => {
                let object = self.eval(object, ctx, inner)?;
                property_of(&object, property)
            }
            IrKind::Index { object, index } => {
                let object = self.eval(object, ctx, inner)?;
                let index = self.eval(index, ctx, inner)?;
                index_of(&object, &index)
            }

            IrKind::Existence { target, exists } => {
                let value = match &target.kind {
                    IrKind::Entity {
                        op: EntityOp::Lookup,
                        entity,
                        criteria,
                    } => self.lookup(entity, criteria.as_deref(), ctx, inner)?,
                    _ => self.eval(target, ctx, inner)?,
                };
                Ok(Value::Bool(value.is_null() != *exists))
            }
            IrKind::Comparison { op, left, right } => {
                let left = self.eval(left, ctx, inner)?;
                let right = self.eval(right, ctx, inner)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            IrKind::Equality {
                left,
                right,
                negated,
            } => {
                let left = self.eval(left, ctx, inner)?;
                let right = self.eval(right, ctx, inner)?;
                Ok(Value::Bool((left == right) != *negated))
            }

            IrKind::StringLength { target } => {
                let target = self.eval(target, ctx, inner)?;
                let s = expect_str(&target, "length()")?;
                Ok(Value::Int(s.chars().count() as i64))
            }
            IrKind::StringMatches { target, pattern } => {
                let target = self.eval(target, ctx, inner)?;
                let text = expect_str(&target, "matches()")?;
                let regex = match &pattern.kind {
                    IrKind::Regex { pattern, flags } => self.regex(pattern, flags)?,
                    _ => {
                        let pattern = self.eval(pattern, ctx, inner)?;
                        self.regex(expect_str(&pattern, "matches() pattern")?, "")?
                    }
                };
                Ok(Value::Bool(regex.is_match(text)))
            }
            IrKind::StringPredicate {
                op,
                target,
                argument,
            } => {
                let target = self.eval(target, ctx, inner)?;
                let argument = self.eval(argument, ctx, inner)?;
                let context = op.method();
                let s = expect_str(&target, context)?;
                let arg = expect_str(&argument, context)?;
                Ok(Value::Bool(match op {
                    StringPredicateOp::Includes => s.contains(arg),
                    StringPredicateOp::StartsWith => s.starts_with(arg),
                    StringPredicateOp::EndsWith => s.ends_with(arg),
                }))
            }

            IrKind::Between {
                value,
                low,
                high,
                inclusive,
            } => {
                let value = self.eval(value, ctx, inner)?;
                let low = self.eval(low, ctx, inner)?;
                let high = self.eval(high, ctx, inner)?;
                let op = if *inclusive {
                    CompareOp::Le
                } else {
                    CompareOp::Lt
                };
                Ok(Value::Bool(
                    compare(op, &low, &value)? && compare(op, &value, &high)?,
                ))
            }
            IrKind::InSet {
                value,
                set,
                negated,
            } => {
                let value = self.eval(value, ctx, inner)?;
                let mut found = false;
                for member in set {
                    if self.eval(member, ctx, inner)? == value {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }

            IrKind::And(operands) => {
                for operand in operands {
                    if !self.eval_bool(operand, ctx, inner, "&&")? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            IrKind::Or(operands) => {
                for operand in operands {
                    if self.eval_bool(operand, ctx, inner, "||")? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            IrKind::Not(operand) => Ok(Value::Bool(!self.eval_bool(operand, ctx, inner, "!")?)),
            IrKind::Implies {
                antecedent,
                consequent,
            } => {
                if !self.eval_bool(antecedent, ctx, inner, "implies")? {
                    return Ok(Value::Bool(true));
                }
                self.eval_bool(consequent, ctx, inner, "implies")
                    .map(Value::Bool)
            }

            IrKind::ArrayLength { array } => {
                let array = self.eval(array, ctx, inner)?;
                Ok(Value::Int(expect_list(&array, "size()")?.len() as i64))
            }
            IrKind::ArrayIncludes { array, element } => {
                let array = self.eval(array, ctx, inner)?;
                let element = self.eval(element, ctx, inner)?;
                Ok(Value::Bool(
                    expect_list(&array, "contains()")?.contains(&element),
                ))
            }
            IrKind::ArrayIter {
                op,
                array,
                variable,
                body,
            } => {
                let array = self.eval(array, ctx, inner)?;
                let items = expect_list(&array, op.method())?;
                self.array_iter(*op, items, variable, body, ctx, inner)
            }

            IrKind::Quantifier {
                quantifier,
                collection,
                variable,
                predicate,
            } => {
                let collection = self.eval(collection, ctx, inner)?;
                let items = expect_list(&collection, quantifier.keyword())?;
                self.quantify(*quantifier, items, variable, predicate, ctx, inner)
            }

            IrKind::Arithmetic { op, left, right } => {
                let left = self.eval(left, ctx, inner)?;
                let right = self.eval(right, ctx, inner)?;
                arithmetic(*op, left, right)
            }
            IrKind::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval_bool(condition, ctx, inner, "conditional")? {
                    self.eval(then_branch, ctx, inner)
                } else {
                    self.eval(else_branch, ctx, inner)
                }
            }

            IrKind::Old(expr) => {
                let snapshot = ctx
                    .snapshot()
                    .ok_or(EvaluationError::NoSnapshotAvailable)?;
                let pre = Frame {
                    store: snapshot,
                    ..inner
                };
                self.eval(expr, ctx, pre)
            }
            IrKind::Result(property) => {
                let result = ctx.result().ok_or(EvaluationError::NoResultAvailable)?;
                match property {
                    None => Ok(result.clone()),
                    Some(property) => property_of(result, property),
                }
            }
            IrKind::Input(property) => ctx.input().get(property).cloned().ok_or_else(|| {
                EvaluationError::UndefinedVariable {
                    name: SmolStr::from(format!("input.{}", property)),
                }
            }),

            IrKind::Call { function, args } => {
                let builtin = self.builtins.get(function).ok_or_else(|| {
                    EvaluationError::UnknownFunction {
                        name: function.clone(),
                    }
                })?;
                if !builtin.arity.accepts(args.len()) {
                    return Err(EvaluationError::ArityMismatch {
                        function: function.clone(),
                        expected: builtin.arity,
                        got: args.len(),
                    });
                }
                let args = self.eval_all(args, ctx, inner)?;
                (builtin.func)(&args, ctx)
            }

            IrKind::Entity {
                op,
                entity,
                criteria,
            } => {
                let criteria_value = match criteria {
                    Some(c) => Some(self.eval(c, ctx, inner)?),
                    None => None,
                };
                let criteria_ref = criteria_value.as_ref();
                match op {
                    EntityOp::Exists => Ok(Value::Bool(frame.store.exists(entity, criteria_ref)?)),
                    EntityOp::Count => Ok(Value::Int(frame.store.count(entity, criteria_ref)? as i64)),
                    EntityOp::Lookup => match frame.store.lookup(entity, criteria_ref)? {
                        Some(record) => Ok(Value::Map(record)),
                        None => Err(EvaluationError::EntityNotFound {
                            entity: entity.clone(),
                            criteria: criteria_ref
                                .map(Value::to_string)
                                .unwrap_or_else(|| "any".to_string()),
                        }),
                    },
                }
            }
        }
    }

    fn eval_all(
        &self,
        exprs: &[IrExpr],
        ctx: &EvaluationContext<'_>,
        frame: Frame<'_>,
    ) -> Result<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e, ctx, frame)).collect()
    }

    fn eval_bool(
        &self,
        expr: &IrExpr,
        ctx: &EvaluationContext<'_>,
        frame: Frame<'_>,
        context: &str,
    ) -> Result<bool> {
        let value = self.eval(expr, ctx, frame)?;
        value
            .as_bool()
            .ok_or_else(|| EvaluationError::type_mismatch("Bool", &value, context))
    }

    /// Entity lookup where a missing record is `Null`.
    fn lookup(
        &self,
        entity: &str,
        criteria: Option<&IrExpr>,
        ctx: &EvaluationContext<'_>,
        frame: Frame<'_>,
    ) -> Result<Value> {
        let criteria = match criteria {
            Some(c) => Some(self.eval(c, ctx, frame)?),
            None => None,
        };
        Ok(frame
            .store
            .lookup(entity, criteria.as_ref())?
            .map(Value::Map)
            .unwrap_or(Value::Null))
    }

    fn array_iter(
        &self,
        op: ArrayIterOp,
        items: &[Value],
        variable: &SmolStr,
        body: &IrExpr,
        ctx: &EvaluationContext<'_>,
        frame: Frame<'_>,
    ) -> Result<Value> {
        let context = op.method();
        match op {
            ArrayIterOp::Every => {
                for item in items {
                    if !self.eval_bound(variable, item, body, ctx, frame, context)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            ArrayIterOp::Some => {
                for item in items {
                    if self.eval_bound(variable, item, body, ctx, frame, context)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            ArrayIterOp::Filter => {
                let mut kept = Vec::new();
                for item in items {
                    if self.eval_bound(variable, item, body, ctx, frame, context)? {
                        kept.push(item.clone());
                    }
                }
                Ok(Value::List(kept))
            }
            ArrayIterOp::Map => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    let env = Environment::bind(frame.env, variable.clone(), item.clone());
                    mapped.push(self.eval(body, ctx, Frame { env: &env, ..frame })?);
                }
                Ok(Value::List(mapped))
            }
        }
    }

    fn quantify(
        &self,
        quantifier: Quantifier,
        items: &[Value],
        variable: &SmolStr,
        predicate: &IrExpr,
        ctx: &EvaluationContext<'_>,
        frame: Frame<'_>,
    ) -> Result<Value> {
        let context = quantifier.keyword();
        match quantifier {
            Quantifier::All => {
                for item in items {
                    if !self.eval_bound(variable, item, predicate, ctx, frame, context)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Quantifier::Any => {
                for item in items {
                    if self.eval_bound(variable, item, predicate, ctx, frame, context)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Quantifier::None => {
                for item in items {
                    if self.eval_bound(variable, item, predicate, ctx, frame, context)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Quantifier::Count => {
                let mut count = 0i64;
                for item in items {
                    if self.eval_bound(variable, item, predicate, ctx, frame, context)? {
                        count += 1;
                    }
                }
                Ok(Value::Int(count))
            }
        }
    }

    /// Evaluate a boolean body with `variable` bound to `item`.
    fn eval_bound(
        &self,
        variable: &SmolStr,
        item: &Value,
        body: &IrExpr,
        ctx: &EvaluationContext<'_>,
        frame: Frame<'_>,
        context: &str,
    ) -> Result<bool> {
        let env = Environment::bind(frame.env, variable.clone(), item.clone());
        self.eval_bool(body, ctx, Frame { env: &env, ..frame }, context)
    }

    fn regex(&self, pattern: &str, flags: &str) -> Result<Regex> {
        let key = (SmolStr::new(pattern), SmolStr::new(flags));
        let mut cache = self.regex_cache.lock();
        if let Some(regex) = cache.get(&key) {
            return Ok(regex.clone());
        }

        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                other => {
                    return Err(EvaluationError::InvalidPattern {
                        pattern: pattern.into(),
                        message: format!("unsupported flag `{}`", other),
                    })
                }
            };
        }
        let regex = builder
            .build()
            .map_err(|e| EvaluationError::InvalidPattern {
                pattern: pattern.into(),
                message: e.to_string(),
            })?;
        trace!(pattern, flags, "compiled pattern");
        cache.insert(key, regex.clone());
        Ok(regex)
    }
}

fn expect_str<'v>(value: &'v Value, context: &str) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| EvaluationError::type_mismatch("String", value, context))
}

fn expect_list<'v>(value: &'v Value, context: &str) -> Result<&'v [Value]> {
    value
        .as_list()
        .ok_or_else(|| EvaluationError::type_mismatch("List", value, context))
}

fn property_of(object: &Value, property: &str) -> Result<Value> {
    match object {
        Value::Map(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        other => Err(EvaluationError::type_mismatch(
            "Map",
            other,
            format!(".{}", property),
        )),
    }
}

fn index_of(object: &Value, index: &Value) -> Result<Value> {
    match (object, index) {
        (Value::List(items), Value::Int(i)) => {
            if *i < 0 {
                return Err(EvaluationError::UnsupportedOperation {
                    message: format!("negative list index {}", i),
                });
            }
            Ok(items.get(*i as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::List(_), other) => Err(EvaluationError::type_mismatch("Int", other, "list index")),
        (Value::Map(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::Map(_), other) => Err(EvaluationError::type_mismatch("String", other, "map key")),
        (other, _) => Err(EvaluationError::type_mismatch("List or Map", other, "index")),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    let context = op.symbol();
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        return Ok(match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        });
    }
    let a = left
        .as_float()
        .ok_or_else(|| EvaluationError::type_mismatch("number", left, context))?;
    let b = right
        .as_float()
        .ok_or_else(|| EvaluationError::type_mismatch("number", right, context))?;
    Ok(match op {
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    })
}

fn arithmetic(op: ArithOp, left: Value, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_arithmetic(op, a, b),
        (Value::String(a), Value::String(b)) if op == ArithOp::Add => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(&a);
            joined.push_str(&b);
            Ok(Value::String(joined.into()))
        }
        (left, right) => {
            let context = op.symbol();
            let a = left
                .as_float()
                .ok_or_else(|| EvaluationError::type_mismatch("number", &left, context))?;
            let b = right
                .as_float()
                .ok_or_else(|| EvaluationError::type_mismatch("number", &right, context))?;
            float_arithmetic(op, a, b)
        }
    }
}

fn int_arithmetic(op: ArithOp, a: i64, b: i64) -> Result<Value> {
    let checked = match op {
        ArithOp::Add => a.checked_add(b),
        ArithOp::Sub => a.checked_sub(b),
        ArithOp::Mul => a.checked_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(EvaluationError::DivisionByZero);
            }
            match a.checked_rem(b) {
                Some(0) => a.checked_div(b),
                _ => return Ok(Value::Float(a as f64 / b as f64)),
            }
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(EvaluationError::DivisionByZero);
            }
            Some(a.wrapping_rem(b))
        }
    };
    match checked {
        Some(n) => Ok(Value::Int(n)),
        None => float_arithmetic(op, a as f64, b as f64),
    }
}

fn float_arithmetic(op: ArithOp, a: f64, b: f64) -> Result<Value> {
    let n = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div | ArithOp::Mod if b == 0.0 => return Err(EvaluationError::DivisionByZero),
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    };
    Ok(Value::Float(n))
}
