//! Built-in functions callable from contract expressions.

use std::fmt;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::{EvaluationContext, EvaluationError, Result, Value};

/// Signature of a builtin implementation.
pub type BuiltinFn = fn(&[Value], &EvaluationContext<'_>) -> Result<Value>;

/// Accepted argument count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, got: usize) -> bool {
        match self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// A named builtin with its arity.
#[derive(Clone)]
pub struct Builtin {
    pub name: SmolStr,
    pub arity: Arity,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

/// Register all default builtins.
pub(crate) fn register(registry: &mut FxHashMap<SmolStr, Builtin>) {
    let mut add = |name: &str, arity: Arity, func: BuiltinFn| {
        registry.insert(
            SmolStr::new(name),
            Builtin {
                name: SmolStr::new(name),
                arity,
                func,
            },
        );
    };

    // Time
    add("now", Arity::Exact(0), builtin_now);

    // Math
    add("abs", Arity::Exact(1), builtin_abs);
    add("min", Arity::AtLeast(1), builtin_min);
    add("max", Arity::AtLeast(1), builtin_max);
    add("floor", Arity::Exact(1), builtin_floor);
    add("ceil", Arity::Exact(1), builtin_ceil);
    add("round", Arity::Exact(1), builtin_round);

    // Strings and collections
    add("len", Arity::Exact(1), builtin_len);
    add("lower", Arity::Exact(1), builtin_lower);
    add("upper", Arity::Exact(1), builtin_upper);
    add("trim", Arity::Exact(1), builtin_trim);
    add("is_empty", Arity::Exact(1), builtin_is_empty);
    add("keys", Arity::Exact(1), builtin_keys);
    add("values", Arity::Exact(1), builtin_values);
    add("contains_key", Arity::Exact(2), builtin_contains_key);
}

/// Milliseconds since the Unix epoch, from the context clock.
fn builtin_now(_args: &[Value], ctx: &EvaluationContext<'_>) -> Result<Value> {
    Ok(Value::Int(ctx.now().timestamp_millis()))
}

fn builtin_abs(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    match &args[0] {
        Value::Int(n) => Ok(n
            .checked_abs()
            .map(Value::Int)
            .unwrap_or(Value::Float((*n as f64).abs()))),
        Value::Float(n) => Ok(Value::Float(n.abs())),
        other => Err(EvaluationError::type_mismatch("number", other, "abs()")),
    }
}

/// `min(a, b, ...)` or `min(list)`.
fn extremum(args: &[Value], name: &str, pick_left: fn(f64, f64) -> bool) -> Result<Value> {
    let items = match args {
        [Value::List(items)] => items.as_slice(),
        _ => args,
    };
    let mut best: Option<&Value> = None;
    for item in items {
        let n = item
            .as_float()
            .ok_or_else(|| EvaluationError::type_mismatch("number", item, format!("{}()", name)))?;
        best = match best {
            Some(current) if current.as_float().is_some_and(|c| pick_left(c, n)) => Some(current),
            _ => Some(item),
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn builtin_min(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    extremum(args, "min", |current, next| current <= next)
}

fn builtin_max(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    extremum(args, "max", |current, next| current >= next)
}

fn rounding(value: &Value, name: &str, op: fn(f64) -> f64) -> Result<Value> {
    match value {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(f) => {
            let rounded = op(*f);
            if rounded.is_finite() && rounded.abs() < i64::MAX as f64 {
                Ok(Value::Int(rounded as i64))
            } else {
                Ok(Value::Float(rounded))
            }
        }
        other => Err(EvaluationError::type_mismatch("number", other, format!("{}()", name))),
    }
}

fn builtin_floor(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    rounding(&args[0], "floor", f64::floor)
}

fn builtin_ceil(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    rounding(&args[0], "ceil", f64::ceil)
}

fn builtin_round(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    rounding(&args[0], "round", f64::round)
}

fn builtin_len(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    match &args[0] {
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        Value::Map(map) => Ok(Value::Int(map.len() as i64)),
        other => Err(EvaluationError::type_mismatch("String, List or Map", other, "len()")),
    }
}

fn string_arg<'v>(value: &'v Value, name: &str) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| EvaluationError::type_mismatch("String", value, format!("{}()", name)))
}

fn builtin_lower(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    Ok(Value::from(string_arg(&args[0], "lower")?.to_lowercase().as_str()))
}

fn builtin_upper(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    Ok(Value::from(string_arg(&args[0], "upper")?.to_uppercase().as_str()))
}

fn builtin_trim(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    Ok(Value::from(string_arg(&args[0], "trim")?.trim()))
}

fn builtin_is_empty(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    let empty = match &args[0] {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::List(items) => items.is_empty(),
        Value::Map(map) => map.is_empty(),
        other => {
            return Err(EvaluationError::type_mismatch(
                "String, List or Map",
                other,
                "is_empty()",
            ))
        }
    };
    Ok(Value::Bool(empty))
}

fn map_arg<'v>(
    value: &'v Value,
    name: &str,
) -> Result<&'v indexmap::IndexMap<SmolStr, Value>> {
    value
        .as_map()
        .ok_or_else(|| EvaluationError::type_mismatch("Map", value, format!("{}()", name)))
}

fn builtin_keys(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    let map = map_arg(&args[0], "keys")?;
    Ok(Value::List(map.keys().cloned().map(Value::String).collect()))
}

fn builtin_values(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    let map = map_arg(&args[0], "values")?;
    Ok(Value::List(map.values().cloned().collect()))
}

fn builtin_contains_key(args: &[Value], _ctx: &EvaluationContext<'_>) -> Result<Value> {
    let map = map_arg(&args[0], "contains_key")?;
    let key = string_arg(&args[1], "contains_key")?;
    Ok(Value::Bool(map.contains_key(key)))
}
