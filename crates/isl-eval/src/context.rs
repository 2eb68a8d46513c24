//! The state an expression is evaluated against.

use chrono::{DateTime, Utc};
use smol_str::SmolStr;

use crate::{EntityQuery, Environment, StateHandle, Value};

/// Everything a contract expression may observe.
///
/// Preconditions see only the input and the live store. Postconditions and
/// invariants additionally see the result and the pre-execution snapshot.
pub struct EvaluationContext<'a> {
    input: Value,
    result: Option<Value>,
    snapshot: Option<&'a StateHandle>,
    store: &'a dyn EntityQuery,
    variables: Environment<'static>,
    now: DateTime<Utc>,
}

impl<'a> EvaluationContext<'a> {
    /// A context reading from `store`, with an empty input and the current time.
    pub fn new(store: &'a dyn EntityQuery) -> Self {
        Self {
            input: Value::Map(Default::default()),
            result: None,
            snapshot: None,
            store,
            variables: Environment::new(),
            now: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_snapshot(mut self, snapshot: &'a StateHandle) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Bind a root-scope variable.
    pub fn with_variable(mut self, name: impl Into<SmolStr>, value: Value) -> Self {
        self.variables.define(name.into(), value);
        self
    }

    /// Pin the clock seen by `now()`.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn snapshot(&self) -> Option<&'a StateHandle> {
        self.snapshot
    }

    pub fn store(&self) -> &'a dyn EntityQuery {
        self.store
    }

    pub fn variables(&self) -> &Environment<'static> {
        &self.variables
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
