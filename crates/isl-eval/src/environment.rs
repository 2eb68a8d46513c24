//! Variable scopes for contract evaluation.

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::Value;

/// Variable bindings with an optional borrowed parent scope.
///
/// Scopes are never mutated once handed to the evaluator: entering a
/// quantifier or array operation body creates a child that borrows its
/// parent for the duration of the body.
#[derive(Debug, Default)]
pub struct Environment<'p> {
    values: FxHashMap<SmolStr, Value>,
    parent: Option<&'p Environment<'p>>,
}

impl<'p> Environment<'p> {
    /// Create a new empty root scope.
    pub fn new() -> Self {
        Environment {
            values: FxHashMap::default(),
            parent: None,
        }
    }

    /// Create a child scope that falls back to `parent`.
    pub fn with_parent(parent: &'p Environment<'p>) -> Self {
        Environment {
            values: FxHashMap::default(),
            parent: Some(parent),
        }
    }

    /// Child scope holding a single binding.
    pub fn bind(parent: &'p Environment<'p>, name: SmolStr, value: Value) -> Self {
        let mut env = Self::with_parent(parent);
        env.define(name, value);
        env
    }

    /// Define a variable in this scope, shadowing any outer binding.
    pub fn define(&mut self, name: SmolStr, value: Value) {
        self.values.insert(name, value);
    }

    /// Look a variable up, searching outward through parent scopes.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(value) => Some(value),
            None => self.parent.and_then(|p| p.get(name)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of scopes from here to the root, inclusive.
    pub fn depth(&self) -> usize {
        1 + self.parent.map_or(0, |p| p.depth())
    }
}
