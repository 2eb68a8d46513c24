//! IR construction.
//!
//! The builder owns the node id counter for one build. Two builders never
//! share state, so lowering is reproducible across threads and processes.

use crate::{
    ArithOp, ArrayIterOp, CompareOp, EntityOp, IrError, IrExpr, IrKind, NodeId, Quantifier,
    SmolStr, StringPredicateOp, RESERVED_NAMES,
};

/// Constructs IR nodes, assigning each a fresh [`NodeId`].
#[derive(Debug, Default)]
pub struct IrBuilder {
    next_id: u32,
    max_depth: Option<usize>,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the depth accepted by [`IrBuilder::finish`].
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    /// Number of nodes allocated so far.
    pub fn allocated(&self) -> u32 {
        self.next_id
    }

    pub(crate) fn node(&mut self, kind: IrKind) -> IrExpr {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        IrExpr {
            kind,
            id,
            span: None,
        }
    }

    /// Validate a completed tree against the configured depth bound.
    pub fn finish(&self, expr: IrExpr) -> Result<IrExpr, IrError> {
        if let Some(max) = self.max_depth {
            let depth = expr.depth();
            if depth > max {
                return Err(IrError::TooDeep { depth, max });
            }
        }
        Ok(expr)
    }

    fn binding(name: impl Into<SmolStr>) -> Result<SmolStr, IrError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IrError::EmptyBinding);
        }
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(IrError::ReservedBinding { name });
        }
        Ok(name)
    }

    // Literals

    pub fn null(&mut self) -> IrExpr {
        self.node(IrKind::Null)
    }

    pub fn bool(&mut self, value: bool) -> IrExpr {
        self.node(IrKind::Bool(value))
    }

    pub fn int(&mut self, value: i64) -> IrExpr {
        self.node(IrKind::Int(value))
    }

    pub fn float(&mut self, value: f64) -> IrExpr {
        self.node(IrKind::Float(value))
    }

    pub fn string(&mut self, value: impl Into<SmolStr>) -> IrExpr {
        self.node(IrKind::String(value.into()))
    }

    pub fn regex(&mut self, pattern: impl Into<SmolStr>, flags: impl Into<SmolStr>) -> IrExpr {
        self.node(IrKind::Regex {
            pattern: pattern.into(),
            flags: flags.into(),
        })
    }

    pub fn list(&mut self, items: Vec<IrExpr>) -> IrExpr {
        self.node(IrKind::List(items))
    }

    pub fn map<K: Into<SmolStr>>(&mut self, entries: Vec<(K, IrExpr)>) -> IrExpr {
        let entries = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.node(IrKind::Map(entries))
    }

    // Access

    pub fn var(&mut self, name: impl Into<SmolStr>) -> IrExpr {
        self.node(IrKind::Variable(name.into()))
    }

    pub fn property(&mut self, object: IrExpr, property: impl Into<SmolStr>) -> IrExpr {
        self.node(IrKind::Property {
            object: Box::new(object),
            property: property.into(),
        })
    }

    /// Chain property accesses: `path(obj, ["a", "b"])` is `obj.a.b`.
    pub fn path(&mut self, object: IrExpr, properties: &[&str]) -> IrExpr {
        properties
            .iter()
            .fold(object, |acc, prop| self.property(acc, *prop))
    }

    pub fn index(&mut self, object: IrExpr, index: IrExpr) -> IrExpr {
        self.node(IrKind::Index {
            object: Box::new(object),
            index: Box::new(index),
        })
    }

    // Tests

    /// `target != null`
    pub fn exists(&mut self, target: IrExpr) -> IrExpr {
        self.existence(target, true)
    }

    /// `target == null`
    pub fn is_null(&mut self, target: IrExpr) -> IrExpr {
        self.existence(target, false)
    }

    pub fn existence(&mut self, target: IrExpr, exists: bool) -> IrExpr {
        self.node(IrKind::Existence {
            target: Box::new(target),
            exists,
        })
    }

    pub fn compare(&mut self, op: CompareOp, left: IrExpr, right: IrExpr) -> IrExpr {
        self.node(IrKind::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn eq(&mut self, left: IrExpr, right: IrExpr) -> IrExpr {
        self.equality(left, right, false)
    }

    pub fn ne(&mut self, left: IrExpr, right: IrExpr) -> IrExpr {
        self.equality(left, right, true)
    }

    pub fn equality(&mut self, left: IrExpr, right: IrExpr, negated: bool) -> IrExpr {
        self.node(IrKind::Equality {
            left: Box::new(left),
            right: Box::new(right),
            negated,
        })
    }

    // Strings

    pub fn string_length(&mut self, target: IrExpr) -> IrExpr {
        self.node(IrKind::StringLength {
            target: Box::new(target),
        })
    }

    pub fn matches(&mut self, target: IrExpr, pattern: IrExpr) -> IrExpr {
        self.node(IrKind::StringMatches {
            target: Box::new(target),
            pattern: Box::new(pattern),
        })
    }

    pub fn string_predicate(
        &mut self,
        op: StringPredicateOp,
        target: IrExpr,
        argument: IrExpr,
    ) -> IrExpr {
        self.node(IrKind::StringPredicate {
            op,
            target: Box::new(target),
            argument: Box::new(argument),
        })
    }

    pub fn includes(&mut self, target: IrExpr, needle: IrExpr) -> IrExpr {
        self.string_predicate(StringPredicateOp::Includes, target, needle)
    }

    pub fn starts_with(&mut self, target: IrExpr, prefix: IrExpr) -> IrExpr {
        self.string_predicate(StringPredicateOp::StartsWith, target, prefix)
    }

    pub fn ends_with(&mut self, target: IrExpr, suffix: IrExpr) -> IrExpr {
        self.string_predicate(StringPredicateOp::EndsWith, target, suffix)
    }

    // Ranges and sets

    pub fn between(&mut self, value: IrExpr, low: IrExpr, high: IrExpr, inclusive: bool) -> IrExpr {
        self.node(IrKind::Between {
            value: Box::new(value),
            low: Box::new(low),
            high: Box::new(high),
            inclusive,
        })
    }

    pub fn in_set(&mut self, value: IrExpr, set: Vec<IrExpr>) -> IrExpr {
        self.set_membership(value, set, false)
    }

    pub fn not_in_set(&mut self, value: IrExpr, set: Vec<IrExpr>) -> IrExpr {
        self.set_membership(value, set, true)
    }

    pub fn set_membership(&mut self, value: IrExpr, set: Vec<IrExpr>, negated: bool) -> IrExpr {
        self.node(IrKind::InSet {
            value: Box::new(value),
            set,
            negated,
        })
    }

    // Boolean logic

    pub fn and(&mut self, operands: Vec<IrExpr>) -> IrExpr {
        self.node(IrKind::And(operands))
    }

    pub fn or(&mut self, operands: Vec<IrExpr>) -> IrExpr {
        self.node(IrKind::Or(operands))
    }

    pub fn not(&mut self, operand: IrExpr) -> IrExpr {
        self.node(IrKind::Not(Box::new(operand)))
    }

    pub fn implies(&mut self, antecedent: IrExpr, consequent: IrExpr) -> IrExpr {
        self.node(IrKind::Implies {
            antecedent: Box::new(antecedent),
            consequent: Box::new(consequent),
        })
    }

    // Arrays

    pub fn array_length(&mut self, array: IrExpr) -> IrExpr {
        self.node(IrKind::ArrayLength {
            array: Box::new(array),
        })
    }

    pub fn array_includes(&mut self, array: IrExpr, element: IrExpr) -> IrExpr {
        self.node(IrKind::ArrayIncludes {
            array: Box::new(array),
            element: Box::new(element),
        })
    }

    pub fn array_iter(
        &mut self,
        op: ArrayIterOp,
        array: IrExpr,
        variable: impl Into<SmolStr>,
        body: IrExpr,
    ) -> Result<IrExpr, IrError> {
        let variable = Self::binding(variable)?;
        Ok(self.node(IrKind::ArrayIter {
            op,
            array: Box::new(array),
            variable,
            body: Box::new(body),
        }))
    }

    pub fn every(
        &mut self,
        array: IrExpr,
        variable: impl Into<SmolStr>,
        body: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.array_iter(ArrayIterOp::Every, array, variable, body)
    }

    pub fn some(
        &mut self,
        array: IrExpr,
        variable: impl Into<SmolStr>,
        body: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.array_iter(ArrayIterOp::Some, array, variable, body)
    }

    pub fn filter(
        &mut self,
        array: IrExpr,
        variable: impl Into<SmolStr>,
        body: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.array_iter(ArrayIterOp::Filter, array, variable, body)
    }

    /// `array.map(variable => body)`; named apart from the [`IrBuilder::map`] literal.
    pub fn map_items(
        &mut self,
        array: IrExpr,
        variable: impl Into<SmolStr>,
        body: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.array_iter(ArrayIterOp::Map, array, variable, body)
    }

    // Quantifiers

    pub fn quantifier(
        &mut self,
        quantifier: Quantifier,
        collection: IrExpr,
        variable: impl Into<SmolStr>,
        predicate: IrExpr,
    ) -> Result<IrExpr, IrError> {
        let variable = Self::binding(variable)?;
        Ok(self.node(IrKind::Quantifier {
            quantifier,
            collection: Box::new(collection),
            variable,
            predicate: Box::new(predicate),
        }))
    }

    pub fn all(
        &mut self,
        collection: IrExpr,
        variable: impl Into<SmolStr>,
        predicate: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.quantifier(Quantifier::All, collection, variable, predicate)
    }

    pub fn any(
        &mut self,
        collection: IrExpr,
        variable: impl Into<SmolStr>,
        predicate: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.quantifier(Quantifier::Any, collection, variable, predicate)
    }

    pub fn none(
        &mut self,
        collection: IrExpr,
        variable: impl Into<SmolStr>,
        predicate: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.quantifier(Quantifier::None, collection, variable, predicate)
    }

    pub fn count(
        &mut self,
        collection: IrExpr,
        variable: impl Into<SmolStr>,
        predicate: IrExpr,
    ) -> Result<IrExpr, IrError> {
        self.quantifier(Quantifier::Count, collection, variable, predicate)
    }

    // Arithmetic and control

    pub fn arith(&mut self, op: ArithOp, left: IrExpr, right: IrExpr) -> IrExpr {
        self.node(IrKind::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn conditional(&mut self, condition: IrExpr, then_branch: IrExpr, else_branch: IrExpr) -> IrExpr {
        self.node(IrKind::Conditional {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    // Special forms

    pub fn old(&mut self, expr: IrExpr) -> IrExpr {
        self.node(IrKind::Old(Box::new(expr)))
    }

    /// The whole behavior result.
    pub fn result(&mut self) -> IrExpr {
        self.node(IrKind::Result(None))
    }

    pub fn result_property(&mut self, property: impl Into<SmolStr>) -> IrExpr {
        self.node(IrKind::Result(Some(property.into())))
    }

    pub fn input(&mut self, property: impl Into<SmolStr>) -> IrExpr {
        self.node(IrKind::Input(property.into()))
    }

    pub fn call(&mut self, function: impl Into<SmolStr>, args: Vec<IrExpr>) -> IrExpr {
        self.node(IrKind::Call {
            function: function.into(),
            args,
        })
    }

    // Entities

    pub fn entity(
        &mut self,
        op: EntityOp,
        entity: impl Into<SmolStr>,
        criteria: Option<IrExpr>,
    ) -> IrExpr {
        self.node(IrKind::Entity {
            op,
            entity: entity.into(),
            criteria: criteria.map(Box::new),
        })
    }

    pub fn entity_exists(&mut self, entity: impl Into<SmolStr>, criteria: Option<IrExpr>) -> IrExpr {
        self.entity(EntityOp::Exists, entity, criteria)
    }

    pub fn entity_lookup(&mut self, entity: impl Into<SmolStr>, criteria: Option<IrExpr>) -> IrExpr {
        self.entity(EntityOp::Lookup, entity, criteria)
    }

    pub fn entity_count(&mut self, entity: impl Into<SmolStr>, criteria: Option<IrExpr>) -> IrExpr {
        self.entity(EntityOp::Count, entity, criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_fresh_per_node() {
        let mut b = IrBuilder::new();
        let first = b.int(1);
        let second = b.int(1);

        assert_eq!(first, second);
        assert_ne!(first.id, second.id);
        assert_eq!(b.allocated(), 2);
    }

    #[test]
    fn test_builders_are_independent() {
        let mut left = IrBuilder::new();
        let mut right = IrBuilder::new();

        assert_eq!(left.null().id, right.null().id);
    }

    #[test]
    fn test_reserved_binding_rejected() {
        let mut b = IrBuilder::new();
        let items = b.list(vec![]);
        let body = b.bool(true);

        let err = b.all(items, "result", body).unwrap_err();
        assert_eq!(err, IrError::ReservedBinding { name: "result".into() });
    }

    #[test]
    fn test_empty_binding_rejected() {
        let mut b = IrBuilder::new();
        let items = b.list(vec![]);
        let body = b.bool(true);

        let err = b.array_iter(ArrayIterOp::Every, items, "", body).unwrap_err();
        assert_eq!(err, IrError::EmptyBinding);
    }

    #[test]
    fn test_finish_enforces_depth() {
        let mut b = IrBuilder::new().with_max_depth(3);
        let mut expr = b.var("x");
        for _ in 0..3 {
            expr = b.not(expr);
        }

        assert_eq!(b.finish(expr).unwrap_err(), IrError::TooDeep { depth: 4, max: 3 });
    }

    #[test]
    fn test_path_chains_properties() {
        let mut b = IrBuilder::new();
        let result = b.result();
        let path = b.path(result, &["session", "userId"]);

        assert_eq!(path.to_string(), "result.session.userId");
    }
}
