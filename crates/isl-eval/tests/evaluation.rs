//! Integration tests for contract evaluation.
//!
//! These tests build IR the way a front-end would and evaluate it against
//! an in-memory entity store.

use chrono::{TimeZone, Utc};
use isl_eval::{
    evaluate_expression, EntityStore, EvaluationContext, EvaluationError, InMemoryStore, Record,
    Value,
};
use isl_ir::{CompareOp, IrBuilder, IrExpr};
use pretty_assertions::assert_eq;
use serde_json::json;

fn user(email: &str, status: &str, failed_attempts: i64) -> Record {
    let mut record = Record::new();
    record.insert("email".into(), email.into());
    record.insert("status".into(), status.into());
    record.insert("failed_attempts".into(), Value::Int(failed_attempts));
    record
}

fn seeded_store() -> InMemoryStore {
    let mut store = InMemoryStore::new().with_entity("Session");
    store
        .create("User", user("ada@example.com", "ACTIVE", 0))
        .unwrap();
    store
}

fn eval_with_input(expr: &IrExpr, input: serde_json::Value) -> Result<Value, EvaluationError> {
    let store = seeded_store();
    let ctx = EvaluationContext::new(&store).with_input(input.into());
    evaluate_expression(expr, &ctx)
}

// ============================================================================
// Quantifiers and array operations
// ============================================================================

mod quantifiers {
    use super::*;
    use pretty_assertions::assert_eq;

    fn positive_qty(b: &mut IrBuilder) -> IrExpr {
        let item = b.var("item");
        let qty = b.property(item, "qty");
        let zero = b.int(0);
        b.compare(CompareOp::Gt, qty, zero)
    }

    #[test]
    fn test_vacuous_truth_on_empty_collection() {
        let mut b = IrBuilder::new();
        let pred = positive_qty(&mut b);
        let items = b.input("items");
        let all = b.all(items.clone(), "item", pred.clone()).unwrap();
        let any = b.any(items.clone(), "item", pred.clone()).unwrap();
        let none = b.none(items.clone(), "item", pred.clone()).unwrap();
        let count = b.count(items, "item", pred).unwrap();

        let input = json!({"items": []});
        assert_eq!(eval_with_input(&all, input.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_input(&any, input.clone()).unwrap(), Value::Bool(false));
        assert_eq!(eval_with_input(&none, input.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_input(&count, input).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_quantifiers_over_items() {
        let mut b = IrBuilder::new();
        let pred = positive_qty(&mut b);
        let items = b.input("items");
        let all = b.all(items.clone(), "item", pred.clone()).unwrap();
        let count = b.count(items, "item", pred).unwrap();

        let input = json!({"items": [{"qty": 2}, {"qty": 0}, {"qty": 5}]});
        assert_eq!(eval_with_input(&all, input.clone()).unwrap(), Value::Bool(false));
        assert_eq!(eval_with_input(&count, input).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_filter_and_map() {
        let mut b = IrBuilder::new();
        let pred = positive_qty(&mut b);
        let items = b.input("items");
        let filtered = b.filter(items, "item", pred).unwrap();
        let item = b.var("item");
        let qty = b.property(item, "qty");
        let quantities = b.map_items(filtered, "item", qty).unwrap();

        let input = json!({"items": [{"qty": 2}, {"qty": 0}, {"qty": 5}]});
        assert_eq!(
            eval_with_input(&quantities, input).unwrap(),
            Value::List(vec![Value::Int(2), Value::Int(5)])
        );
    }

    #[test]
    fn test_non_boolean_predicate_is_type_error() {
        let mut b = IrBuilder::new();
        let items = b.input("items");
        let item = b.var("item");
        let every = b.every(items, "item", item).unwrap();

        let err = eval_with_input(&every, json!({"items": [1]})).unwrap_err();
        assert!(matches!(err, EvaluationError::TypeMismatch { expected: "Bool", .. }));
    }

    #[test]
    fn test_bound_variable_shadows_outer() {
        let mut b = IrBuilder::new();
        let inner_items = {
            let one = b.int(1);
            b.list(vec![one])
        };
        let x = b.var("x");
        let one = b.int(1);
        let body = b.eq(x, one);
        let all = b.all(inner_items, "x", body).unwrap();

        let store = InMemoryStore::new();
        let ctx = EvaluationContext::new(&store).with_variable("x", Value::Int(99));
        assert_eq!(evaluate_expression(&all, &ctx).unwrap(), Value::Bool(true));
    }
}

// ============================================================================
// Boolean logic
// ============================================================================

mod logic {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_and_short_circuits() {
        let mut b = IrBuilder::new();
        let f = b.bool(false);
        let (one, zero) = (b.int(1), b.int(0));
        let div = b.arith(isl_ir::ArithOp::Div, one.clone(), zero);
        let boom = b.eq(div, one);
        let and = b.and(vec![f, boom]);

        assert_eq!(eval_with_input(&and, json!({})).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_or_short_circuits() {
        let mut b = IrBuilder::new();
        let t = b.bool(true);
        let missing = b.var("undefined");
        let or = b.or(vec![t, missing]);

        assert_eq!(eval_with_input(&or, json!({})).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_implies() {
        let mut b = IrBuilder::new();
        let admin = b.input("admin");
        let t = b.bool(true);
        let is_admin = b.eq(admin, t);
        let level = b.input("level");
        let five = b.int(5);
        let high = b.compare(CompareOp::Ge, level, five);
        let rule = b.implies(is_admin, high);

        assert_eq!(
            eval_with_input(&rule, json!({"admin": false, "level": 1})).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_with_input(&rule, json!({"admin": true, "level": 1})).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_non_boolean_operand_is_type_error() {
        let mut b = IrBuilder::new();
        let n = b.int(1);
        let not = b.not(n);

        assert!(matches!(
            eval_with_input(&not, json!({})),
            Err(EvaluationError::TypeMismatch { .. })
        ));
    }
}

// ============================================================================
// Inputs, results and snapshots
// ============================================================================

mod special_forms {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_input_is_undefined() {
        let mut b = IrBuilder::new();
        let email = b.input("email");

        assert_eq!(
            eval_with_input(&email, json!({})).unwrap_err(),
            EvaluationError::UndefinedVariable { name: "input.email".into() }
        );
    }

    #[test]
    fn test_result_requires_result() {
        let mut b = IrBuilder::new();
        let result = b.result_property("success");

        assert_eq!(
            eval_with_input(&result, json!({})).unwrap_err(),
            EvaluationError::NoResultAvailable
        );
    }

    #[test]
    fn test_result_property_missing_is_null() {
        let mut b = IrBuilder::new();
        let token = b.result_property("token");
        let store = InMemoryStore::new();
        let ctx = EvaluationContext::new(&store).with_result(json!({"success": true}).into());

        assert_eq!(evaluate_expression(&token, &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_old_without_snapshot() {
        let mut b = IrBuilder::new();
        let count = b.entity_count("User", None);
        let old = b.old(count);

        assert_eq!(
            eval_with_input(&old, json!({})).unwrap_err(),
            EvaluationError::NoSnapshotAvailable
        );
    }

    #[test]
    fn test_old_reads_snapshot() {
        let mut store = seeded_store();
        let before = store.snapshot().unwrap();
        store
            .create("User", user("bob@example.com", "ACTIVE", 0))
            .unwrap();

        let mut b = IrBuilder::new();
        let now_count = b.entity_count("User", None);
        let then_count = b.entity_count("User", None);
        let old = b.old(then_count);
        let one = b.int(1);
        let grown = b.arith(isl_ir::ArithOp::Add, old, one);
        let rule = b.eq(now_count, grown);

        let ctx = EvaluationContext::new(&store).with_snapshot(&before);
        assert_eq!(evaluate_expression(&rule, &ctx).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_old_count_of_entity_created_during_run() {
        let mut store = seeded_store();
        let before = store.snapshot().unwrap();
        store.create("Audit", Record::new()).unwrap();

        let mut b = IrBuilder::new();
        let audits = b.entity_count("Audit", None);
        let old = b.old(audits);
        let zero = b.int(0);
        let rule = b.eq(old, zero);

        let ctx = EvaluationContext::new(&store).with_snapshot(&before);
        assert_eq!(evaluate_expression(&rule, &ctx).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_now_uses_injected_clock() {
        let mut b = IrBuilder::new();
        let now = b.call("now", vec![]);
        let store = InMemoryStore::new();
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ctx = EvaluationContext::new(&store).with_now(instant);

        assert_eq!(
            evaluate_expression(&now, &ctx).unwrap(),
            Value::Int(instant.timestamp_millis())
        );
    }
}

// ============================================================================
// Entity queries
// ============================================================================

mod entities {
    use super::*;
    use pretty_assertions::assert_eq;

    fn by_email(b: &mut IrBuilder) -> IrExpr {
        let email = b.input("email");
        b.map(vec![("email", email)])
    }

    #[test]
    fn test_lookup_property() {
        let mut b = IrBuilder::new();
        let criteria = by_email(&mut b);
        let lookup = b.entity_lookup("User", Some(criteria));
        let status = b.property(lookup, "status");

        assert_eq!(
            eval_with_input(&status, json!({"email": "ada@example.com"})).unwrap(),
            Value::from("ACTIVE")
        );
    }

    #[test]
    fn test_lookup_missing_record() {
        let mut b = IrBuilder::new();
        let criteria = by_email(&mut b);
        let lookup = b.entity_lookup("User", Some(criteria));

        assert!(matches!(
            eval_with_input(&lookup, json!({"email": "nobody@example.com"})),
            Err(EvaluationError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn test_existence_of_lookup_is_optional() {
        let mut b = IrBuilder::new();
        let criteria = by_email(&mut b);
        let lookup = b.entity_lookup("User", Some(criteria));
        let exists = b.exists(lookup);

        assert_eq!(
            eval_with_input(&exists, json!({"email": "nobody@example.com"})).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval_with_input(&exists, json!({"email": "ada@example.com"})).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_count_and_unknown_entity() {
        let mut b = IrBuilder::new();
        let sessions = b.entity_count("Session", None);
        let orders = b.entity_count("Order", None);

        assert_eq!(eval_with_input(&sessions, json!({})).unwrap(), Value::Int(0));
        assert!(matches!(
            eval_with_input(&orders, json!({})),
            Err(EvaluationError::Store(_))
        ));
    }
}

// ============================================================================
// Operators
// ============================================================================

mod operators {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_conditional_skips_untaken_branch() {
        let mut b = IrBuilder::new();
        let flag = b.input("flag");
        let one = b.int(1);
        let ghost = b.var("ghost");
        let then_safe = b.conditional(flag.clone(), one.clone(), ghost.clone());
        let else_safe = b.conditional(flag, ghost, one);

        assert_eq!(
            eval_with_input(&then_safe, json!({"flag": true})).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            eval_with_input(&else_safe, json!({"flag": false})).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            eval_with_input(&then_safe, json!({"flag": false})).unwrap_err(),
            EvaluationError::UndefinedVariable { name: "ghost".into() }
        );
    }

    #[test]
    fn test_existence_propagates_undefined_variable() {
        let mut b = IrBuilder::new();
        let ghost = b.var("ghost");
        let exists = b.exists(ghost);
        let email = b.input("email");
        let email_exists = b.exists(email);

        assert_eq!(
            eval_with_input(&exists, json!({})).unwrap_err(),
            EvaluationError::UndefinedVariable { name: "ghost".into() }
        );
        assert_eq!(
            eval_with_input(&email_exists, json!({})).unwrap_err(),
            EvaluationError::UndefinedVariable { name: "input.email".into() }
        );
        assert_eq!(
            eval_with_input(&email_exists, json!({"email": null})).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_between_bounds() {
        let mut b = IrBuilder::new();
        let n = b.input("n");
        let (low, high) = (b.int(1), b.int(10));
        let inclusive = b.between(n.clone(), low.clone(), high.clone(), true);
        let exclusive = b.between(n, low, high, false);

        for (n, inside, strictly_inside) in [
            (0, false, false),
            (1, true, false),
            (5, true, true),
            (10, true, false),
            (11, false, false),
        ] {
            let input = json!({ "n": n });
            assert_eq!(
                eval_with_input(&inclusive, input.clone()).unwrap(),
                Value::Bool(inside),
                "{} in [1, 10]",
                n
            );
            assert_eq!(
                eval_with_input(&exclusive, input).unwrap(),
                Value::Bool(strictly_inside),
                "{} in (1, 10)",
                n
            );
        }
    }

    #[test]
    fn test_comparison_type_mismatch() {
        let mut b = IrBuilder::new();
        let name = b.input("name");
        let one = b.int(1);
        let cmp = b.compare(CompareOp::Gt, name, one);

        assert!(matches!(
            eval_with_input(&cmp, json!({"name": "ada"})),
            Err(EvaluationError::TypeMismatch {
                expected: "number",
                found: "String",
                ..
            })
        ));
    }

    #[test]
    fn test_string_length_type_mismatch() {
        let mut b = IrBuilder::new();
        let n = b.input("n");
        let len = b.string_length(n);

        assert_eq!(
            eval_with_input(&len, json!({"n": 3})).unwrap_err(),
            EvaluationError::TypeMismatch {
                expected: "String",
                found: "Int",
                context: "length()".to_string(),
            }
        );
        assert_eq!(
            eval_with_input(&len, json!({"n": "héllo"})).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn test_string_predicates() {
        let mut b = IrBuilder::new();
        let email = b.input("email");
        let ada = b.string("ada");
        let domain = b.string("@example.com");
        let at = b.string("@");
        let starts = b.starts_with(email.clone(), ada.clone());
        let ends = b.ends_with(email.clone(), domain);
        let includes = b.includes(email, at);
        let count = b.input("count");
        let misuse = b.starts_with(count, ada);

        let input = json!({"email": "ada@example.com", "count": 2});
        assert_eq!(eval_with_input(&starts, input.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_input(&ends, input.clone()).unwrap(), Value::Bool(true));
        assert_eq!(eval_with_input(&includes, input.clone()).unwrap(), Value::Bool(true));
        assert!(matches!(
            eval_with_input(&misuse, input),
            Err(EvaluationError::TypeMismatch { found: "Int", .. })
        ));

        let other = json!({"email": "bob@test.org", "count": 0});
        assert_eq!(eval_with_input(&starts, other.clone()).unwrap(), Value::Bool(false));
        assert_eq!(eval_with_input(&ends, other).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_array_includes() {
        let mut b = IrBuilder::new();
        let roles = b.input("roles");
        let admin = b.string("admin");
        let is_admin = b.array_includes(roles, admin);

        assert_eq!(
            eval_with_input(&is_admin, json!({"roles": ["user", "admin"]})).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_with_input(&is_admin, json!({"roles": ["user"]})).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval_with_input(&is_admin, json!({"roles": []})).unwrap(),
            Value::Bool(false)
        );
        assert!(matches!(
            eval_with_input(&is_admin, json!({"roles": "admin"})),
            Err(EvaluationError::TypeMismatch { .. })
        ));
    }
}
