//! Runs whose entity store fails while contracts are being checked.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use isl_eval::{
    EntityQuery, EntityStore, InMemoryStore, Record, StateHandle, StoreError, Value,
};
use isl_ir::IrBuilder;
use isl_verify::{
    BehaviorFailure, BehaviorImplementation, BehaviorSpec, BehaviorVerdict, Clause, Domain,
    PlannedRun, RunPhase, Scenario, TraceEventKind, TrustVerdict, VerificationEngine,
    VerifierConfig,
};
use pretty_assertions::assert_eq;
use serde_json::json;

/// In-memory store whose reads of one entity fail.
struct FlakyStore {
    inner: InMemoryStore,
    broken: &'static str,
}

impl FlakyStore {
    fn new(broken: &'static str) -> Self {
        Self {
            inner: InMemoryStore::new().with_entity("Note"),
            broken,
        }
    }
}

impl EntityQuery for FlakyStore {
    fn records(&self, entity: &str) -> Result<Vec<Record>, StoreError> {
        if entity == self.broken {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.records(entity)
    }
}

impl EntityStore for FlakyStore {
    fn create(&mut self, entity: &str, record: Record) -> Result<Record, StoreError> {
        self.inner.create(entity, record)
    }

    fn update(&mut self, entity: &str, id: &Value, changes: Record) -> Result<Record, StoreError> {
        self.inner.update(entity, id, changes)
    }

    fn delete(&mut self, entity: &str, id: &Value) -> Result<(), StoreError> {
        self.inner.delete(entity, id)
    }

    fn snapshot(&self) -> Result<StateHandle, StoreError> {
        self.inner.snapshot()
    }

    fn restore(&mut self, state: &StateHandle) -> Result<(), StoreError> {
        self.inner.restore(state)
    }
}

/// Writes a note and reports success.
struct TakeNote;

#[async_trait]
impl BehaviorImplementation for TakeNote {
    async fn execute(
        &self,
        input: &Value,
        store: &mut dyn EntityStore,
    ) -> Result<Value, BehaviorFailure> {
        let mut note = Record::new();
        note.insert("text".into(), input.get("text").cloned().unwrap_or_default());
        store
            .create("Note", note)
            .map_err(|e| BehaviorFailure::new("STORE_ERROR", e.to_string()))?;
        Ok(Value::map([("noted", Value::Bool(true))]))
    }
}

fn scenario() -> Scenario {
    Scenario::new("first note", json!({"text": "hello"}))
}

/// `TakeNote` requires `true` and ensures `Audit.exists()`.
fn audited_domain() -> Domain {
    let mut b = IrBuilder::new();
    let always = b.bool(true);
    let audited = b.entity_exists("Audit", None);
    let take_note = BehaviorSpec::new("TakeNote")
        .requires(Clause::new(&always))
        .ensures(Clause::new(&audited));
    Domain::new("Notes").with_behavior(take_note)
}

/// `TakeNote` requires `Audit.count() == 0`.
fn guarded_domain() -> Domain {
    let mut b = IrBuilder::new();
    let audits = b.entity_count("Audit", None);
    let zero = b.int(0);
    let unaudited = b.eq(audits, zero);
    let take_note = BehaviorSpec::new("TakeNote").requires(Clause::new(&unaudited));
    Domain::new("Notes").with_behavior(take_note)
}

fn engine(config: VerifierConfig) -> VerificationEngine<FlakyStore> {
    VerificationEngine::new(FlakyStore::new("Audit"), config).unwrap()
}

#[tokio::test]
async fn test_store_failure_in_postcondition_errors_run() {
    let engine = engine(VerifierConfig::default());
    let result = engine
        .verify_behavior(&audited_domain(), "TakeNote", &TakeNote, &scenario())
        .await;

    assert_eq!(result.verdict, BehaviorVerdict::Errored);
    assert_eq!(result.phase, RunPhase::Errored);
    assert_eq!(result.score, 0.0);
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("store backend error: connection reset")
    );
    assert_eq!(result.preconditions.len(), 1);
    assert!(result.postconditions.is_empty());
    assert!(!result.trace.metadata.passed);
    assert!(matches!(
        result.trace.events.last().map(|e| &e.kind),
        Some(TraceEventKind::Restore { .. })
    ));

    let store = engine.store();
    let store = store.lock().await;
    assert_eq!(store.count("Note", None).unwrap(), 0);
}

#[tokio::test]
async fn test_store_failure_without_restore_keeps_writes() {
    let engine = engine(VerifierConfig::default().with_restore_on_abort(false));
    let result = engine
        .verify_behavior(&audited_domain(), "TakeNote", &TakeNote, &scenario())
        .await;

    assert_eq!(result.verdict, BehaviorVerdict::Errored);
    let store = engine.store();
    let store = store.lock().await;
    assert_eq!(store.count("Note", None).unwrap(), 1);
}

#[tokio::test]
async fn test_store_failure_in_precondition_skips_execution() {
    let engine = engine(VerifierConfig::default());
    let result = engine
        .verify_behavior(&guarded_domain(), "TakeNote", &TakeNote, &scenario())
        .await;

    assert_eq!(result.verdict, BehaviorVerdict::Errored);
    assert_eq!(result.phase, RunPhase::Errored);
    assert!(result.preconditions.is_empty());
    assert!(result.result.is_none());
    assert!(!result
        .trace
        .events
        .iter()
        .any(|e| matches!(e.kind, TraceEventKind::Call { .. })));

    let store = engine.store();
    let store = store.lock().await;
    assert_eq!(store.count("Note", None).unwrap(), 0);
}

#[tokio::test]
async fn test_store_failure_counts_as_errored_in_summary() {
    let engine = engine(VerifierConfig::default());
    let mut implementations: IndexMap<smol_str::SmolStr, Arc<dyn BehaviorImplementation>> =
        IndexMap::new();
    implementations.insert("TakeNote".into(), Arc::new(TakeNote));
    let runs = vec![PlannedRun::new("TakeNote", scenario())];

    let (results, summary) = engine
        .verify_domain(&audited_domain(), &implementations, &runs)
        .await;

    assert_eq!(results[0].verdict, BehaviorVerdict::Errored);
    assert_eq!(summary.errored_behaviors, 1);
    assert_eq!(summary.failed_behaviors, 1);
    assert_eq!(summary.score, 0.0);
    assert_eq!(summary.verdict, TrustVerdict::Unsafe);
}
