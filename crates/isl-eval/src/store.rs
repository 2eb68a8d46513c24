//! Entity store contract and the in-memory reference store.
//!
//! Contract expressions only ever read from a store through [`EntityQuery`].
//! Behavior implementations receive the full [`EntityStore`], and the
//! verification engine uses `snapshot`/`restore` to capture pre-state for
//! `old(...)` and to roll back aborted runs.

use std::sync::Arc;

use indexmap::IndexMap;
use smol_str::SmolStr;
use thiserror::Error;

use crate::Value;

/// A stored entity record.
pub type Record = IndexMap<SmolStr, Value>;

/// Field holding a record's identity.
pub const ID_FIELD: &str = "id";

type Tables = IndexMap<SmolStr, Vec<Record>>;

/// Errors raised by entity stores.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown entity: {entity}")]
    UnknownEntity { entity: SmolStr },

    #[error("{entity} record not found: {id}")]
    RecordNotFound { entity: SmolStr, id: String },

    #[error("invalid {entity} record: {message}")]
    InvalidRecord { entity: SmolStr, message: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Does `record` satisfy `criteria`?
///
/// Absent criteria match every record. A map matches when every listed field
/// is equal; any other value is shorthand for `{id: value}`.
pub fn criteria_matches(record: &Record, criteria: Option<&Value>) -> bool {
    match criteria {
        None => true,
        Some(Value::Map(fields)) => fields
            .iter()
            .all(|(key, expected)| record.get(key).unwrap_or(&Value::Null) == expected),
        Some(id) => record.get(ID_FIELD) == Some(id),
    }
}

// ============================================================================
// Query Side
// ============================================================================

/// Read-only access to entity records.
pub trait EntityQuery: Sync {
    /// All records of `entity`, in insertion order.
    fn records(&self, entity: &str) -> Result<Vec<Record>, StoreError>;

    /// First record matching `criteria`.
    fn lookup(&self, entity: &str, criteria: Option<&Value>) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records(entity)?
            .into_iter()
            .find(|r| criteria_matches(r, criteria)))
    }

    fn exists(&self, entity: &str, criteria: Option<&Value>) -> Result<bool, StoreError> {
        Ok(self.lookup(entity, criteria)?.is_some())
    }

    fn count(&self, entity: &str, criteria: Option<&Value>) -> Result<usize, StoreError> {
        Ok(self
            .records(entity)?
            .iter()
            .filter(|r| criteria_matches(r, criteria))
            .count())
    }
}

/// Mutable entity storage handed to behavior implementations.
pub trait EntityStore: EntityQuery + Send {
    /// Insert a record, assigning an id when it has none. Returns the stored record.
    fn create(&mut self, entity: &str, record: Record) -> Result<Record, StoreError>;

    /// Merge `changes` into the record with the given id.
    fn update(&mut self, entity: &str, id: &Value, changes: Record) -> Result<Record, StoreError>;

    fn delete(&mut self, entity: &str, id: &Value) -> Result<(), StoreError>;

    /// Capture the current state.
    fn snapshot(&self) -> Result<StateHandle, StoreError>;

    /// Replace the current state with a captured one.
    fn restore(&mut self, state: &StateHandle) -> Result<(), StoreError>;
}

// ============================================================================
// Snapshots
// ============================================================================

/// An immutable point-in-time copy of a store's tables.
///
/// Cloning is cheap; the tables are shared.
#[derive(Debug, Clone, Default)]
pub struct StateHandle {
    tables: Arc<Tables>,
    version: u64,
}

impl StateHandle {
    /// Store version at capture time.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }

    /// Record-level changes from `self` to `after`.
    ///
    /// Records are matched by id, or by position when they have none.
    /// Changes come per entity in table order: updates and deletions in
    /// the order of `self`, then creations in the order of `after`.
    pub fn diff(&self, after: &StateHandle) -> Vec<RecordChange> {
        if Arc::ptr_eq(&self.tables, &after.tables) {
            return Vec::new();
        }

        let mut changes = Vec::new();
        let entities = self
            .tables
            .keys()
            .chain(after.tables.keys().filter(|k| !self.tables.contains_key(*k)));
        for entity in entities {
            let before = keyed(self.tables.get(entity));
            let now = keyed(after.tables.get(entity));

            for (key, (id, old)) in &before {
                match now.get(key) {
                    Some((_, new)) if new == old => {}
                    Some((_, new)) => changes.push(RecordChange {
                        entity: entity.clone(),
                        id: id.clone(),
                        before: Some((*old).clone()),
                        after: Some((*new).clone()),
                    }),
                    None => changes.push(RecordChange {
                        entity: entity.clone(),
                        id: id.clone(),
                        before: Some((*old).clone()),
                        after: None,
                    }),
                }
            }
            for (key, (id, new)) in &now {
                if !before.contains_key(key) {
                    changes.push(RecordChange {
                        entity: entity.clone(),
                        id: id.clone(),
                        before: None,
                        after: Some((*new).clone()),
                    });
                }
            }
        }
        changes
    }
}

/// One record created, updated or deleted between two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub entity: SmolStr,
    pub id: Value,
    /// `None` for a created record
    pub before: Option<Record>,
    /// `None` for a deleted record
    pub after: Option<Record>,
}

fn keyed(rows: Option<&Vec<Record>>) -> IndexMap<String, (Value, &Record)> {
    rows.into_iter()
        .flatten()
        .enumerate()
        .map(|(index, record)| {
            let id = record
                .get(ID_FIELD)
                .cloned()
                .unwrap_or(Value::Int(index as i64));
            (id.to_string(), (id, record))
        })
        .collect()
}

/// Tables missing from a snapshot read as empty: an entity first written
/// after capture had no records at capture time.
impl EntityQuery for StateHandle {
    fn records(&self, entity: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self.tables.get(entity).cloned().unwrap_or_default())
    }
}

fn table<'t>(tables: &'t Tables, entity: &str) -> Result<&'t Vec<Record>, StoreError> {
    tables.get(entity).ok_or_else(|| StoreError::UnknownEntity {
        entity: entity.into(),
    })
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Reference store keeping every table in memory.
///
/// Tables are copy-on-write, so snapshots share storage until the next
/// mutation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Tables>,
    next_id: u64,
    version: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty table so queries on it succeed before any insert.
    pub fn with_entity(mut self, entity: &str) -> Self {
        self.declare(entity);
        self
    }

    pub fn declare(&mut self, entity: &str) {
        Arc::make_mut(&mut self.tables)
            .entry(entity.into())
            .or_default();
    }

    /// Mutation counter, bumped on every write.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn rows_mut(&mut self, entity: &str) -> Result<&mut Vec<Record>, StoreError> {
        Arc::make_mut(&mut self.tables)
            .get_mut(entity)
            .ok_or_else(|| StoreError::UnknownEntity {
                entity: entity.into(),
            })
    }

    fn position(rows: &[Record], entity: &str, id: &Value) -> Result<usize, StoreError> {
        rows.iter()
            .position(|r| r.get(ID_FIELD) == Some(id))
            .ok_or_else(|| StoreError::RecordNotFound {
                entity: entity.into(),
                id: id.to_string(),
            })
    }
}

impl EntityQuery for InMemoryStore {
    fn records(&self, entity: &str) -> Result<Vec<Record>, StoreError> {
        table(&self.tables, entity).map(|rows| rows.to_vec())
    }

    fn lookup(&self, entity: &str, criteria: Option<&Value>) -> Result<Option<Record>, StoreError> {
        Ok(table(&self.tables, entity)?
            .iter()
            .find(|r| criteria_matches(r, criteria))
            .cloned())
    }

    fn count(&self, entity: &str, criteria: Option<&Value>) -> Result<usize, StoreError> {
        Ok(table(&self.tables, entity)?
            .iter()
            .filter(|r| criteria_matches(r, criteria))
            .count())
    }
}

impl EntityStore for InMemoryStore {
    fn create(&mut self, entity: &str, mut record: Record) -> Result<Record, StoreError> {
        self.declare(entity);
        match record.get(ID_FIELD) {
            Some(Value::Null) | None => {
                self.next_id += 1;
                let id = Value::String(format!("{}-{}", entity.to_lowercase(), self.next_id).into());
                record.shift_insert(0, ID_FIELD.into(), id);
            }
            Some(id) => {
                if self.lookup(entity, Some(id))?.is_some() {
                    return Err(StoreError::InvalidRecord {
                        entity: entity.into(),
                        message: format!("duplicate id {}", id),
                    });
                }
            }
        }
        self.rows_mut(entity)?.push(record.clone());
        self.version += 1;
        Ok(record)
    }

    fn update(&mut self, entity: &str, id: &Value, changes: Record) -> Result<Record, StoreError> {
        if changes.get(ID_FIELD).is_some_and(|new_id| new_id != id) {
            return Err(StoreError::InvalidRecord {
                entity: entity.into(),
                message: "id cannot be changed".to_string(),
            });
        }
        let rows = self.rows_mut(entity)?;
        let index = Self::position(rows, entity, id)?;
        let row = &mut rows[index];
        row.extend(changes);
        let updated = row.clone();
        self.version += 1;
        Ok(updated)
    }

    fn delete(&mut self, entity: &str, id: &Value) -> Result<(), StoreError> {
        let rows = self.rows_mut(entity)?;
        let index = Self::position(rows, entity, id)?;
        rows.remove(index);
        self.version += 1;
        Ok(())
    }

    fn snapshot(&self) -> Result<StateHandle, StoreError> {
        Ok(StateHandle {
            tables: Arc::clone(&self.tables),
            version: self.version,
        })
    }

    fn restore(&mut self, state: &StateHandle) -> Result<(), StoreError> {
        self.tables = Arc::clone(&state.tables);
        self.version = state.version;
        Ok(())
    }
}
