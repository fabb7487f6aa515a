//! Transactional entity store contract and the in-memory implementation.
//!
//! [`EntityStore`] is everything the executor needs from a relational
//! backend: a transaction with nested save-points, insert/update with
//! constraint checking, lock-for-update reads, natural-key lookups and
//! per-entity id sequences. Like a real database, sequences are not
//! transactional: a rolled-back insert still consumes its id, which is why
//! preview and failed commits call [`EntityStore::reset_sequence`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::Local;
use serde::Serialize;
use thiserror::Error;

use crate::{
    data::{Fields, Value},
    schema::{EntitySchema, FieldDescriptor, FieldKind},
};

pub type RecordId = i64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub entity: String,
    pub id: RecordId,
    pub fields: Fields,
}

/// Friendly classification of persistence failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceCategory {
    DuplicateKey,
    MissingRelated,
    RequiredNull,
    CheckConstraint,
    Validation,
    Database,
}

impl PersistenceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceCategory::DuplicateKey => "duplicate_key",
            PersistenceCategory::MissingRelated => "missing_related",
            PersistenceCategory::RequiredNull => "required_null",
            PersistenceCategory::CheckConstraint => "check_constraint",
            PersistenceCategory::Validation => "validation",
            PersistenceCategory::Database => "database",
        }
    }

    pub fn friendly_message(&self) -> &'static str {
        match self {
            PersistenceCategory::DuplicateKey => "A record with the same unique value already exists.",
            PersistenceCategory::MissingRelated => "The row references a related record that does not exist.",
            PersistenceCategory::RequiredNull => "A required field is empty.",
            PersistenceCategory::CheckConstraint => "A value is outside the range allowed for its field.",
            PersistenceCategory::Validation => "A value is not valid for its field.",
            PersistenceCategory::Database => "The database rejected the row.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {entity}.{field} (value '{value}')")]
    UniqueViolation {
        entity: String,
        field: String,
        value: String,
    },
    #[error("foreign key violated: {entity}.{field} references missing {target} id {id}")]
    ForeignKeyViolation {
        entity: String,
        field: String,
        target: String,
        id: RecordId,
    },
    #[error("not-null constraint violated on {entity}.{field}")]
    NotNull { entity: String, field: String },
    #[error("check constraint violated on {entity}.{field}: {detail}")]
    Check {
        entity: String,
        field: String,
        detail: String,
    },
    #[error("invalid value for {entity}.{field}: {detail}")]
    Validation {
        entity: String,
        field: String,
        detail: String,
    },
    #[error("{entity} with id={id} not found")]
    NotFound { entity: String, id: RecordId },
    #[error("savepoint '{0}' does not exist")]
    UnknownSavepoint(String),
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl StoreError {
    pub fn category(&self) -> PersistenceCategory {
        match self {
            StoreError::UniqueViolation { .. } => PersistenceCategory::DuplicateKey,
            StoreError::ForeignKeyViolation { .. } | StoreError::NotFound { .. } => {
                PersistenceCategory::MissingRelated
            }
            StoreError::NotNull { .. } => PersistenceCategory::RequiredNull,
            StoreError::Check { .. } => PersistenceCategory::CheckConstraint,
            StoreError::Validation { .. } => PersistenceCategory::Validation,
            StoreError::UnknownSavepoint(_) | StoreError::Transaction(_) => PersistenceCategory::Database,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            StoreError::UniqueViolation { field, .. }
            | StoreError::ForeignKeyViolation { field, .. }
            | StoreError::NotNull { field, .. }
            | StoreError::Check { field, .. }
            | StoreError::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait EntityStore {
    fn begin(&mut self) -> StoreResult<()>;
    fn commit(&mut self) -> StoreResult<()>;
    fn rollback(&mut self) -> StoreResult<()>;

    fn savepoint(&mut self, name: &str) -> StoreResult<()>;
    /// Undoes work since `name`; the save-point stays open.
    fn rollback_to(&mut self, name: &str) -> StoreResult<()>;
    fn release(&mut self, name: &str) -> StoreResult<()>;

    fn insert(&mut self, schema: &EntitySchema, fields: Fields) -> StoreResult<Record>;
    /// Applies `changes` on top of the stored record.
    fn update(&mut self, schema: &EntitySchema, id: RecordId, changes: Fields) -> StoreResult<Record>;
    fn fetch_for_update(&mut self, entity: &str, id: RecordId) -> StoreResult<Option<Record>>;
    fn get(&self, entity: &str, id: RecordId) -> Option<Record>;
    fn find_by(&self, entity: &str, filters: &Fields) -> Vec<Record>;
    fn count(&self, entity: &str) -> usize;

    /// Last id handed out for `entity`.
    fn sequence_value(&self, entity: &str) -> RecordId;
    fn reset_sequence(&mut self, entity: &str, value: RecordId);
}

#[derive(Debug, Clone)]
enum UndoEntry {
    Inserted { entity: String, id: RecordId },
    Updated { entity: String, id: RecordId, previous: Fields },
}

/// Process-local store used by tests, the CLI and previews without a backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, BTreeMap<RecordId, Fields>>,
    sequences: BTreeMap<String, RecordId>,
    journal: Vec<UndoEntry>,
    savepoints: Vec<(String, usize)>,
    locks: BTreeSet<(String, RecordId)>,
    in_transaction: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, entity: &str) -> Vec<Record> {
        self.tables
            .get(entity)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, fields)| Record {
                        entity: entity.to_string(),
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn total_records(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_locked(&self, entity: &str, id: RecordId) -> bool {
        self.locks.contains(&(entity.to_string(), id))
    }

    fn undo_to(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some(entry) = self.journal.pop() else {
                break;
            };
            match entry {
                UndoEntry::Inserted { entity, id } => {
                    if let Some(table) = self.tables.get_mut(&entity) {
                        table.remove(&id);
                    }
                }
                UndoEntry::Updated { entity, id, previous } => {
                    self.tables.entry(entity).or_default().insert(id, previous);
                }
            }
        }
    }

    fn record(&mut self, entry: UndoEntry) {
        if self.in_transaction {
            self.journal.push(entry);
        }
    }

    fn end_transaction(&mut self) {
        self.journal.clear();
        self.savepoints.clear();
        self.locks.clear();
        self.in_transaction = false;
    }

    fn next_id(&mut self, entity: &str) -> RecordId {
        let counter = self.sequences.entry(entity.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Fills defaults and timestamps, then checks every constraint.
    fn prepare_row(
        &self,
        schema: &EntitySchema,
        id: RecordId,
        mut fields: Fields,
        inserting: bool,
    ) -> StoreResult<Fields> {
        let now = Value::DateTime(Local::now().naive_local());
        for field in &schema.fields {
            let column = field.attribute_name();
            if field.primary_key {
                fields.insert(column, Value::Integer(id));
                continue;
            }
            let missing = fields.get(&column).is_none_or(Value::is_null);
            if field.auto_timestamp && (missing || field.name == "updated_at") {
                fields.insert(column.clone(), now.clone());
            } else if missing
                && inserting
                && let Some(default) = &field.default
            {
                fields.insert(column.clone(), default.clone());
            }
        }
        for key in fields.keys() {
            if !schema.fields.iter().any(|f| f.attribute_name() == *key) {
                return Err(StoreError::Validation {
                    entity: schema.name.clone(),
                    field: key.clone(),
                    detail: "unknown column".into(),
                });
            }
        }
        for field in &schema.fields {
            let value = fields.get(&field.attribute_name()).unwrap_or(&Value::Null);
            self.check_field(schema, field, value, id)?;
        }
        Ok(fields)
    }

    fn check_field(
        &self,
        schema: &EntitySchema,
        field: &FieldDescriptor,
        value: &Value,
        id: RecordId,
    ) -> StoreResult<()> {
        let column = field.attribute_name();
        if value.is_blank() {
            if !field.nullable {
                return Err(StoreError::NotNull {
                    entity: schema.name.clone(),
                    field: column,
                });
            }
            return Ok(());
        }
        let invalid = |detail: String| StoreError::Validation {
            entity: schema.name.clone(),
            field: column.clone(),
            detail,
        };
        match (&field.datatype, value) {
            (FieldKind::String, Value::String(_))
            | (FieldKind::Integer, Value::Integer(_))
            | (FieldKind::Boolean, Value::Boolean(_))
            | (FieldKind::Date, Value::Date(_))
            | (FieldKind::DateTime, Value::DateTime(_)) => {}
            (FieldKind::Decimal(spec), Value::Decimal(d)) => {
                let digits = d.trunc().abs().to_string().trim_start_matches('0').len() as u32;
                if digits > spec.integer_digits() || d.scale() > spec.scale {
                    return Err(StoreError::Check {
                        entity: schema.name.clone(),
                        field: column,
                        detail: format!("{d} does not fit {}", spec.signature()),
                    });
                }
            }
            (FieldKind::Relation(target), Value::Integer(related)) => {
                let exists = self
                    .tables
                    .get(target)
                    .is_some_and(|table| table.contains_key(related));
                if !exists {
                    return Err(StoreError::ForeignKeyViolation {
                        entity: schema.name.clone(),
                        field: column,
                        target: target.clone(),
                        id: *related,
                    });
                }
            }
            (kind, other) => {
                return Err(invalid(format!(
                    "expected {kind}, got {} '{}'",
                    other.type_name(),
                    other.as_display()
                )));
            }
        }
        if field.unique
            && let Some(table) = self.tables.get(&schema.name)
            && table
                .iter()
                .any(|(other_id, other)| *other_id != id && other.get(&column).is_some_and(|v| v.loose_eq(value)))
        {
            return Err(StoreError::UniqueViolation {
                entity: schema.name.clone(),
                field: column,
                value: value.as_display(),
            });
        }
        Ok(())
    }
}

impl EntityStore for MemoryStore {
    fn begin(&mut self) -> StoreResult<()> {
        if self.in_transaction {
            return Err(StoreError::Transaction("transaction already open".into()));
        }
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        if !self.in_transaction {
            return Err(StoreError::Transaction("no open transaction".into()));
        }
        self.end_transaction();
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_transaction {
            return Err(StoreError::Transaction("no open transaction".into()));
        }
        self.undo_to(0);
        self.end_transaction();
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        if !self.in_transaction {
            return Err(StoreError::Transaction(format!(
                "savepoint '{name}' requires an open transaction"
            )));
        }
        self.savepoints.push((name.to_string(), self.journal.len()));
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> StoreResult<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(sp, _)| sp == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        let mark = self.savepoints[position].1;
        self.savepoints.truncate(position + 1);
        self.undo_to(mark);
        Ok(())
    }

    fn release(&mut self, name: &str) -> StoreResult<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(sp, _)| sp == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn insert(&mut self, schema: &EntitySchema, fields: Fields) -> StoreResult<Record> {
        let id = self.next_id(&schema.name);
        let fields = self.prepare_row(schema, id, fields, true)?;
        self.tables
            .entry(schema.name.clone())
            .or_default()
            .insert(id, fields.clone());
        self.record(UndoEntry::Inserted {
            entity: schema.name.clone(),
            id,
        });
        Ok(Record {
            entity: schema.name.clone(),
            id,
            fields,
        })
    }

    fn update(&mut self, schema: &EntitySchema, id: RecordId, changes: Fields) -> StoreResult<Record> {
        let previous = self
            .tables
            .get(&schema.name)
            .and_then(|table| table.get(&id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: schema.name.clone(),
                id,
            })?;
        let mut merged = previous.clone();
        merged.extend(changes);
        let fields = self.prepare_row(schema, id, merged, false)?;
        self.tables
            .entry(schema.name.clone())
            .or_default()
            .insert(id, fields.clone());
        self.record(UndoEntry::Updated {
            entity: schema.name.clone(),
            id,
            previous,
        });
        Ok(Record {
            entity: schema.name.clone(),
            id,
            fields,
        })
    }

    fn fetch_for_update(&mut self, entity: &str, id: RecordId) -> StoreResult<Option<Record>> {
        let record = self.get(entity, id);
        if record.is_some() && self.in_transaction {
            self.locks.insert((entity.to_string(), id));
        }
        Ok(record)
    }

    fn get(&self, entity: &str, id: RecordId) -> Option<Record> {
        self.tables
            .get(entity)
            .and_then(|table| table.get(&id))
            .map(|fields| Record {
                entity: entity.to_string(),
                id,
                fields: fields.clone(),
            })
    }

    fn find_by(&self, entity: &str, filters: &Fields) -> Vec<Record> {
        self.records(entity)
            .into_iter()
            .filter(|record| {
                filters.iter().all(|(key, expected)| {
                    record
                        .fields
                        .get(key)
                        .is_some_and(|actual| actual.loose_eq(expected))
                })
            })
            .collect()
    }

    fn count(&self, entity: &str) -> usize {
        self.tables.get(entity).map(BTreeMap::len).unwrap_or(0)
    }

    fn sequence_value(&self, entity: &str) -> RecordId {
        self.sequences.get(entity).copied().unwrap_or(0)
    }

    fn reset_sequence(&mut self, entity: &str, value: RecordId) {
        self.sequences.insert(entity.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::schema::{DecimalSpec, FieldDescriptor, FieldKind};

    fn account() -> EntitySchema {
        EntitySchema::new(
            "account",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("code", FieldKind::String).unique(),
                FieldDescriptor::new("balance", FieldKind::Decimal(DecimalSpec::new(6, 2).unwrap()))
                    .with_default(Decimal::ZERO),
            ],
        )
    }

    fn entry() -> EntitySchema {
        EntitySchema::new(
            "entry",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("account", FieldKind::Relation("account".into())),
            ],
        )
    }

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn insert_assigns_ids_and_defaults() {
        let mut store = MemoryStore::new();
        let record = store
            .insert(&account(), fields(&[("code", Value::from("1000"))]))
            .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.fields.get("balance"), Some(&Value::Decimal(Decimal::ZERO)));
        assert_eq!(record.fields.get("id"), Some(&Value::Integer(1)));
    }

    #[test]
    fn constraint_violations_are_classified() {
        let mut store = MemoryStore::new();
        let schema = account();
        store.insert(&schema, fields(&[("code", Value::from("1000"))])).unwrap();

        let duplicate = store
            .insert(&schema, fields(&[("code", Value::from("1000"))]))
            .unwrap_err();
        assert_eq!(duplicate.category(), PersistenceCategory::DuplicateKey);

        let missing = store.insert(&schema, Fields::new()).unwrap_err();
        assert_eq!(missing.category(), PersistenceCategory::RequiredNull);

        let too_big = store
            .insert(
                &schema,
                fields(&[
                    ("code", Value::from("2000")),
                    ("balance", Value::Decimal(Decimal::new(123_456_78, 2))),
                ]),
            )
            .unwrap_err();
        assert_eq!(too_big.category(), PersistenceCategory::CheckConstraint);

        let dangling = store
            .insert(&entry(), fields(&[("account_id", Value::Integer(99))]))
            .unwrap_err();
        assert_eq!(dangling.category(), PersistenceCategory::MissingRelated);
        assert_eq!(dangling.field(), Some("account_id"));
    }

    #[test]
    fn savepoints_undo_nested_work_but_not_sequences() {
        let mut store = MemoryStore::new();
        let schema = account();
        store.begin().unwrap();
        store.savepoint("batch").unwrap();
        store.insert(&schema, fields(&[("code", Value::from("1"))])).unwrap();
        store.savepoint("row").unwrap();
        store.insert(&schema, fields(&[("code", Value::from("2"))])).unwrap();
        store.rollback_to("row").unwrap();
        assert_eq!(store.count("account"), 1);
        store.rollback_to("batch").unwrap();
        assert_eq!(store.count("account"), 0);
        assert_eq!(store.sequence_value("account"), 2);
        store.rollback().unwrap();
        store.reset_sequence("account", 0);
        assert_eq!(store.sequence_value("account"), 0);
    }

    #[test]
    fn update_locks_and_restores_on_rollback() {
        let mut store = MemoryStore::new();
        let schema = account();
        let created = store.insert(&schema, fields(&[("code", Value::from("1"))])).unwrap();
        store.begin().unwrap();
        assert!(store.fetch_for_update("account", created.id).unwrap().is_some());
        assert!(store.is_locked("account", created.id));
        store
            .update(&schema, created.id, fields(&[("code", Value::from("9"))]))
            .unwrap();
        store.rollback().unwrap();
        assert_eq!(
            store.get("account", created.id).unwrap().fields.get("code"),
            Some(&Value::from("1"))
        );
        assert!(!store.is_locked("account", created.id));
    }
}
