//! The transactional core of an import.
//!
//! Rows are prepared first without touching the store: preflight of required
//! fields, unknown-column filtering and type coercion. Execution then opens one
//! transaction with an outer save-point and walks entity types in priority
//! order. Each row gets its own save-point, resolves `_fk` tokens against rows
//! saved earlier in the run, persists, and fires its integration events.
//!
//! Preview always rolls the whole batch back and resets the id sequences.
//! Commit is all-or-nothing: a preparation error aborts before any store
//! access, and a single failed row rolls back every entity type.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{ImportContext, ImportMode, ImportSettings},
    data::{Fields, Row, Value, coerce_date, coerce_datetime, parse_bool, quantize},
    error::{Diagnostic, DiagnosticCode, ImportError},
    events::{DispatchOutcome, Dispatcher, event_payload},
    fingerprint::{self, DedupReport, ImportSnapshot, SnapshotStore, SourceFile},
    job::{FollowOnRequest, JobSink, ProgressCounters},
    rules::{RuleStore, TriggerOptions},
    schema::{EntitySchema, FieldDescriptor, FieldKind, KeyForm, SchemaProvider},
    store::{EntityStore, PersistenceCategory, Record, RecordId, StoreError},
    substitution::SubstitutionChange,
    transform::string_ops::{looks_like_path, normalize_path},
};

const BATCH_SAVEPOINT: &str = "import_batch";

/// Converts a prepared value to the storage type of `field`. Blank values become null.
pub fn coerce_value(field: &FieldDescriptor, value: Value) -> Result<Value, String> {
    if value.is_blank() {
        return Ok(Value::Null);
    }
    let invalid = |value: &Value| format!("'{}' is not a valid {}", value.as_display(), field.datatype);
    match &field.datatype {
        FieldKind::String => Ok(match value {
            Value::String(_) => value,
            other => Value::String(other.as_display()),
        }),
        FieldKind::Integer | FieldKind::Relation(_) => value.as_i64().map(Value::Integer).ok_or_else(|| invalid(&value)),
        FieldKind::Decimal(spec) => value
            .as_decimal()
            .map(|d| Value::Decimal(quantize(d, spec.scale)))
            .ok_or_else(|| invalid(&value)),
        FieldKind::Boolean => parse_bool(&value).map(Value::Boolean).ok_or_else(|| invalid(&value)),
        FieldKind::Date => coerce_date(&value).map(Value::Date).ok_or_else(|| invalid(&value)),
        FieldKind::DateTime => coerce_datetime(&value).map(Value::DateTime).ok_or_else(|| invalid(&value)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Create,
    Update,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Create => "create",
            RowAction::Update => "update",
        }
    }
}

/// Structured failure attached to a row result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub code: DiagnosticCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<PersistenceCategory>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl From<&ImportError> for RowError {
    fn from(err: &ImportError) -> Self {
        let (message, technical) = match err {
            ImportError::Persistence { source } => {
                (source.category().friendly_message().to_string(), Some(source.to_string()))
            }
            other => (other.to_string(), None),
        };
        Self {
            code: err.code(),
            category: err.category(),
            message,
            technical,
            field: err.field().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowResult {
    pub row_token: String,
    pub sheet: String,
    pub row_number: usize,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RowAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    /// Persisted columns on success, otherwise the incoming row.
    pub data: Fields,
    pub message: String,
    pub substitutions: Vec<SubstitutionChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RowError>,
}

impl RowResult {
    fn from_pending(pending: PendingRow, message: String) -> Self {
        let status = if pending.warnings.is_empty() {
            RowStatus::Success
        } else {
            RowStatus::Warning
        };
        Self {
            row_token: pending.row.row_id,
            sheet: pending.row.sheet,
            row_number: pending.row.row_number,
            status,
            action: None,
            record_id: None,
            data: pending.row.fields,
            message,
            substitutions: pending.substitutions,
            warnings: pending.warnings,
            error: None,
        }
    }

    fn not_executed(&mut self, reason: &str) {
        self.status = RowStatus::Warning;
        self.message = reason.to_string();
        self.warnings.push(
            Diagnostic::new(DiagnosticCode::NotExecuted, reason)
                .sheet(&self.sheet)
                .row(self.row_number),
        );
    }
}

/// Rows bound for one entity type, already transformed and substituted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityBatch {
    pub entity: String,
    pub rows: Vec<Row>,
    pub substitutions: Vec<SubstitutionChange>,
    /// Trigger options per source sheet.
    pub triggers: BTreeMap<String, TriggerOptions>,
}

impl EntityBatch {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            ..Self::default()
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    fn triggers_for(&self, sheet: &str) -> TriggerOptions {
        self.triggers.get(sheet).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityOutcome {
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupReport>,
    pub rows: Vec<RowResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub committed: bool,
    pub entities: Vec<EntityOutcome>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    /// Asynchronous integration work, enqueued only after a commit.
    pub follow_ons: Vec<FollowOnRequest>,
    pub snapshots: Vec<String>,
}

/// Run-wide map from row tokens to the ids they were saved under.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    local: BTreeMap<String, BTreeMap<String, RecordId>>,
    global: BTreeMap<String, Vec<(String, RecordId)>>,
}

fn canonical_token(token: &str) -> String {
    let trimmed = token.trim();
    if looks_like_path(trimmed) {
        normalize_path(trimmed).into_owned()
    } else {
        trimmed.to_string()
    }
}

impl TokenRegistry {
    pub fn register(&mut self, entity: &str, token: &str, id: RecordId) {
        let key = canonical_token(token);
        self.local
            .entry(entity.to_string())
            .or_default()
            .insert(key.clone(), id);
        self.global.entry(key).or_default().push((entity.to_string(), id));
    }

    /// Looks in `entity`'s own map for self references, then in the run-wide
    /// map. Only ids registered by the relation's `target` entity are returned.
    pub fn resolve(&self, entity: &str, target: &str, token: &str) -> Option<RecordId> {
        let key = canonical_token(token);
        if entity == target
            && let Some(id) = self.local.get(entity).and_then(|tokens| tokens.get(&key))
        {
            return Some(*id);
        }
        let candidates = self.global.get(&key)?;
        candidates
            .iter()
            .rev()
            .find(|(owner, _)| owner == target)
            .map(|(_, id)| *id)
    }

    pub fn known_tokens(&self, limit: usize) -> Vec<String> {
        self.global.keys().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reference {
    Id(RecordId),
    Token(String),
}

#[derive(Debug)]
struct PendingRow {
    row: Row,
    /// Coerced non-relation values keyed by stored column.
    values: Fields,
    /// Relation references keyed by field name.
    references: BTreeMap<String, Reference>,
    warnings: Vec<Diagnostic>,
    substitutions: Vec<SubstitutionChange>,
    error: Option<ImportError>,
}

struct PreparedBatch<'s> {
    schema: &'s EntitySchema,
    batch: EntityBatch,
    rows: Vec<PendingRow>,
}

pub struct ImportExecutor<'a> {
    ctx: &'a ImportContext,
    schemas: &'a dyn SchemaProvider,
    rules: &'a dyn RuleStore,
    settings: &'a ImportSettings,
}

impl<'a> ImportExecutor<'a> {
    pub fn new(
        ctx: &'a ImportContext,
        schemas: &'a dyn SchemaProvider,
        rules: &'a dyn RuleStore,
        settings: &'a ImportSettings,
    ) -> Self {
        Self {
            ctx,
            schemas,
            rules,
            settings,
        }
    }

    /// Runs `batches` in the context's mode. `preparation_failed` reports
    /// sheet-level failures upstream, which block a commit.
    pub fn execute(
        &self,
        store: &mut dyn EntityStore,
        snapshots: &mut dyn SnapshotStore,
        jobs: &mut dyn JobSink,
        batches: Vec<EntityBatch>,
        preparation_failed: bool,
        source_file: Option<&SourceFile>,
    ) -> Result<ExecutionOutcome> {
        let names = batches.iter().map(|b| b.entity.clone()).collect::<Vec<_>>();
        let order = self.schemas.processing_order(&names);
        let mut batches = batches;
        batches.sort_by_key(|b| order.iter().position(|name| *name == b.entity).unwrap_or(usize::MAX));

        let mut prepared = Vec::with_capacity(batches.len());
        for mut batch in batches {
            let schema = self
                .schemas
                .entity(&batch.entity)
                .with_context(|| format!("No schema registered for entity '{}'", batch.entity))?;
            let rows = self.prepare_batch(schema, &mut batch);
            prepared.push(PreparedBatch { schema, batch, rows });
        }

        let mut counters = ProgressCounters {
            total_rows: prepared.iter().map(|p| p.rows.len()).sum(),
            ..ProgressCounters::default()
        };
        let row_errors = prepared
            .iter()
            .flat_map(|p| &p.rows)
            .filter(|row| row.error.is_some())
            .count();
        if self.ctx.mode == ImportMode::Commit && (preparation_failed || row_errors > 0) {
            warn!(
                "Commit aborted before execution: {} row preparation error(s){}",
                row_errors,
                if preparation_failed { " and failed sheets" } else { "" }
            );
            let outcome = self.abort_unexecuted(prepared, &mut counters);
            self.report_progress(jobs, &counters);
            return Ok(outcome);
        }

        let sequences = self
            .schemas
            .entity_names()
            .into_iter()
            .map(|name| {
                let value = store.sequence_value(&name);
                (name, value)
            })
            .collect::<Vec<_>>();
        store.begin().context("Opening import transaction")?;
        store
            .savepoint(BATCH_SAVEPOINT)
            .context("Opening batch save-point")?;

        let dispatcher = Dispatcher::new(self.rules, self.schemas);
        let mut tokens = TokenRegistry::default();
        let mut errors = Vec::new();
        let mut deferred = Vec::new();
        let mut entities = Vec::with_capacity(prepared.len());
        let mut incoming = Vec::with_capacity(prepared.len());
        for PreparedBatch { schema, batch, rows } in prepared {
            info!("Processing {} row(s) for {}", rows.len(), schema.name);
            counters.current_entity = Some(schema.name.clone());
            let mut results = Vec::with_capacity(rows.len());
            let mut saved = Vec::with_capacity(rows.len());
            for mut pending in rows {
                let result = match pending.error.take() {
                    Some(err) => failure(pending, err, &mut errors),
                    None => {
                        let (result, payload) = self.execute_row(
                            store,
                            schema,
                            &batch,
                            pending,
                            &mut tokens,
                            &dispatcher,
                            &mut deferred,
                            &mut errors,
                        );
                        saved.extend(payload);
                        result
                    }
                };
                self.count_row(jobs, &mut counters, result.status);
                results.push(result);
            }
            incoming.push(saved);
            entities.push(EntityOutcome {
                entity: schema.name.clone(),
                dedup: None,
                rows: results,
            });
        }

        let committed = match self.ctx.mode {
            ImportMode::Preview => {
                self.discard(store, &sequences)?;
                info!("Preview finished; all changes rolled back");
                false
            }
            ImportMode::Commit if !errors.is_empty() => {
                self.discard(store, &sequences)?;
                warn!("Commit rolled back: {} row(s) failed", errors.len());
                for result in entities.iter_mut().flat_map(|e| e.rows.iter_mut()) {
                    if result.status != RowStatus::Error {
                        result.not_executed("rolled back because another row in the batch failed");
                    }
                }
                false
            }
            ImportMode::Commit => {
                store
                    .release(BATCH_SAVEPOINT)
                    .context("Releasing batch save-point")?;
                store.commit().context("Committing import transaction")?;
                info!("Committed {} entity batch(es)", entities.len());
                true
            }
        };

        let snapshot_ids = self.record_snapshots(snapshots, &mut entities, &incoming, committed, source_file)?;
        if committed {
            if let Some(job) = &self.ctx.job_id {
                for request in &deferred {
                    jobs.enqueue(job, request.clone());
                }
            }
        } else {
            deferred.clear();
        }
        counters.current_entity = None;
        self.report_progress(jobs, &counters);

        let warnings = entities
            .iter()
            .flat_map(|e| &e.rows)
            .flat_map(|r| r.warnings.iter().cloned())
            .collect();
        Ok(ExecutionOutcome {
            committed,
            entities,
            errors,
            warnings,
            follow_ons: deferred,
            snapshots: snapshot_ids,
        })
    }

    fn prepare_batch(&self, schema: &EntitySchema, batch: &mut EntityBatch) -> Vec<PendingRow> {
        let mut changes = std::mem::take(&mut batch.substitutions)
            .into_iter()
            .into_group_map_by(|change| (change.sheet.clone(), change.row_id.clone()));
        std::mem::take(&mut batch.rows)
            .into_iter()
            .map(|row| {
                let substitutions = changes
                    .remove(&(row.sheet.clone(), row.row_id.clone()))
                    .unwrap_or_default();
                prepare_row(schema, row, substitutions)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_row(
        &self,
        store: &mut dyn EntityStore,
        schema: &EntitySchema,
        batch: &EntityBatch,
        mut pending: PendingRow,
        tokens: &mut TokenRegistry,
        dispatcher: &Dispatcher<'_>,
        deferred: &mut Vec<FollowOnRequest>,
        errors: &mut Vec<Diagnostic>,
    ) -> (RowResult, Option<Row>) {
        let savepoint = format!("row_{}_{}", schema.name, pending.row.row_number);
        if let Err(err) = store.savepoint(&savepoint) {
            return (failure(pending, err.into(), errors), None);
        }
        let persisted = self
            .resolve(schema, &pending.references, &pending.row, tokens, &mut pending.warnings)
            .and_then(|mut payload| {
                payload.extend(pending.values.iter().map(|(k, v)| (k.clone(), v.clone())));
                persist(store, schema, payload.clone()).map(|saved| (saved, payload))
            });

        let ((action, record), incoming) = match persisted {
            Ok(saved) => saved,
            Err(err) => {
                if store
                    .rollback_to(&savepoint)
                    .and_then(|_| store.release(&savepoint))
                    .is_err()
                {
                    warn!("Could not roll back save-point {savepoint}");
                }
                return (failure(pending, err, errors), None);
            }
        };
        tokens.register(&schema.name, &pending.row.row_id, record.id);

        let payload = event_payload(&record, action.as_str(), &pending.row.extras);
        let mut dispatched = DispatchOutcome::default();
        for event in batch
            .triggers_for(&pending.row.sheet)
            .events_for(&schema.name, action.as_str())
        {
            dispatched.merge(dispatcher.dispatch(self.ctx, store, &event, &payload));
        }
        for failed in dispatched.failed {
            pending
                .warnings
                .push(failed.sheet(&pending.row.sheet).row(pending.row.row_number));
        }
        deferred.extend(dispatched.deferred);
        if let Err(err) = store.release(&savepoint) {
            warn!("Releasing save-point {savepoint}: {err}");
        }

        let verb = match action {
            RowAction::Create => "created",
            RowAction::Update => "updated",
        };
        let mut message = format!("{verb} {} #{}", schema.name, record.id);
        if !dispatched.created.is_empty() {
            message.push_str(&format!("; {} related record(s) created", dispatched.created.len()));
        }
        debug!("{} row {}: {message}", pending.row.sheet, pending.row.row_number);
        let mut fingerprinted = Row::new(pending.row.row_id.clone(), pending.row.sheet.clone(), pending.row.row_number);
        fingerprinted.fields = incoming;
        let mut result = RowResult::from_pending(pending, message);
        result.action = Some(action);
        result.record_id = Some(record.id);
        result.data = record.fields;
        (result, Some(fingerprinted))
    }

    /// Builds the stored relation columns for a row, resolving tokens.
    fn resolve(
        &self,
        schema: &EntitySchema,
        references: &BTreeMap<String, Reference>,
        row: &Row,
        tokens: &TokenRegistry,
        warnings: &mut Vec<Diagnostic>,
    ) -> Result<Fields, ImportError> {
        let mut payload = Fields::new();
        for field in schema.relations() {
            let Some(target) = field.relation_target() else {
                continue;
            };
            let column = field.attribute_name();
            match references.get(&field.name) {
                None => {}
                Some(Reference::Id(id)) => {
                    payload.insert(column, Value::Integer(*id));
                }
                Some(Reference::Token(token)) => match tokens.resolve(&schema.name, target, token) {
                    Some(id) => {
                        debug!("Resolved {}.{} token '{token}' to {target} #{id}", schema.name, field.name);
                        payload.insert(column, Value::Integer(id));
                    }
                    None if field.nullable => {
                        warnings.push(
                            Diagnostic::new(
                                DiagnosticCode::Resolution,
                                format!("reference '{token}' did not resolve; '{}' left empty", field.name),
                            )
                            .sheet(&row.sheet)
                            .row(row.row_number)
                            .field(&field.name),
                        );
                        payload.insert(column, Value::Null);
                    }
                    None => {
                        return Err(ImportError::Resolution {
                            field: field.name.clone(),
                            token: token.clone(),
                            known_tokens: tokens.known_tokens(self.settings.known_token_preview),
                        });
                    }
                },
            }
        }
        Ok(payload)
    }

    fn discard(&self, store: &mut dyn EntityStore, sequences: &[(String, RecordId)]) -> Result<()> {
        store
            .rollback_to(BATCH_SAVEPOINT)
            .context("Rolling back batch save-point")?;
        store.rollback().context("Rolling back import transaction")?;
        for (entity, value) in sequences {
            store.reset_sequence(entity, *value);
        }
        Ok(())
    }

    fn abort_unexecuted(&self, prepared: Vec<PreparedBatch<'_>>, counters: &mut ProgressCounters) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        for PreparedBatch { schema, rows, .. } in prepared {
            let mut results = Vec::with_capacity(rows.len());
            for mut pending in rows {
                counters.processed_rows += 1;
                let result = match pending.error.take() {
                    Some(err) => {
                        counters.failed_rows += 1;
                        failure(pending, err, &mut outcome.errors)
                    }
                    None => {
                        let mut result = RowResult::from_pending(pending, String::new());
                        result.not_executed("not executed because the batch has preparation errors");
                        result
                    }
                };
                results.push(result);
            }
            outcome.entities.push(EntityOutcome {
                entity: schema.name.clone(),
                dedup: None,
                rows: results,
            });
        }
        outcome.warnings = outcome
            .entities
            .iter()
            .flat_map(|e| &e.rows)
            .flat_map(|r| r.warnings.iter().cloned())
            .collect();
        outcome
    }

    /// Compares every touched entity against its history; snapshots are
    /// written only for a committed batch. `incoming` holds, per entity, the
    /// saved rows as they arrived: coerced values plus resolved relation ids.
    fn record_snapshots(
        &self,
        snapshots: &mut dyn SnapshotStore,
        entities: &mut [EntityOutcome],
        incoming: &[Vec<Row>],
        committed: bool,
        source_file: Option<&SourceFile>,
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for (outcome, rows) in entities.iter_mut().zip(incoming) {
            let Some(schema) = self.schemas.entity(&outcome.entity) else {
                continue;
            };
            if rows.is_empty() {
                continue;
            }
            let table = fingerprint::fingerprint(schema, rows);
            let history = snapshots.recent(&self.ctx.company, &schema.name, self.settings.dedup_history);
            let report = fingerprint::compare(&table, &history, self.settings.sample_hash_limit);
            if report.exact_table_duplicate {
                info!(
                    "{} batch matches earlier import {}",
                    schema.name,
                    report.duplicate_of.as_deref().unwrap_or_default()
                );
            }
            if committed {
                let snapshot = ImportSnapshot::from_fingerprint(
                    &self.ctx.company,
                    &schema.name,
                    &table,
                    source_file.cloned(),
                    self.settings.sample_hash_limit,
                    report.similarity,
                );
                written.push(snapshot.id.clone());
                snapshots
                    .append(snapshot)
                    .with_context(|| format!("Writing import snapshot for {}", schema.name))?;
            }
            outcome.dedup = Some(report);
        }
        Ok(written)
    }

    fn count_row(&self, jobs: &mut dyn JobSink, counters: &mut ProgressCounters, status: RowStatus) {
        counters.processed_rows += 1;
        match status {
            RowStatus::Error => counters.failed_rows += 1,
            RowStatus::Success | RowStatus::Warning => counters.ok_rows += 1,
        }
        let every = self.settings.progress_every;
        if every > 0 && counters.processed_rows % every == 0 {
            self.report_progress(jobs, counters);
        }
    }

    fn report_progress(&self, jobs: &mut dyn JobSink, counters: &ProgressCounters) {
        if let Some(job) = &self.ctx.job_id {
            jobs.progress(job, counters);
        }
    }
}

fn failure(pending: PendingRow, err: ImportError, errors: &mut Vec<Diagnostic>) -> RowResult {
    let mut diagnostic = err.to_diagnostic();
    diagnostic.sheet = Some(pending.row.sheet.clone());
    diagnostic.row_number = Some(pending.row.row_number);
    errors.push(diagnostic);
    let mut result = RowResult::from_pending(pending, err.to_string());
    result.status = RowStatus::Error;
    result.error = Some(RowError::from(&err));
    result
}

/// Required fields absent under every accepted spelling.
fn preflight(schema: &EntitySchema, fields: &Fields) -> Result<(), ImportError> {
    let missing = schema
        .required_fields()
        .filter(|field| {
            !field
                .accepted_keys()
                .iter()
                .any(|key| fields.get(key).is_some_and(|v| !v.is_blank()))
        })
        .map(|field| field.name.clone())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ImportError::Preflight { missing })
    }
}

fn prepare_row(schema: &EntitySchema, row: Row, substitutions: Vec<SubstitutionChange>) -> PendingRow {
    let mut pending = PendingRow {
        row,
        values: Fields::new(),
        references: BTreeMap::new(),
        warnings: Vec::new(),
        substitutions,
        error: None,
    };
    if let Err(err) = preflight(schema, &pending.row.fields) {
        pending.error = Some(err);
        return pending;
    }
    for (key, value) in &pending.row.fields {
        let Some((field, form)) = schema.resolve_key(key) else {
            pending.warnings.push(
                Diagnostic::new(
                    DiagnosticCode::UnknownColumn,
                    format!("'{key}' is not a field of {}; ignored", schema.name),
                )
                .sheet(&pending.row.sheet)
                .row(pending.row.row_number)
                .field(key),
            );
            continue;
        };
        if field.is_relation() {
            if value.is_blank() {
                continue;
            }
            // A plain or attribute value that is not an id is a token to rescue.
            let reference = match (form, value.as_i64()) {
                (KeyForm::Token, _) | (_, None) => Reference::Token(value.as_display()),
                (_, Some(id)) => Reference::Id(id),
            };
            if !matches!(pending.references.get(&field.name), Some(Reference::Id(_))) {
                pending.references.insert(field.name.clone(), reference);
            }
            continue;
        }
        match coerce_value(field, value.clone()) {
            Ok(Value::Null) => {}
            Ok(coerced) => {
                pending.values.insert(field.attribute_name(), coerced);
            }
            Err(message) => {
                pending.error = Some(ImportError::Coercion {
                    field: field.name.clone(),
                    message,
                });
                break;
            }
        }
    }
    pending
}

/// Updates when the payload carries the id of an existing record, otherwise inserts.
fn persist(store: &mut dyn EntityStore, schema: &EntitySchema, mut payload: Fields) -> Result<(RowAction, Record), ImportError> {
    let pk = schema.primary_key_name().to_string();
    let Some(id) = payload.remove(&pk).and_then(|v| v.as_i64()).filter(|id| *id > 0) else {
        return Ok((RowAction::Create, store.insert(schema, payload)?));
    };
    if store.fetch_for_update(&schema.name, id)?.is_none() {
        return Err(StoreError::NotFound {
            entity: schema.name.clone(),
            id,
        }
        .into());
    }
    Ok((RowAction::Update, store.update(schema, id, payload)?))
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::{
        fingerprint::MemorySnapshotStore,
        job::MemoryJobSink,
        rules::RuleBook,
        schema::{DecimalSpec, SchemaRegistry},
        store::MemoryStore,
    };

    fn registry() -> SchemaRegistry {
        let account = EntitySchema::new(
            "account",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("code", FieldKind::String).unique(),
                FieldDescriptor::new("name", FieldKind::String),
                FieldDescriptor::new("active", FieldKind::Boolean).with_default(true),
            ],
        );
        let bank = EntitySchema::new(
            "bank",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("name", FieldKind::String),
            ],
        );
        let entry = EntitySchema::new(
            "entry",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("account", FieldKind::Relation("account".into())),
                FieldDescriptor::new("amount", FieldKind::Decimal(DecimalSpec::new(12, 2).unwrap())),
                FieldDescriptor::new("created_at", FieldKind::DateTime).auto_timestamp(),
            ],
        );
        SchemaRegistry::new(
            vec![entry, account, bank],
            vec!["account".into(), "bank".into(), "entry".into()],
        )
        .unwrap()
    }

    fn account(token: &str, code: &str, name: &str) -> Row {
        Row::new(token, "Accounts", 2).with_field("code", code).with_field("name", name)
    }

    fn entry(row_number: usize, account_token: &str, amount: &str) -> Row {
        Row::new(format!("Entries:{row_number}"), "Entries", row_number)
            .with_field("account_fk", account_token)
            .with_field("amount", amount)
    }

    struct Harness {
        registry: SchemaRegistry,
        rules: RuleBook,
        settings: ImportSettings,
        store: MemoryStore,
        snapshots: MemorySnapshotStore,
        jobs: MemoryJobSink,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: registry(),
                rules: RuleBook::default(),
                settings: ImportSettings::default(),
                store: MemoryStore::new(),
                snapshots: MemorySnapshotStore::new(),
                jobs: MemoryJobSink::new(),
            }
        }

        fn run(&mut self, mode: ImportMode, batches: Vec<EntityBatch>) -> ExecutionOutcome {
            let ctx = ImportContext::new("acme", "tester", mode).with_job("job-1");
            ImportExecutor::new(&ctx, &self.registry, &self.rules, &self.settings)
                .execute(
                    &mut self.store,
                    &mut self.snapshots,
                    &mut self.jobs,
                    batches,
                    false,
                    None,
                )
                .unwrap()
        }
    }

    #[test]
    fn coerce_value_quantizes_and_parses() {
        let amount = FieldDescriptor::new("amount", FieldKind::Decimal(DecimalSpec::new(12, 2).unwrap()));
        assert_eq!(
            coerce_value(&amount, Value::from("1,234.565")).unwrap(),
            Value::Decimal(Decimal::new(123457, 2))
        );
        let flag = FieldDescriptor::new("flag", FieldKind::Boolean);
        assert_eq!(coerce_value(&flag, Value::from("Yes")).unwrap(), Value::Boolean(true));
        assert!(coerce_value(&flag, Value::from("maybe")).is_err());
        assert_eq!(coerce_value(&flag, Value::from("  ")).unwrap(), Value::Null);
    }

    #[test]
    fn token_registry_prefers_relation_target() {
        let mut tokens = TokenRegistry::default();
        tokens.register("account", "t1", 4);
        tokens.register("entry", "t1", 9);
        tokens.register("account", "Assets > Cash", 5);
        assert_eq!(tokens.resolve("entry", "account", "t1"), Some(4));
        assert_eq!(tokens.resolve("entry", "entry", "t1"), Some(9));
        assert_eq!(tokens.resolve("entry", "account", "Assets>Cash"), Some(5));
        assert_eq!(tokens.resolve("entry", "account", "nope"), None);
        tokens.register("bank", "b1", 1);
        assert_eq!(tokens.resolve("entry", "account", "b1"), None);
        assert_eq!(tokens.known_tokens(1).len(), 1);
    }

    #[test]
    fn forward_references_resolve_by_processing_order() {
        let mut harness = Harness::new();
        let batches = vec![
            EntityBatch::new("entry").with_rows(vec![entry(2, "t1", "10.005"), entry(3, "t1", "-10")]),
            EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Cash")]),
        ];
        let outcome = harness.run(ImportMode::Commit, batches);
        assert!(outcome.committed, "{:?}", outcome.errors);
        assert_eq!(outcome.entities[0].entity, "account");
        let entries = harness.store.records("entry");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fields["account_id"], Value::Integer(1));
        assert_eq!(entries[0].fields["amount"], Value::Decimal(Decimal::new(1001, 2)));
        assert_eq!(outcome.snapshots.len(), 2);
        assert_eq!(harness.jobs.job("job-1").unwrap().progress.ok_rows, 3);
    }

    #[test]
    fn preview_rolls_back_and_resets_sequences() {
        let mut harness = Harness::new();
        let batches = || vec![EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Cash")])];
        let first = harness.run(ImportMode::Preview, batches());
        let second = harness.run(ImportMode::Preview, batches());
        assert!(!first.committed);
        assert_eq!(first.entities[0].rows[0].record_id, Some(1));
        assert_eq!(first.entities[0].rows[0].record_id, second.entities[0].rows[0].record_id);
        assert_eq!(harness.store.total_records(), 0);
        assert_eq!(harness.store.sequence_value("account"), 0);
        assert!(harness.snapshots.is_empty());
    }

    #[test]
    fn failed_row_rolls_back_whole_commit() {
        let mut harness = Harness::new();
        let batches = vec![
            EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Cash")]),
            EntityBatch::new("entry").with_rows(vec![entry(2, "t1", "5"), entry(3, "missing", "5")]),
        ];
        let outcome = harness.run(ImportMode::Commit, batches);
        assert!(!outcome.committed);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].code, DiagnosticCode::Resolution);
        let known = outcome.errors[0].details["known_tokens"].as_array().unwrap();
        assert!(known.iter().any(|token| token == "t1"));
        assert_eq!(harness.store.total_records(), 0);
        assert_eq!(harness.store.sequence_value("account"), 0);
        let account_row = &outcome.entities[0].rows[0];
        assert_eq!(account_row.status, RowStatus::Warning);
        assert_eq!(account_row.warnings[0].code, DiagnosticCode::NotExecuted);
    }

    #[test]
    fn preflight_errors_block_commit_before_store_access() {
        let mut harness = Harness::new();
        let incomplete = Row::new("t2", "Accounts", 3).with_field("code", "2000");
        let batches = vec![EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Cash"), incomplete])];
        let outcome = harness.run(ImportMode::Commit, batches);
        assert!(!outcome.committed);
        assert_eq!(outcome.errors[0].code, DiagnosticCode::Preflight);
        assert_eq!(outcome.errors[0].row_number, Some(3));
        assert_eq!(outcome.entities[0].rows[0].status, RowStatus::Warning);
        assert!(!harness.store.in_transaction());
        assert_eq!(harness.store.sequence_value("account"), 0);
    }

    #[test]
    fn only_an_explicit_id_turns_a_row_into_an_update() {
        let mut harness = Harness::new();
        let first = harness.run(
            ImportMode::Commit,
            vec![EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Cash")])],
        );
        assert!(first.committed, "{:?}", first.errors);

        let again = harness.run(
            ImportMode::Commit,
            vec![EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Petty cash")])],
        );
        assert!(!again.committed);
        let row = &again.entities[0].rows[0];
        assert_eq!(row.action, None);
        let error = row.error.as_ref().unwrap();
        assert_eq!(error.category, Some(PersistenceCategory::DuplicateKey));
        assert_eq!(harness.store.count("account"), 1);

        let renamed = Row::new("t9", "Accounts", 3)
            .with_field("id", 1_i64)
            .with_field("code", "1000")
            .with_field("name", "Cash on hand")
            .with_field("colour", "red");
        let outcome = harness.run(
            ImportMode::Commit,
            vec![EntityBatch::new("account").with_rows(vec![renamed])],
        );
        assert!(outcome.committed, "{:?}", outcome.errors);
        let row = &outcome.entities[0].rows[0];
        assert_eq!(row.action, Some(RowAction::Update));
        assert_eq!(row.status, RowStatus::Warning);
        assert_eq!(row.warnings[0].code, DiagnosticCode::UnknownColumn);
        assert_eq!(harness.store.count("account"), 1);
        assert_eq!(
            harness.store.get("account", 1).unwrap().fields["name"],
            Value::from("Cash on hand")
        );
    }

    #[test]
    fn id_less_rows_without_unique_keys_always_create() {
        let mut harness = Harness::new();
        let batch = || vec![EntityBatch::new("bank").with_rows(vec![Row::new("b1", "Banks", 2).with_field("name", "First")])];
        harness.run(ImportMode::Commit, batch());
        let outcome = harness.run(ImportMode::Commit, batch());
        assert!(outcome.committed, "{:?}", outcome.errors);
        assert_eq!(outcome.entities[0].rows[0].action, Some(RowAction::Create));
        assert_eq!(outcome.entities[0].rows[0].record_id, Some(2));
        assert_eq!(harness.store.count("bank"), 2);
    }

    #[test]
    fn tokens_of_other_entity_types_never_fill_a_relation() {
        let mut harness = Harness::new();
        let batches = vec![
            EntityBatch::new("account").with_rows(vec![account("a1", "1000", "Cash")]),
            EntityBatch::new("bank").with_rows(vec![Row::new("t1", "Banks", 2).with_field("name", "First")]),
            EntityBatch::new("entry").with_rows(vec![entry(2, "t1", "5")]),
        ];
        let outcome = harness.run(ImportMode::Commit, batches);
        assert!(!outcome.committed);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].code, DiagnosticCode::Resolution);
        assert_eq!(outcome.errors[0].field.as_deref(), Some("account"));
        assert_eq!(harness.store.count("entry"), 0);
    }

    #[test]
    fn substitutions_attach_to_their_own_sheet_row() {
        let mut harness = Harness::new();
        let change = |sheet: &str| SubstitutionChange {
            sheet: sheet.to_string(),
            row_id: "t1".to_string(),
            field: "name".to_string(),
            old_value: Value::from("csh"),
            new_value: Value::from("Cash"),
            rule_id: "fix-name".to_string(),
        };
        let mut batch = EntityBatch::new("account").with_rows(vec![
            Row::new("t1", "SheetA", 2).with_field("code", "1000").with_field("name", "Cash"),
            Row::new("t1", "SheetB", 2).with_field("code", "2000").with_field("name", "Cash"),
        ]);
        batch.substitutions = vec![change("SheetA"), change("SheetB")];
        let outcome = harness.run(ImportMode::Preview, vec![batch]);
        let counts = outcome.entities[0]
            .rows
            .iter()
            .map(|row| row.substitutions.len())
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![1, 1]);
        assert_eq!(outcome.entities[0].rows[1].substitutions[0].sheet, "SheetB");
    }

    #[test]
    fn fingerprints_ignore_store_defaults() {
        let mut harness = Harness::new();
        let plain = harness.run(
            ImportMode::Commit,
            vec![EntityBatch::new("account").with_rows(vec![account("t1", "1000", "Cash")])],
        );
        let flagged = harness.run(
            ImportMode::Commit,
            vec![EntityBatch::new("account").with_rows(vec![
                Row::new("t2", "Accounts", 2)
                    .with_field("code", "2000")
                    .with_field("name", "Bank")
                    .with_field("active", true),
            ])],
        );
        assert!(plain.committed && flagged.committed);
        let history = harness.snapshots.recent("acme", "account", 5);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].column_names, vec!["code", "name"]);
        assert_eq!(history[0].column_names, vec!["active", "code", "name"]);
        assert_ne!(history[0].table_hash, history[1].table_hash);
    }
}
