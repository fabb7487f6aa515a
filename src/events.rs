//! Integration-event dispatch.
//!
//! After the executor saves a row it fires that row's events here. Each
//! active rule subscribed to the event either runs now, inside its own
//! save-point, or is handed back as a [`FollowOnRequest`] for a worker. A rule
//! body is a sandbox expression evaluated with `payload` bound; it returns
//! `{"transaction": {...}, "entries": [{...}, ...]}` and the dispatcher
//! persists at most one transaction plus its entries.

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::ImportContext,
    data::{Fields, Value},
    error::{Diagnostic, DiagnosticCode},
    executor::coerce_value,
    expr::Expression,
    job::FollowOnRequest,
    rules::{IntegrationRule, RuleStore},
    schema::{EntitySchema, SchemaProvider},
    store::{EntityStore, Record, RecordId},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchOutcome {
    /// Ids of synchronous rules that ran to completion.
    pub executed: Vec<String>,
    pub created: Vec<Record>,
    pub failed: Vec<Diagnostic>,
    /// Asynchronous rules, to be enqueued once the batch commits.
    pub deferred: Vec<FollowOnRequest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

impl DispatchOutcome {
    pub fn merge(&mut self, other: DispatchOutcome) {
        self.executed.extend(other.executed);
        self.created.extend(other.created);
        self.failed.extend(other.failed);
        self.deferred.extend(other.deferred);
        self.trace.extend(other.trace);
    }
}

/// Payload handed to rule bodies: the saved record's columns plus `id`,
/// `entity`, `action` and the row's trigger-only `extras`.
pub fn event_payload(record: &Record, action: &str, extras: &Fields) -> Value {
    let mut payload = record.fields.clone();
    payload.insert("id".to_string(), Value::Integer(record.id));
    payload.insert("entity".to_string(), Value::from(record.entity.as_str()));
    payload.insert("action".to_string(), Value::from(action));
    payload.insert("extras".to_string(), Value::Map(extras.clone()));
    Value::Map(payload)
}

pub struct Dispatcher<'a> {
    rules: &'a dyn RuleStore,
    schemas: &'a dyn SchemaProvider,
}

impl<'a> Dispatcher<'a> {
    pub fn new(rules: &'a dyn RuleStore, schemas: &'a dyn SchemaProvider) -> Self {
        Self { rules, schemas }
    }

    /// Runs the synchronous rules for `event` and collects the asynchronous
    /// ones. A failing rule is rolled back and reported; its siblings still run.
    pub fn dispatch(
        &self,
        ctx: &ImportContext,
        store: &mut dyn EntityStore,
        event: &str,
        payload: &Value,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for rule in self.rules.integration_rules(&ctx.company, event) {
            if rule.run_async {
                debug!("Deferring integration rule '{}' for {event}", rule.id);
                outcome.deferred.push(FollowOnRequest {
                    rule_id: rule.id.clone(),
                    company: ctx.company.clone(),
                    event: event.to_string(),
                    payload: payload.clone(),
                });
                continue;
            }

            let savepoint = format!("integration_{}", rule.id);
            let result = store
                .savepoint(&savepoint)
                .map_err(anyhow::Error::from)
                .and_then(|_| self.execute(rule, store, payload, &mut outcome.trace));
            match result {
                Ok(created) => {
                    if let Err(err) = store.release(&savepoint) {
                        warn!("Releasing save-point {savepoint}: {err}");
                    }
                    debug!("Integration rule '{}' created {} record(s)", rule.id, created.len());
                    outcome.executed.push(rule.id.clone());
                    outcome.created.extend(created);
                }
                Err(err) => {
                    warn!("Integration rule '{}' failed for {event}: {err:#}", rule.id);
                    if store.rollback_to(&savepoint).and_then(|_| store.release(&savepoint)).is_err() {
                        warn!("Could not roll back save-point {savepoint}");
                    }
                    outcome.failed.push(
                        Diagnostic::new(
                            DiagnosticCode::Integration,
                            format!("integration rule '{}' failed: {err:#}", rule.id),
                        )
                        .detail("rule_id", rule.id.clone())
                        .detail("event", event),
                    );
                }
            }
        }
        outcome
    }

    /// Executes a previously deferred rule in a transaction of its own.
    pub fn run_deferred(&self, store: &mut dyn EntityStore, request: &FollowOnRequest) -> Result<Vec<Record>> {
        let rule = self
            .rules
            .integration_rules(&request.company, &request.event)
            .into_iter()
            .find(|rule| rule.id == request.rule_id)
            .ok_or_else(|| {
                anyhow!(
                    "Integration rule '{}' is no longer active for {}",
                    request.rule_id,
                    request.event
                )
            })?;
        store.begin().context("Starting follow-on transaction")?;
        let mut trace = Vec::new();
        match self.execute(rule, store, &request.payload, &mut trace) {
            Ok(created) => {
                store.commit().context("Committing follow-on transaction")?;
                info!(
                    "Follow-on rule '{}' for {} created {} record(s)",
                    rule.id,
                    request.event,
                    created.len()
                );
                Ok(created)
            }
            Err(err) => {
                store.rollback().context("Rolling back follow-on transaction")?;
                Err(err.context(format!("Running follow-on rule '{}'", rule.id)))
            }
        }
    }

    fn execute(
        &self,
        rule: &IntegrationRule,
        store: &mut dyn EntityStore,
        payload: &Value,
        trace: &mut Vec<String>,
    ) -> Result<Vec<Record>> {
        let expression = Expression::compile(&rule.body)
            .with_context(|| format!("Compiling body of rule '{}'", rule.id))?;
        let mut bindings = Fields::new();
        bindings.insert("payload".to_string(), payload.clone());
        let body = match expression
            .evaluate_traced(&bindings, trace)
            .with_context(|| format!("Evaluating body of rule '{}'", rule.id))?
        {
            Value::Null => return Ok(Vec::new()),
            Value::Map(map) => map,
            other => bail!("Rule body returned {} instead of a mapping", other.type_name()),
        };

        let mut created = Vec::new();
        let transaction = match (body.get("transaction"), &rule.action.transaction_entity) {
            (None | Some(Value::Null), _) => None,
            (Some(Value::Map(fields)), Some(entity)) => {
                let schema = self.schema(entity)?;
                let record = store.insert(schema, record_fields(schema, fields)?)?;
                created.push(record.clone());
                Some(record)
            }
            (Some(Value::Map(_)), None) => bail!("Rule produced a transaction but names no transaction entity"),
            (Some(other), _) => bail!("'transaction' must be a mapping, got {}", other.type_name()),
        };

        let entries = match body.get("entries") {
            None | Some(Value::Null) => return Ok(created),
            Some(Value::List(items)) => items,
            Some(other) => bail!("'entries' must be a list, got {}", other.type_name()),
        };
        if entries.is_empty() {
            return Ok(created);
        }
        let parent = transaction
            .as_ref()
            .map(|record| record.id)
            .or_else(|| payload_id(payload))
            .ok_or_else(|| anyhow!("Entries need a parent but neither a transaction nor a triggering id exists"))?;
        let schema = self.schema(&rule.action.entry_entity)?;
        let parent_column = schema
            .field(&rule.action.parent_field)
            .map(|field| field.attribute_name())
            .ok_or_else(|| {
                anyhow!(
                    "Entity '{}' has no parent field '{}'",
                    schema.name,
                    rule.action.parent_field
                )
            })?;
        for (idx, entry) in entries.iter().enumerate() {
            let Value::Map(fields) = entry else {
                bail!("Entry {idx} must be a mapping, got {}", entry.type_name());
            };
            let mut fields = record_fields(schema, fields)?;
            fields.insert(parent_column.clone(), Value::Integer(parent));
            let record = store
                .insert(schema, fields)
                .with_context(|| format!("Creating entry {idx}"))?;
            created.push(record);
        }
        Ok(created)
    }

    fn schema(&self, entity: &str) -> Result<&'a EntitySchema> {
        self.schemas
            .entity(entity)
            .ok_or_else(|| anyhow!("Unknown entity '{entity}'"))
    }
}

fn payload_id(payload: &Value) -> Option<RecordId> {
    match payload {
        Value::Map(map) => map.get("id").and_then(Value::as_i64),
        _ => None,
    }
}

/// Maps a rule-produced field map onto stored columns with typed values.
fn record_fields(schema: &EntitySchema, produced: &Fields) -> Result<Fields> {
    let mut fields = Fields::new();
    for (key, value) in produced {
        let (field, _) = schema
            .resolve_key(key)
            .ok_or_else(|| anyhow!("Unknown field '{key}' on '{}'", schema.name))?;
        let coerced = coerce_value(field, value.clone()).map_err(|message| anyhow!("'{key}': {message}"))?;
        fields.insert(field.attribute_name(), coerced);
    }
    Ok(fields)
}
