//! Tenant find/replace rules applied to transformed rows.
//!
//! Each field of each row is offered to its candidate rules in stored order.
//! A rule whose filter passes and whose match test succeeds rewrites the
//! field; the first such rule wins. Every rewrite is recorded as a
//! [`SubstitutionChange`].

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use log::debug;
use regex::Regex;
use serde::Serialize;

use crate::{
    config::{ImportContext, ImportMode},
    data::{Row, Value, normalize_column_name},
    rules::{MatchType, RuleStore, SubstitutionRule},
    schema::{EntitySchema, KeyForm},
    transform::string_ops::{fold_caseless, looks_like_path, normalize_path},
};

/// (entity, sheet, row_id) tuples already substituted during a commit run.
pub type ProcessedSet = HashSet<(String, String, String)>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubstitutionChange {
    pub sheet: String,
    pub row_id: String,
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub rule_id: String,
}

#[derive(Debug)]
struct CompiledRule {
    rule: SubstitutionRule,
    regex: Option<Regex>,
    folded: String,
}

impl CompiledRule {
    fn compile(rule: SubstitutionRule) -> Result<Self> {
        let regex = match rule.match_type {
            MatchType::Regex => Some(
                Regex::new(&rule.match_value)
                    .with_context(|| format!("Substitution rule '{}' has an invalid regex", rule.id))?,
            ),
            _ => None,
        };
        if let Some(filter) = &rule.filter {
            filter
                .validate()
                .with_context(|| format!("Substitution rule '{}' has an invalid filter", rule.id))?;
        }
        let folded = fold_caseless(&normalize_path(&rule.match_value));
        Ok(Self { rule, regex, folded })
    }

    fn targets_entity(&self, entity: &str) -> bool {
        self.rule
            .entity
            .as_deref()
            .is_none_or(|e| e.eq_ignore_ascii_case(entity))
    }

    fn targets_field(&self, entity: &str, field: &str) -> bool {
        self.rule.field.as_deref().is_some_and(|f| f == field) && self.targets_entity(entity)
    }

    fn targets_column(&self, column: &str, index: Option<usize>) -> bool {
        let by_name = self
            .rule
            .column_name
            .as_deref()
            .is_some_and(|name| normalize_column_name(name) == normalize_column_name(column));
        let by_index = matches!((self.rule.column_index, index), (Some(a), Some(b)) if a == b);
        by_name || by_index
    }

    /// Applies the match test, returning the replacement on success.
    fn replacement(&self, original: &str, path_like: bool) -> Option<Value> {
        let candidate = if path_like {
            normalize_path(original)
        } else {
            std::borrow::Cow::Borrowed(original)
        };
        match self.rule.match_type {
            MatchType::Exact => {
                let expected = if path_like {
                    normalize_path(&self.rule.match_value)
                } else {
                    std::borrow::Cow::Borrowed(self.rule.match_value.as_str())
                };
                (candidate == expected).then(|| self.rule.substitution_value.clone())
            }
            MatchType::Caseless => {
                (fold_caseless(&candidate) == self.folded).then(|| self.rule.substitution_value.clone())
            }
            MatchType::Regex => {
                let regex = self.regex.as_ref()?;
                if !regex.is_match(&candidate) {
                    return None;
                }
                let template = self.rule.substitution_value.as_display();
                Some(Value::String(regex.replace_all(&candidate, template.as_str()).into_owned()))
            }
        }
    }
}

/// (entity, field, column index, original text). The index keeps index-based
/// rules from leaking between sheets with different layouts.
type CacheKey = (String, String, Option<usize>, String);

#[derive(Debug)]
pub struct SubstitutionEngine {
    rules: Vec<CompiledRule>,
    cache: HashMap<CacheKey, Option<(Value, String)>>,
    cache_enabled: bool,
    cache_hits: usize,
}

impl SubstitutionEngine {
    /// Compiles the rules; an invalid pattern or filter is a preparation error.
    pub fn new(rules: Vec<SubstitutionRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .filter(|rule| rule.active)
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            cache: HashMap::new(),
            cache_enabled: true,
            cache_hits: 0,
        })
    }

    pub fn for_company(store: &dyn RuleStore, company: &str) -> Result<Self> {
        Self::new(store.substitution_rules(company).into_iter().cloned().collect())
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Rewrites `rows` for `entity`. `columns` is the sheet's column order,
    /// used by index-based rules.
    pub fn apply(
        &mut self,
        ctx: &ImportContext,
        entity: &str,
        schema: Option<&EntitySchema>,
        columns: &[String],
        rows: Vec<Row>,
        processed: &mut ProcessedSet,
    ) -> (Vec<Row>, Vec<SubstitutionChange>) {
        let mut changes = Vec::new();
        if self.rules.is_empty() {
            return (rows, changes);
        }
        let mut output = Vec::with_capacity(rows.len());
        for mut row in rows {
            if ctx.mode == ImportMode::Commit {
                let key = (entity.to_string(), row.sheet.clone(), row.row_id.clone());
                if !processed.insert(key) {
                    debug!("Row {} of '{}' already substituted; skipping", row.row_id, row.sheet);
                    output.push(row);
                    continue;
                }
            }
            self.apply_row(entity, schema, columns, &mut row, &mut changes);
            output.push(row);
        }
        (output, changes)
    }

    fn apply_row(
        &mut self,
        entity: &str,
        schema: Option<&EntitySchema>,
        columns: &[String],
        row: &mut Row,
        changes: &mut Vec<SubstitutionChange>,
    ) {
        let keys = row.fields.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            let Some(original) = row.fields.get(&key).cloned() else {
                continue;
            };
            if original.is_blank() || matches!(original, Value::List(_) | Value::Map(_)) {
                continue;
            }
            let candidates = self.candidate_rules(entity, schema, columns, &key);
            if candidates.is_empty() {
                continue;
            }
            let original_text = original.as_display();
            let path_like = key.contains("path") || looks_like_path(&original_text);
            let cacheable = self.cache_enabled && candidates.iter().all(|&i| self.rules[i].rule.filter.is_none());
            let column_index = columns.iter().position(|c| *c == key);
            let cache_key = (entity.to_string(), key.clone(), column_index, original_text.clone());

            let outcome = match self.cache.get(&cache_key).filter(|_| cacheable) {
                Some(hit) => {
                    self.cache_hits += 1;
                    hit.clone()
                }
                None => {
                    let computed = candidates.iter().find_map(|&index| {
                        let compiled = &self.rules[index];
                        if let Some(filter) = &compiled.rule.filter
                            && !filter.evaluate(&row.fields)
                        {
                            return None;
                        }
                        compiled
                            .replacement(&original_text, path_like)
                            .map(|value| (value, compiled.rule.id.clone()))
                    });
                    if cacheable {
                        self.cache.insert(cache_key, computed.clone());
                    }
                    computed
                }
            };

            let Some((replacement, rule_id)) = outcome else {
                continue;
            };
            let replacement = coerce_replacement(schema, &key, replacement);
            if replacement == original {
                continue;
            }
            debug!(
                "Substituted {}.{key} '{}' -> '{}' (rule {rule_id})",
                entity,
                original_text,
                replacement.as_display()
            );
            changes.push(SubstitutionChange {
                sheet: row.sheet.clone(),
                row_id: row.row_id.clone(),
                field: key.clone(),
                old_value: original,
                new_value: replacement.clone(),
                rule_id,
            });
            row.fields.insert(key, replacement);
        }
    }

    /// Indexes of the rules that may rewrite `key`, in stored order.
    fn candidate_rules(
        &self,
        entity: &str,
        schema: Option<&EntitySchema>,
        columns: &[String],
        key: &str,
    ) -> Vec<usize> {
        let resolved = schema.and_then(|s| s.resolve_key(key));
        let field_name = resolved.map(|(field, _)| field.name.as_str());
        let related = resolved.and_then(|(field, _)| field.relation_target());
        let index = columns.iter().position(|c| c == key);
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, compiled)| {
                if compiled.targets_field(entity, key) || field_name.is_some_and(|f| compiled.targets_field(entity, f)) {
                    return true;
                }
                if let Some(target) = related
                    && compiled.targets_field(target, "id")
                    && compiled.rule.entity.is_some()
                {
                    return true;
                }
                resolved.is_none() && compiled.targets_entity(entity) && compiled.targets_column(key, index)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Id-style targets receive integers when the replacement is numeric.
fn coerce_replacement(schema: Option<&EntitySchema>, key: &str, value: Value) -> Value {
    let id_style = match schema.and_then(|s| s.resolve_key(key)) {
        Some((_, KeyForm::Token)) => false,
        Some((field, _)) => field.is_relation() || field.primary_key,
        None => key == "id" || key.ends_with("_id"),
    };
    if !id_style {
        return value;
    }
    match value.as_i64() {
        Some(id) => Value::Integer(id),
        None => value,
    }
}
