//! Sheet-to-entity transformation.
//!
//! [`transform`] turns a raw grid into rows of target fields by applying a
//! [`TransformationRule`]: header offsets, empty-row removal, the row cap,
//! column mappings, concatenations, computed columns, defaults and trigger-only
//! extras. A fatal problem (missing required column, broken expression,
//! computed-column failure) fails the sheet and leaves the others untouched.

pub mod string_ops;

use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, warn};
use serde::Serialize;

use crate::{
    data::{Fields, Row, Value, coerce_date, coerce_datetime, normalize_column_name, synthetic_row_token},
    error::{Diagnostic, DiagnosticCode, ImportError},
    expr::Expression,
    rules::{ColumnMapping, TransformationRule},
    schema::{EntitySchema, FieldKind},
};

/// Column carrying an explicit row token.
pub const ROW_ID_COLUMN: &str = "__row_id";

const MAX_SUGGESTIONS: usize = 5;

/// One sheet as delivered by the upstream reader.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSheet {
    pub name: String,
    /// Target entity when no transformation rule claims the sheet.
    pub entity: Option<String>,
    pub grid: Vec<Vec<Value>>,
}

impl RawSheet {
    pub fn new(name: &str, grid: Vec<Vec<Value>>) -> Self {
        Self {
            name: name.to_string(),
            entity: None,
            grid,
        }
    }

    pub fn with_entity(mut self, entity: &str) -> Self {
        self.entity = Some(entity.to_string());
        self
    }

    /// Builds a sheet from a header row and text cells.
    pub fn from_text(name: &str, headers: &[&str], rows: &[&[&str]]) -> Self {
        let mut grid = vec![headers.iter().map(|h| Value::from(*h)).collect::<Vec<_>>()];
        grid.extend(
            rows.iter()
                .map(|row| row.iter().map(|cell| Value::from_cell(cell)).collect::<Vec<_>>()),
        );
        Self::new(name, grid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub input_rows: usize,
    pub empty_rows: usize,
    pub limited_rows: usize,
    pub filtered_rows: usize,
    pub dropped_blank_rows: usize,
    pub output_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformOutcome {
    pub sheet: String,
    pub entity: String,
    pub rows: Vec<Row>,
    /// Source headers in sheet order.
    pub columns: Vec<String>,
    pub warnings: Vec<Diagnostic>,
    pub errors: Vec<Diagnostic>,
    pub stats: TransformStats,
}

impl TransformOutcome {
    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    fn fail(mut self, error: ImportError) -> Self {
        warn!("Sheet '{}' failed: {error}", self.sheet);
        self.rows.clear();
        self.stats.output_rows = 0;
        self.errors.push(error.to_diagnostic().sheet(&self.sheet));
        self
    }
}

/// Rule used for a sheet that names its entity but has no configured rule:
/// every header maps to its snake_case field name.
pub fn identity_rule(sheet: &RawSheet, company: &str, entity: &str) -> TransformationRule {
    let mut rule = TransformationRule::new(&format!("identity:{}", sheet.name), company, entity, &sheet.name);
    if let Some(headers) = sheet.grid.first() {
        for header in headers.iter().map(Value::as_display) {
            let trimmed = header.trim();
            if trimmed.is_empty() || trimmed == ROW_ID_COLUMN {
                continue;
            }
            rule = rule.map_optional(trimmed, &string_ops::snake_case(trimmed));
        }
    }
    rule
}

struct Prepared {
    filter: Option<Expression>,
    computed: Vec<(String, Expression)>,
    mappings: Vec<(ColumnMapping, usize)>,
    extras: Vec<(String, usize)>,
}

pub fn transform(sheet: &RawSheet, rule: &TransformationRule, schema: Option<&EntitySchema>) -> TransformOutcome {
    let mut outcome = TransformOutcome {
        sheet: sheet.name.clone(),
        entity: rule.entity.clone(),
        ..TransformOutcome::default()
    };

    let header_index = rule.skip_rows + rule.header_row;
    let Some(header_cells) = sheet.grid.get(header_index) else {
        return outcome.fail(ImportError::Preparation {
            sheet: sheet.name.clone(),
            message: format!("no header row at position {}", header_index + 1),
            suggestions: BTreeMap::new(),
        });
    };
    let headers = header_cells
        .iter()
        .map(|cell| cell.as_display().trim().to_string())
        .collect::<Vec<_>>();
    outcome.columns = headers.clone();

    let prepared = match prepare(sheet, rule, &headers, &mut outcome.warnings) {
        Ok(prepared) => prepared,
        Err(error) => return outcome.fail(error),
    };

    // (1-based source row number, cells)
    let mut data = sheet
        .grid
        .iter()
        .enumerate()
        .skip(header_index + 1)
        .map(|(idx, cells)| (idx + 1, cells))
        .collect::<Vec<_>>();
    outcome.stats.input_rows = data.len();
    data.retain(|(_, cells)| !cells.iter().all(Value::is_blank));
    outcome.stats.empty_rows = outcome.stats.input_rows - data.len();

    if rule.row_limit > 0 && data.len() > rule.row_limit {
        outcome.stats.limited_rows = data.len() - rule.row_limit;
        data.truncate(rule.row_limit);
        outcome.warnings.push(
            Diagnostic::new(
                DiagnosticCode::RowLimit,
                format!(
                    "row limit {} reached; {} row(s) skipped",
                    rule.row_limit, outcome.stats.limited_rows
                ),
            )
            .sheet(&sheet.name)
            .detail("skipped", outcome.stats.limited_rows),
        );
    }

    let row_id_index = headers.iter().position(|h| h == ROW_ID_COLUMN);
    for (row_number, cells) in data {
        let raw = raw_bindings(&headers, cells, row_number);
        if let Some(filter) = &prepared.filter {
            match filter.evaluate_to_bool(&raw) {
                Ok(true) => {}
                Ok(false) => {
                    outcome.stats.filtered_rows += 1;
                    continue;
                }
                Err(err) => {
                    outcome.stats.filtered_rows += 1;
                    outcome.warnings.push(
                        Diagnostic::new(DiagnosticCode::FilteredRows, format!("row filter failed: {err}"))
                            .sheet(&sheet.name)
                            .row(row_number),
                    );
                    continue;
                }
            }
        }

        let token = row_id_index
            .and_then(|idx| cells.get(idx))
            .filter(|v| !v.is_blank())
            .map(Value::as_display)
            .unwrap_or_else(|| synthetic_row_token(&sheet.name, row_number));
        let mut row = Row::new(token, sheet.name.clone(), row_number);

        for (mapping, idx) in &prepared.mappings {
            let value = cells.get(*idx).cloned().unwrap_or_default();
            row.fields.insert(mapping.target.clone(), coerce_for_field(schema, &mapping.target, value));
        }

        for concat in &rule.concatenations {
            let joined = match &concat.template {
                Some(template) => render_template(template, &headers, cells, &row.fields),
                None => concat
                    .sources
                    .iter()
                    .filter_map(|source| lookup_cell(&headers, cells, source))
                    .filter(|v| !v.is_blank())
                    .map(|v| v.as_display())
                    .join(&concat.separator),
            };
            row.fields.insert(concat.target.clone(), Value::from_cell(&joined));
        }

        if !prepared.computed.is_empty() {
            let mut bindings = raw.clone();
            for (target, expression) in &prepared.computed {
                bindings.extend(row.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                match expression.evaluate(&bindings) {
                    Ok(value) => {
                        row.fields.insert(target.clone(), coerce_for_field(schema, target, value));
                    }
                    Err(err) => {
                        let error = ImportError::Preparation {
                            sheet: sheet.name.clone(),
                            message: format!("computed column '{target}' failed on row {row_number}: {err}"),
                            suggestions: BTreeMap::new(),
                        };
                        return outcome.fail(error);
                    }
                }
            }
        }

        for (target, default) in &rule.defaults {
            if row.fields.get(target).is_none_or(Value::is_blank) {
                row.fields.insert(target.clone(), default.clone());
            }
        }

        for (name, idx) in &prepared.extras {
            row.extras.insert(name.clone(), cells.get(*idx).cloned().unwrap_or_default());
        }

        let blank_required = schema.and_then(|s| {
            s.fields
                .iter()
                .filter(|f| f.drop_if_blank)
                .find(|f| row.fields.get(&f.name).is_none_or(Value::is_blank))
        });
        if let Some(field) = blank_required {
            debug!("Dropping row {row_number} of '{}': '{}' is blank", sheet.name, field.name);
            outcome.stats.dropped_blank_rows += 1;
            continue;
        }
        outcome.rows.push(row);
    }
    outcome.stats.output_rows = outcome.rows.len();
    outcome
}

fn prepare(
    sheet: &RawSheet,
    rule: &TransformationRule,
    headers: &[String],
    warnings: &mut Vec<Diagnostic>,
) -> Result<Prepared, ImportError> {
    let preparation = |message: String| ImportError::Preparation {
        sheet: sheet.name.clone(),
        message,
        suggestions: BTreeMap::new(),
    };

    let mut mappings = Vec::with_capacity(rule.column_mappings.len());
    let mut missing = BTreeMap::new();
    for mapping in &rule.column_mappings {
        match find_column(headers, &mapping.source) {
            Some(idx) => mappings.push((mapping.clone(), idx)),
            None if mapping.required => {
                missing.insert(mapping.source.clone(), suggest_columns(&mapping.source, headers));
            }
            None => debug!("Optional column '{}' absent from '{}'", mapping.source, sheet.name),
        }
    }
    if !missing.is_empty() {
        return Err(ImportError::Preparation {
            sheet: sheet.name.clone(),
            message: format!(
                "missing required column(s): {}",
                missing.keys().join(", ")
            ),
            suggestions: missing,
        });
    }

    let filter = rule
        .row_filter
        .as_deref()
        .filter(|f| !f.trim().is_empty())
        .map(Expression::compile)
        .transpose()
        .map_err(|err| preparation(format!("invalid row filter: {err}")))?;
    let computed = rule
        .computed
        .iter()
        .map(|c| {
            Expression::compile(&c.expression)
                .map(|expr| (c.target.clone(), expr))
                .map_err(|err| preparation(format!("invalid expression for '{}': {err}", c.target)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut extras = Vec::new();
    let mut inverted = Vec::new();
    for (name, source) in &rule.extra_fields {
        match (find_column(headers, source), find_column(headers, name)) {
            (Some(idx), _) => extras.push((name.clone(), idx)),
            // Configured as column -> name; swap it.
            (None, Some(idx)) => {
                inverted.push(name.clone());
                extras.push((source.clone(), idx));
            }
            (None, None) => debug!("Extra field column '{source}' absent from '{}'", sheet.name),
        }
    }
    if !inverted.is_empty() {
        warnings.push(
            Diagnostic::new(
                DiagnosticCode::InvertedExtraFields,
                format!(
                    "extra field mapping looked inverted and was swapped for: {}",
                    inverted.join(", ")
                ),
            )
            .sheet(&sheet.name),
        );
    }

    Ok(Prepared {
        filter,
        computed,
        mappings,
        extras,
    })
}

fn find_column(headers: &[String], name: &str) -> Option<usize> {
    let wanted = name.trim();
    headers
        .iter()
        .position(|h| h == wanted)
        .or_else(|| headers.iter().position(|h| h.eq_ignore_ascii_case(wanted)))
}

fn lookup_cell(headers: &[String], cells: &[Value], name: &str) -> Option<Value> {
    find_column(headers, name).map(|idx| cells.get(idx).cloned().unwrap_or_default())
}

/// Expression bindings for one raw row: normalized header names, positional
/// `c0..cN` names and `row_number`.
fn raw_bindings(headers: &[String], cells: &[Value], row_number: usize) -> Fields {
    let mut bindings = Fields::new();
    for (idx, header) in headers.iter().enumerate() {
        let value = cells.get(idx).cloned().unwrap_or_default();
        if !header.is_empty() {
            bindings.insert(normalize_column_name(header), value.clone());
        }
        bindings.insert(format!("c{idx}"), value);
    }
    bindings.insert("row_number".to_string(), Value::Integer(row_number as i64));
    bindings
}

/// Fills `{Column}` placeholders from the raw cells, then from transformed fields.
fn render_template(template: &str, headers: &[String], cells: &[Value], fields: &Fields) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            rendered.push_str(&rest[start..]);
            return rendered;
        };
        let name = &after[..end];
        let value = lookup_cell(headers, cells, name)
            .or_else(|| fields.get(name).cloned())
            .unwrap_or_default();
        rendered.push_str(&value.as_display());
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);
    rendered
}

fn coerce_for_field(schema: Option<&EntitySchema>, target: &str, value: Value) -> Value {
    if value.is_blank() {
        return Value::Null;
    }
    let Some(field) = schema.and_then(|s| s.field(target)) else {
        return value;
    };
    match field.datatype {
        FieldKind::Date => coerce_date(&value).map(Value::Date).unwrap_or(value),
        FieldKind::DateTime => coerce_datetime(&value).map(Value::DateTime).unwrap_or(value),
        _ => value,
    }
}

/// Best-guess alternatives for a missing column: substring containment, shared
/// words, then edit similarity.
pub fn suggest_columns(missing: &str, available: &[String]) -> Vec<String> {
    let wanted = missing.trim().to_lowercase();
    let words = |s: &str| {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
    };
    let wanted_words = words(&wanted);

    let mut suggestions = Vec::new();
    for column in available {
        let lowered = column.to_lowercase();
        if lowered.is_empty() {
            continue;
        }
        let contains = lowered.contains(&wanted) || wanted.contains(&lowered);
        let overlaps = words(&lowered).iter().any(|w| wanted_words.contains(w));
        if contains || overlaps {
            suggestions.push(column.clone());
        }
    }
    let lowered = available.iter().map(|c| c.to_lowercase()).collect::<Vec<_>>();
    let candidates = lowered.iter().map(String::as_str).collect::<Vec<_>>();
    for close in similar::get_close_matches(wanted.as_str(), &candidates, MAX_SUGGESTIONS, 0.6) {
        if let Some(pos) = lowered.iter().position(|c| c == close) {
            suggestions.push(available[pos].clone());
        }
    }
    suggestions.into_iter().unique().take(MAX_SUGGESTIONS).collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use super::*;
    use crate::schema::{DecimalSpec, FieldDescriptor};

    fn bank_schema() -> EntitySchema {
        EntitySchema::new(
            "transaction",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("date", FieldKind::Date),
                FieldDescriptor::new("memo", FieldKind::String).nullable(),
                FieldDescriptor::new("amount", FieldKind::Decimal(DecimalSpec::new(12, 2).unwrap()))
                    .drop_if_blank(),
                FieldDescriptor::new("status", FieldKind::String).with_default("new"),
            ],
        )
    }

    fn bank_sheet() -> RawSheet {
        let mut grid = vec![
            vec![Value::from("Bank export"), Value::Null, Value::Null, Value::Null],
            vec![Value::from("Posted"), Value::from("Payee"), Value::from("Ref"), Value::from("Amount")],
        ];
        grid.push(vec![Value::Integer(45306), Value::from("Cafe"), Value::from("A1"), Value::from("-4.50")]);
        grid.push(vec![Value::Null, Value::Null, Value::Null, Value::Null]);
        grid.push(vec![Value::from("2024-01-16"), Value::from("Rent"), Value::from("A2"), Value::Null]);
        grid.push(vec![Value::from("2024-01-17"), Value::from("Salary"), Value::from("A3"), Value::from("2500")]);
        RawSheet::new("Bank", grid)
    }

    fn bank_rule() -> TransformationRule {
        let mut rule = TransformationRule::new("r1", "acme", "transaction", "bank")
            .map("posted", "date")
            .map("Amount", "amount")
            .map_optional("Category", "category");
        rule.skip_rows = 1;
        rule.concatenations.push(crate::rules::Concatenation {
            target: "memo".into(),
            sources: vec![],
            separator: " ".into(),
            template: Some("{Payee} ({Ref})".into()),
        });
        rule
    }

    #[test]
    fn maps_dates_concatenates_and_drops_blank_amounts() {
        let outcome = transform(&bank_sheet(), &bank_rule(), Some(&bank_schema()));
        assert!(!outcome.is_failed(), "{:?}", outcome.errors);
        assert_eq!(outcome.stats.input_rows, 4);
        assert_eq!(outcome.stats.empty_rows, 1);
        assert_eq!(outcome.stats.dropped_blank_rows, 1);
        assert_eq!(outcome.rows.len(), 2);

        let first = &outcome.rows[0];
        assert_eq!(first.row_number, 3);
        assert_eq!(first.row_id, "Bank:3");
        assert_eq!(first.fields["date"], Value::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()));
        assert_eq!(first.fields["memo"], Value::from("Cafe (A1)"));
        assert!(!first.fields.contains_key("category"));
    }

    #[test]
    fn missing_required_column_fails_with_suggestions() {
        let rule = TransformationRule::new("r", "acme", "transaction", "Bank").map("Posted Date", "date");
        let mut sheet = bank_sheet();
        sheet.grid.remove(0);
        let outcome = transform(&sheet, &rule, None);
        assert!(outcome.is_failed());
        assert!(outcome.rows.is_empty());
        let suggestions = &outcome.errors[0].details["suggestions"]["Posted Date"];
        assert_eq!(suggestions[0], "Posted");
    }

    #[test]
    fn filter_computed_defaults_and_row_limit() {
        let mut rule = bank_rule()
            .filter_rows("amount != None and decimal(amount) > 0 or payee == 'Cafe'")
            .compute("amount", "decimal(amount) * 2")
            .default_value("status", "imported");
        rule.row_limit = 3;
        let outcome = transform(&bank_sheet(), &rule, Some(&bank_schema()));
        assert!(!outcome.is_failed(), "{:?}", outcome.errors);
        assert_eq!(outcome.stats.limited_rows, 0);
        assert_eq!(outcome.stats.filtered_rows, 1);
        let amounts = outcome.rows.iter().map(|r| r.fields["amount"].clone()).collect::<Vec<_>>();
        assert_eq!(
            amounts,
            vec![Value::Decimal(Decimal::new(-900, 2)), Value::Decimal(Decimal::from(5000))]
        );
        assert!(outcome.rows.iter().all(|r| r.fields["status"] == Value::from("imported")));

        rule.row_limit = 1;
        let limited = transform(&bank_sheet(), &rule, Some(&bank_schema()));
        assert_eq!(limited.stats.limited_rows, 2);
        assert_eq!(limited.warnings[0].code, DiagnosticCode::RowLimit);
    }

    #[test]
    fn computed_failure_aborts_sheet() {
        let rule = bank_rule().compute("amount", "decimal(amount) / 0");
        let outcome = transform(&bank_sheet(), &rule, Some(&bank_schema()));
        assert!(outcome.is_failed());
        assert!(outcome.rows.is_empty());
        assert!(outcome.errors[0].message.contains("division by zero"));
    }

    #[test]
    fn extras_are_side_channel_and_inverted_config_is_fixed() {
        let mut rule = bank_rule();
        rule.extra_fields.insert("Ref".into(), "reference".into());
        let outcome = transform(&bank_sheet(), &rule, Some(&bank_schema()));
        assert_eq!(outcome.warnings[0].code, DiagnosticCode::InvertedExtraFields);
        let first = &outcome.rows[0];
        assert_eq!(first.extras["reference"], Value::from("A1"));
        assert!(!first.fields.contains_key("reference"));
    }

    #[test]
    fn explicit_row_ids_and_identity_rules() {
        let sheet = RawSheet::from_text(
            "Accounts",
            &["__row_id", "Account Name", "Code"],
            &[&["t1", "Cash", "1000"], &["", "Bank", "1010"]],
        )
        .with_entity("account");
        let rule = identity_rule(&sheet, "acme", "account");
        let outcome = transform(&sheet, &rule, None);
        assert_eq!(outcome.rows[0].row_id, "t1");
        assert_eq!(outcome.rows[1].row_id, "Accounts:3");
        assert_eq!(outcome.rows[0].fields["account_name"], Value::from("Cash"));
        assert!(!outcome.rows[0].fields.contains_key("__row_id"));
    }

    #[test]
    fn suggestions_use_overlap_and_similarity() {
        let available = vec!["Posting Date".to_string(), "Amount".to_string(), "Descripton".to_string()];
        assert_eq!(suggest_columns("Date", &available), vec!["Posting Date"]);
        assert_eq!(suggest_columns("Description", &available), vec!["Descripton"]);
    }
}
