//! Tenant-configured rules: transformations, substitutions and integration
//! rules, with the read-only [`RuleStore`] accessor the pipeline uses.

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    data::{Fields, Value},
    filter::Condition,
};

const fn default_true() -> bool {
    true
}

fn default_separator() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Joins several source columns into one target field, either with a
/// separator or through a `{column}` template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concatenation {
    pub target: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedColumn {
    pub target: String,
    pub expression: String,
}

/// Which integration events fire after a row of this rule is saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fired in order; empty means `<entity>.created` / `<entity>.updated`.
    #[serde(default)]
    pub events: Vec<String>,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            events: Vec::new(),
        }
    }
}

impl TriggerOptions {
    pub fn events_for(&self, entity: &str, action: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        if self.events.is_empty() {
            return vec![format!("{entity}.{action}d")];
        }
        self.events.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRule {
    pub id: String,
    pub company: String,
    pub entity: String,
    pub sheet_name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Leading rows dropped before the header is located.
    #[serde(default)]
    pub skip_rows: usize,
    /// Header position counted after `skip_rows`.
    #[serde(default)]
    pub header_row: usize,
    /// Maximum data rows to process; 0 is unlimited.
    #[serde(default)]
    pub row_limit: usize,
    #[serde(default)]
    pub column_mappings: Vec<ColumnMapping>,
    #[serde(default)]
    pub concatenations: Vec<Concatenation>,
    #[serde(default)]
    pub computed: Vec<ComputedColumn>,
    #[serde(default)]
    pub defaults: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_filter: Option<String>,
    /// Trigger-only values: extra name -> source column.
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub triggers: TriggerOptions,
}

impl TransformationRule {
    pub fn new(id: &str, company: &str, entity: &str, sheet_name: &str) -> Self {
        Self {
            id: id.to_string(),
            company: company.to_string(),
            entity: entity.to_string(),
            sheet_name: sheet_name.to_string(),
            active: true,
            skip_rows: 0,
            header_row: 0,
            row_limit: 0,
            column_mappings: Vec::new(),
            concatenations: Vec::new(),
            computed: Vec::new(),
            defaults: Fields::new(),
            row_filter: None,
            extra_fields: BTreeMap::new(),
            triggers: TriggerOptions::default(),
        }
    }

    pub fn map(mut self, source: &str, target: &str) -> Self {
        self.column_mappings.push(ColumnMapping {
            source: source.to_string(),
            target: target.to_string(),
            required: true,
        });
        self
    }

    pub fn map_optional(mut self, source: &str, target: &str) -> Self {
        self.column_mappings.push(ColumnMapping {
            source: source.to_string(),
            target: target.to_string(),
            required: false,
        });
        self
    }

    pub fn compute(mut self, target: &str, expression: &str) -> Self {
        self.computed.push(ComputedColumn {
            target: target.to_string(),
            expression: expression.to_string(),
        });
        self
    }

    pub fn default_value(mut self, target: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(target.to_string(), value.into());
        self
    }

    pub fn filter_rows(mut self, expression: &str) -> Self {
        self.row_filter = Some(expression.to_string());
        self
    }

    pub fn matches_sheet(&self, sheet: &str) -> bool {
        self.sheet_name.trim().eq_ignore_ascii_case(sheet.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Exact,
    Regex,
    /// Case- and accent-insensitive equality.
    #[serde(alias = "iexact", alias = "insensitive")]
    Caseless,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionRule {
    pub id: String,
    pub company: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Raw header name, used when the column has no entity mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_index: Option<usize>,
    #[serde(default)]
    pub match_type: MatchType,
    pub match_value: String,
    pub substitution_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Condition>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl SubstitutionRule {
    pub fn exact(id: &str, company: &str, entity: &str, field: &str, from: &str, to: impl Into<Value>) -> Self {
        Self {
            id: id.to_string(),
            company: company.to_string(),
            entity: Some(entity.to_string()),
            field: Some(field.to_string()),
            column_name: None,
            column_index: None,
            match_type: MatchType::Exact,
            match_value: from.to_string(),
            substitution_value: to.into(),
            filter: None,
            active: true,
        }
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn with_filter(mut self, filter: Condition) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Where a journal action writes the records its body produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_entity: Option<String>,
    pub entry_entity: String,
    /// Relation on the entry pointing at the created transaction, or at the
    /// triggering record when the body produces no transaction.
    pub parent_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRule {
    pub id: String,
    pub company: String,
    pub event: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// Expression evaluated with `payload` bound; returns
    /// `{"transaction": {...}, "entries": [{...}, ...]}`.
    pub body: String,
    pub action: JournalAction,
}

/// Read-only access to the active rules of a tenant.
pub trait RuleStore {
    fn transformation_rules(&self, company: &str) -> Vec<&TransformationRule>;
    fn substitution_rules(&self, company: &str) -> Vec<&SubstitutionRule>;
    /// Active rules for `event` in execution order.
    fn integration_rules(&self, company: &str, event: &str) -> Vec<&IntegrationRule>;

    /// First active rule whose sheet name matches case-insensitively.
    fn transformation_rule_for_sheet(&self, company: &str, sheet: &str) -> Option<&TransformationRule> {
        self.transformation_rules(company)
            .into_iter()
            .find(|rule| rule.matches_sheet(sheet))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleBook {
    #[serde(default)]
    pub transformations: Vec<TransformationRule>,
    #[serde(default)]
    pub substitutions: Vec<SubstitutionRule>,
    #[serde(default)]
    pub integrations: Vec<IntegrationRule>,
}

impl RuleBook {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening rules file {path:?}"))?;
        let book: RuleBook = serde_yaml::from_reader(BufReader::new(file)).context("Parsing rules YAML")?;
        book.validate()?;
        Ok(book)
    }

    /// Structural checks only; expressions and patterns are compiled when a
    /// sheet is prepared so a broken rule fails its own sheet.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.transformations {
            ensure!(!rule.entity.trim().is_empty(), "Transformation rule '{}' has no entity", rule.id);
            for mapping in &rule.column_mappings {
                ensure!(
                    !mapping.source.trim().is_empty() && !mapping.target.trim().is_empty(),
                    "Transformation rule '{}' has an empty column mapping",
                    rule.id
                );
            }
        }
        for rule in &self.substitutions {
            ensure!(
                rule.field.is_some() || rule.column_name.is_some() || rule.column_index.is_some(),
                "Substitution rule '{}' targets neither a field nor a column",
                rule.id
            );
        }
        Ok(())
    }
}

impl RuleStore for RuleBook {
    fn transformation_rules(&self, company: &str) -> Vec<&TransformationRule> {
        self.transformations
            .iter()
            .filter(|rule| rule.active && rule.company == company)
            .collect()
    }

    fn substitution_rules(&self, company: &str) -> Vec<&SubstitutionRule> {
        self.substitutions
            .iter()
            .filter(|rule| rule.active && rule.company == company)
            .collect()
    }

    fn integration_rules(&self, company: &str, event: &str) -> Vec<&IntegrationRule> {
        let mut rules = self
            .integrations
            .iter()
            .filter(|rule| rule.active && rule.company == company && rule.event == event)
            .collect::<Vec<_>>();
        rules.sort_by_key(|rule| rule.order);
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_book_parses_from_yaml() {
        let yaml = r#"
transformations:
  - id: tx-bank
    company: acme
    entity: transaction
    sheet_name: Bank
    skip_rows: 2
    column_mappings:
      - { source: Date, target: date }
      - { source: Memo, target: memo, required: false }
    computed:
      - { target: amount, expression: "credit - debit" }
    triggers:
      events: [transaction.imported]
substitutions:
  - id: s1
    company: acme
    entity: transaction
    field: status
    match_value: PEND
    substitution_value: pending
integrations:
  - id: late
    company: acme
    event: transaction.created
    order: 20
    body: "{}"
    action: { entry_entity: entry, parent_field: transaction }
  - id: early
    company: acme
    event: transaction.created
    order: 10
    async: true
    body: "{}"
    action: { entry_entity: entry, parent_field: transaction }
"#;
        let book: RuleBook = serde_yaml::from_str(yaml).unwrap();
        book.validate().unwrap();

        let rule = book.transformation_rule_for_sheet("acme", "bank").unwrap();
        assert_eq!(rule.skip_rows, 2);
        assert!(rule.column_mappings[0].required);
        assert!(!rule.column_mappings[1].required);
        assert_eq!(
            rule.triggers.events_for("transaction", "create"),
            vec!["transaction.imported".to_string()]
        );
        assert!(book.transformation_rule_for_sheet("other", "Bank").is_none());

        assert_eq!(book.substitution_rules("acme")[0].match_type, MatchType::Exact);

        let ordered = book
            .integration_rules("acme", "transaction.created")
            .iter()
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ordered, vec!["early", "late"]);
        assert!(book.integration_rules("acme", "transaction.created")[0].run_async);
    }

    #[test]
    fn default_trigger_events_follow_action() {
        let options = TriggerOptions::default();
        assert_eq!(options.events_for("account", "create"), vec!["account.created"]);
        assert_eq!(options.events_for("account", "update"), vec!["account.updated"]);
        let disabled = TriggerOptions {
            enabled: false,
            events: vec!["x".into()],
        };
        assert!(disabled.events_for("account", "create").is_empty());
    }

    #[test]
    fn substitution_rule_without_target_is_rejected() {
        let mut rule = SubstitutionRule::exact("s", "acme", "transaction", "status", "a", "b");
        rule.field = None;
        let book = RuleBook {
            substitutions: vec![rule],
            ..RuleBook::default()
        };
        assert!(book.validate().is_err());
    }
}
