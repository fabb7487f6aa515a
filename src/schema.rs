//! Entity schema registry.
//!
//! The importer never introspects a live database. Every entity it can write
//! is declared up front in the workspace YAML: field names, datatypes,
//! nullability, defaults, relations and the dependency priority used to order
//! multi-entity batches.
//!
//! ## Key spellings
//!
//! A relation field `account` (pointing at entity `account`) is accepted in a
//! row under three spellings:
//!
//! - `account`: the related record's id or a row token,
//! - `account_id`: the attribute form, always an integer id once resolved,
//! - `account_fk`: a row token registered earlier in the same run.
//!
//! `account_path_fk` is accepted as an alias of `account_fk`; path-style
//! sheets use it to reference hierarchical parents.

use std::{collections::BTreeMap, fmt, fs::File, io::BufReader, path::Path, str::FromStr};

use anyhow::{Context, Result, anyhow, bail, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::data::Value;

const DECIMAL_MAX_PRECISION: u32 = 28;

/// Audit columns that never take part in content fingerprints.
pub const AUDIT_FIELDS: &[&str] = &["created_at", "updated_at", "created_by", "updated_by"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecimalSpec {
    pub precision: u32,
    pub scale: u32,
}

impl DecimalSpec {
    pub fn new(precision: u32, scale: u32) -> Result<Self> {
        let spec = Self { precision, scale };
        spec.ensure_valid()?;
        Ok(spec)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        ensure!(self.precision > 0, "Decimal precision must be positive");
        ensure!(
            self.precision <= DECIMAL_MAX_PRECISION,
            "Decimal precision must be <= {}",
            DECIMAL_MAX_PRECISION
        );
        ensure!(
            self.scale <= self.precision,
            "Decimal scale ({}) cannot exceed precision ({})",
            self.scale,
            self.precision
        );
        Ok(())
    }

    pub fn signature(&self) -> String {
        format!("decimal({},{})", self.precision, self.scale)
    }

    /// Digits allowed before the decimal point.
    pub fn integer_digits(&self) -> u32 {
        self.precision - self.scale
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Decimal(DecimalSpec),
    Boolean,
    Date,
    DateTime,
    Relation(String),
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Decimal(_) => "decimal",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::Relation(_) => "relation",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "string",
            "integer",
            "decimal(precision,scale)",
            "boolean",
            "date",
            "datetime",
            "relation(entity)",
        ]
    }

    pub fn signature_token(&self) -> String {
        match self {
            FieldKind::Decimal(spec) => spec.signature(),
            FieldKind::Relation(target) => format!("relation({target})"),
            _ => self.as_str().to_string(),
        }
    }

    pub fn decimal_spec(&self) -> Option<&DecimalSpec> {
        match self {
            FieldKind::Decimal(spec) => Some(spec),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature_token())
    }
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "string" | "text" => Ok(FieldKind::String),
            "integer" | "int" => Ok(FieldKind::Integer),
            "boolean" | "bool" => Ok(FieldKind::Boolean),
            "date" => Ok(FieldKind::Date),
            "datetime" | "timestamp" => Ok(FieldKind::DateTime),
            other if other.starts_with("decimal") => parse_decimal_kind(value),
            other if other.starts_with("relation") || other.starts_with("fk") => {
                parse_relation_kind(value)
            }
            _ => Err(anyhow!(
                "Unknown field datatype '{value}'. Supported types: {}",
                FieldKind::variants().join(", ")
            )),
        }
    }
}

fn parenthesized(value: &str, example: &str) -> Result<String> {
    let trimmed = value.trim();
    let start = trimmed
        .find('(')
        .ok_or_else(|| anyhow!("Datatype '{trimmed}' needs arguments, e.g. {example}"))?;
    ensure!(
        trimmed.ends_with(')'),
        "Datatype '{trimmed}' must close with ')', e.g. {example}"
    );
    Ok(trimmed[start + 1..trimmed.len() - 1].to_string())
}

fn parse_decimal_kind(value: &str) -> Result<FieldKind> {
    let inner = parenthesized(value, "decimal(18,2)")?;
    let mut precision: Option<u32> = None;
    let mut scale: Option<u32> = None;
    let mut positional = Vec::new();

    for part in inner.split(',') {
        let token = part.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((key, raw)) = token
            .split_once(['=', ':'])
            .map(|(k, v)| (k.trim(), v.trim()))
        {
            let parsed: u32 = raw
                .parse()
                .with_context(|| format!("Parsing decimal {key}='{raw}' in '{token}'"))?;
            match key.to_ascii_lowercase().as_str() {
                "precision" => precision = Some(parsed),
                "scale" => scale = Some(parsed),
                other => bail!("Unknown decimal option '{other}' in '{token}'"),
            }
        } else {
            positional.push(token);
        }
    }
    ensure!(
        positional.len() <= 2,
        "Decimal type accepts at most two positional arguments"
    );
    if let Some(first) = positional.first()
        && precision.is_none()
    {
        precision = Some(
            first
                .parse()
                .with_context(|| format!("Parsing decimal precision from '{first}' in '{value}'"))?,
        );
    }
    if let Some(second) = positional.get(1)
        && scale.is_none()
    {
        scale = Some(
            second
                .parse()
                .with_context(|| format!("Parsing decimal scale from '{second}' in '{value}'"))?,
        );
    }
    let precision =
        precision.ok_or_else(|| anyhow!("Decimal type requires a precision value, e.g. decimal(18,2)"))?;
    let scale = scale.ok_or_else(|| anyhow!("Decimal type requires a scale value, e.g. decimal(18,2)"))?;
    Ok(FieldKind::Decimal(DecimalSpec::new(precision, scale)?))
}

fn parse_relation_kind(value: &str) -> Result<FieldKind> {
    let target = parenthesized(value, "relation(account)")?;
    let target = target.trim();
    ensure!(!target.is_empty(), "Relation datatype requires a target entity");
    Ok(FieldKind::Relation(target.to_string()))
}

impl Serialize for FieldKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.signature_token())
    }
}

impl<'de> Deserialize<'de> for FieldKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        parse_structured_kind(value).map_err(de::Error::custom)
    }
}

/// Accepts `decimal(12,2)` tokens as well as `{decimal: {precision, scale}}`
/// and `{relation: account}` maps.
fn parse_structured_kind(value: serde_yaml::Value) -> Result<FieldKind> {
    if let Some(token) = value.as_str() {
        return FieldKind::from_str(token);
    }
    if let Some(mapping) = value.as_mapping()
        && mapping.len() == 1
        && let Some((key, inner)) = mapping.iter().next()
    {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("Structured datatype key must be a string"))?
            .trim()
            .to_ascii_lowercase();
        return match key.as_str() {
            "decimal" => {
                let spec: DecimalSpec = serde_yaml::from_value(inner.clone())
                    .context("Decimal mapping requires precision and scale")?;
                spec.ensure_valid()?;
                Ok(FieldKind::Decimal(spec))
            }
            "relation" => inner
                .as_str()
                .map(|target| FieldKind::Relation(target.trim().to_string()))
                .ok_or_else(|| anyhow!("Relation mapping must name a target entity")),
            other => Err(anyhow!("Unsupported structured datatype '{other}'")),
        };
    }
    Err(anyhow!("Unsupported field datatype representation: {value:?}"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub datatype: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    /// Value written on insert when the payload leaves the field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub auto_timestamp: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    /// Rows whose value for this field is blank are dropped during transformation.
    #[serde(default)]
    pub drop_if_blank: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, datatype: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            nullable: false,
            default: None,
            auto_timestamp: false,
            primary_key: false,
            unique: false,
            drop_if_blank: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn auto_timestamp(mut self) -> Self {
        self.auto_timestamp = true;
        self.nullable = true;
        self
    }

    pub fn drop_if_blank(mut self) -> Self {
        self.drop_if_blank = true;
        self
    }

    pub fn relation_target(&self) -> Option<&str> {
        match &self.datatype {
            FieldKind::Relation(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.relation_target().is_some()
    }

    /// Name under which the value is stored: `<name>_id` for relations.
    pub fn attribute_name(&self) -> String {
        if self.is_relation() && !self.name.ends_with("_id") {
            format!("{}_id", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn token_key(&self) -> String {
        format!("{}_fk", self.name)
    }

    /// Every key under which a payload may carry this field.
    pub fn accepted_keys(&self) -> Vec<String> {
        let mut keys = vec![self.name.clone()];
        if self.is_relation() {
            keys.push(self.attribute_name());
            keys.push(self.token_key());
            keys.push(format!("{}_path_fk", self.name));
        }
        keys.dedup();
        keys
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Non-nullable, no default, not auto-populated and not the primary key.
    pub fn is_required(&self) -> bool {
        !self.nullable && !self.has_default() && !self.auto_timestamp && !self.primary_key
    }

    /// Excluded from content fingerprints.
    pub fn is_volatile(&self) -> bool {
        self.auto_timestamp || self.primary_key || AUDIT_FIELDS.contains(&self.name.as_str())
    }

    pub fn decimal_scale(&self) -> Option<u32> {
        self.datatype.decimal_spec().map(|spec| spec.scale)
    }
}

/// How a payload key maps onto a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyForm {
    Plain,
    Attribute,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySchema {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl EntitySchema {
    pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.primary_key)
    }

    pub fn primary_key_name(&self) -> &str {
        self.primary_key().map(|f| f.name.as_str()).unwrap_or("id")
    }

    /// Resolves any accepted spelling of a field to its descriptor.
    pub fn resolve_key(&self, key: &str) -> Option<(&FieldDescriptor, KeyForm)> {
        if let Some(field) = self.field(key) {
            return Some((field, KeyForm::Plain));
        }
        if let Some(base) = key.strip_suffix("_fk") {
            let base = base.strip_suffix("_path").filter(|b| self.field(b).is_some()).unwrap_or(base);
            return self
                .field(base)
                .filter(|f| f.is_relation())
                .map(|f| (f, KeyForm::Token));
        }
        self.fields
            .iter()
            .find(|f| f.is_relation() && f.attribute_name() == key)
            .map(|f| (f, KeyForm::Attribute))
    }

    pub fn is_known_key(&self, key: &str) -> bool {
        self.resolve_key(key).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_required())
    }

    pub fn relations(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_relation())
    }

    /// Stored column names, relations in attribute form.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(FieldDescriptor::attribute_name).collect()
    }
}

/// Read access to entity schemas, consumed by the executor and fingerprinting.
pub trait SchemaProvider {
    fn entity(&self, name: &str) -> Option<&EntitySchema>;

    fn entity_names(&self) -> Vec<String>;

    /// Dependency priority: entities earlier in the list are processed first.
    fn priority(&self) -> &[String];

    /// Orders `entities` by priority; unlisted entities follow in input order.
    fn processing_order(&self, entities: &[String]) -> Vec<String> {
        let priority = self.priority();
        let mut ordered = entities.to_vec();
        ordered.dedup();
        ordered.sort_by_key(|name| {
            priority
                .iter()
                .position(|p| p.eq_ignore_ascii_case(name))
                .unwrap_or(usize::MAX)
        });
        let mut seen = Vec::with_capacity(ordered.len());
        for name in ordered {
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaRegistry {
    #[serde(default)]
    pub entities: Vec<EntitySchema>,
    #[serde(default)]
    pub priority: Vec<String>,
}

impl SchemaRegistry {
    pub fn new(entities: Vec<EntitySchema>, priority: Vec<String>) -> Result<Self> {
        let registry = Self { entities, priority };
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let registry: SchemaRegistry =
            serde_yaml::from_reader(BufReader::new(file)).context("Parsing schema YAML")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeMap::new();
        for entity in &self.entities {
            if names.insert(entity.name.as_str(), ()).is_some() {
                bail!("Entity '{}' is declared more than once", entity.name);
            }
        }
        for entity in &self.entities {
            let mut fields = BTreeMap::new();
            for field in &entity.fields {
                if fields.insert(field.name.as_str(), ()).is_some() {
                    bail!("Entity '{}' declares field '{}' twice", entity.name, field.name);
                }
                if let Some(target) = field.relation_target()
                    && !names.contains_key(target)
                {
                    bail!(
                        "Field '{}.{}' references unknown entity '{target}'",
                        entity.name,
                        field.name
                    );
                }
                if let Some(spec) = field.datatype.decimal_spec() {
                    spec.ensure_valid()
                        .with_context(|| format!("Field '{}.{}'", entity.name, field.name))?;
                }
            }
            ensure!(
                entity.fields.iter().filter(|f| f.primary_key).count() <= 1,
                "Entity '{}' declares more than one primary key",
                entity.name
            );
        }
        for name in &self.priority {
            if !names.contains_key(name.as_str()) {
                log::warn!("Priority list names unknown entity '{name}'");
            }
        }
        Ok(())
    }
}

impl SchemaProvider for SchemaRegistry {
    fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .or_else(|| self.entities.iter().find(|e| e.name.eq_ignore_ascii_case(name)))
    }

    fn entity_names(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.name.clone()).collect()
    }

    fn priority(&self) -> &[String] {
        &self.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> SchemaRegistry {
        let account = EntitySchema::new(
            "account",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("name", FieldKind::String),
                FieldDescriptor::new("parent", FieldKind::Relation("account".into())).nullable(),
            ],
        );
        let entry = EntitySchema::new(
            "entry",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("account", FieldKind::Relation("account".into())),
                FieldDescriptor::new("amount", FieldKind::Decimal(DecimalSpec::new(12, 2).unwrap())),
                FieldDescriptor::new("memo", FieldKind::String).with_default(""),
                FieldDescriptor::new("created_at", FieldKind::DateTime).auto_timestamp(),
            ],
        );
        SchemaRegistry::new(vec![entry, account], vec!["account".into()]).unwrap()
    }

    #[test]
    fn datatype_tokens_parse() {
        assert_eq!(
            FieldKind::from_str("decimal(precision=20, scale=6)").unwrap(),
            FieldKind::Decimal(DecimalSpec { precision: 20, scale: 6 })
        );
        assert_eq!(
            FieldKind::from_str("relation(account)").unwrap(),
            FieldKind::Relation("account".into())
        );
        let err = FieldKind::from_str("decimal(10)").unwrap_err();
        assert!(err.to_string().contains("requires a scale value"));
        assert!(FieldKind::from_str("geography").is_err());
    }

    #[test]
    fn structured_datatypes_deserialize() {
        let yaml = r#"
name: amount
datatype:
  decimal: { precision: 10, scale: 2 }
"#;
        let field: FieldDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(field.decimal_scale(), Some(2));
        assert!(field.is_required());
    }

    #[test]
    fn relation_keys_resolve_in_every_spelling() {
        let registry = ledger();
        let entry = registry.entity("entry").unwrap();
        for (key, form) in [
            ("account", KeyForm::Plain),
            ("account_id", KeyForm::Attribute),
            ("account_fk", KeyForm::Token),
            ("account_path_fk", KeyForm::Token),
        ] {
            let (field, resolved) = entry.resolve_key(key).unwrap();
            assert_eq!(field.name, "account");
            assert_eq!(resolved, form, "key {key}");
        }
        assert!(entry.resolve_key("memo_fk").is_none());
        assert!(!entry.is_known_key("colour"));
    }

    #[test]
    fn required_fields_skip_defaults_timestamps_and_keys() {
        let registry = ledger();
        let required = registry
            .entity("entry")
            .unwrap()
            .required_fields()
            .map(|f| f.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(required, vec!["account", "amount"]);
    }

    #[test]
    fn processing_order_follows_priority_then_input_order() {
        let registry = ledger();
        let order = registry.processing_order(&[
            "vendor".to_string(),
            "entry".to_string(),
            "account".to_string(),
        ]);
        assert_eq!(order, vec!["account", "vendor", "entry"]);
    }

    #[test]
    fn unknown_relation_target_is_rejected() {
        let broken = EntitySchema::new(
            "entry",
            vec![FieldDescriptor::new("account", FieldKind::Relation("ledger".into()))],
        );
        assert!(SchemaRegistry::new(vec![broken], Vec::new()).is_err());
    }
}
