//! Structured filter conditions gating substitution rules.
//!
//! Conditions are written in rule YAML as nested maps:
//!
//! ```yaml
//! filter:
//!   all:
//!     - { field: currency, op: eq, value: USD }
//!     - not: { field: memo, op: icontains, value: transfer }
//! ```

use std::sync::OnceLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Fields, Value},
    transform::string_ops::fold_caseless,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    #[default]
    Eq,
    #[serde(alias = "ne")]
    Neq,
    In,
    #[serde(alias = "not_in")]
    Nin,
    Contains,
    Icontains,
    Iexact,
    Regex,
    Lt,
    #[serde(alias = "le")]
    Lte,
    Gt,
    #[serde(alias = "ge")]
    Gte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    #[serde(default)]
    pub op: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(skip)]
    pattern: CompiledPattern,
}

/// Regex for a `regex` comparison, compiled on first use. `None` marks an invalid pattern.
#[derive(Debug, Clone, Default)]
struct CompiledPattern(OnceLock<Option<Regex>>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Comparison {
    fn regex(&self) -> Option<&Regex> {
        self.pattern
            .0
            .get_or_init(|| Regex::new(&self.value.as_display()).ok())
            .as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Not { not: Box<Condition> },
    Compare(Comparison),
}

impl Condition {
    pub fn compare(field: &str, op: ComparisonOperator, value: impl Into<Value>) -> Self {
        Condition::Compare(Comparison {
            field: field.to_string(),
            op,
            value: value.into(),
            pattern: CompiledPattern::default(),
        })
    }

    /// Rejects conditions that can never be evaluated, such as invalid regex patterns.
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::All { all: children } | Condition::Any { any: children } => {
                children.iter().try_for_each(Condition::validate)
            }
            Condition::Not { not } => not.validate(),
            Condition::Compare(cmp) => {
                if cmp.field.trim().is_empty() {
                    return Err(anyhow!("Filter comparison is missing a field name"));
                }
                if cmp.op == ComparisonOperator::Regex && cmp.regex().is_none() {
                    let pattern = cmp.value.as_display();
                    let err = Regex::new(&pattern).err().map(|e| e.to_string()).unwrap_or_default();
                    return Err(anyhow!("Invalid regex '{pattern}' in filter on '{}': {err}", cmp.field));
                }
                Ok(())
            }
        }
    }

    pub fn evaluate(&self, fields: &Fields) -> bool {
        match self {
            // An empty `all` passes and an empty `any` fails, as with iterators.
            Condition::All { all } => all.iter().all(|c| c.evaluate(fields)),
            Condition::Any { any } => any.iter().any(|c| c.evaluate(fields)),
            Condition::Not { not } => !not.evaluate(fields),
            Condition::Compare(cmp) => {
                let candidate = fields.get(&cmp.field).unwrap_or(&Value::Null);
                evaluate_comparison(cmp, candidate)
            }
        }
    }
}

fn evaluate_comparison(cmp: &Comparison, candidate: &Value) -> bool {
    use ComparisonOperator as Op;
    let target = &cmp.value;
    match cmp.op {
        Op::Eq => values_equal(candidate, target),
        Op::Neq => !values_equal(candidate, target),
        Op::In => membership(candidate, target),
        Op::Nin => !membership(candidate, target),
        Op::Contains => match candidate {
            Value::Null => false,
            Value::List(items) => items.iter().any(|item| values_equal(item, target)),
            other => other.as_display().contains(&target.as_display()),
        },
        Op::Icontains => {
            !candidate.is_null() && fold_caseless(&candidate.as_display()).contains(&fold_caseless(&target.as_display()))
        }
        Op::Iexact => fold_caseless(&candidate.as_display()) == fold_caseless(&target.as_display()),
        Op::Regex => !candidate.is_null() && cmp.regex().is_some_and(|re| re.is_match(&candidate.as_display())),
        op @ (Op::Lt | Op::Lte | Op::Gt | Op::Gte) => {
            let Some(ordering) = ordered(candidate, target) else {
                return false;
            };
            match op {
                Op::Lt => ordering.is_lt(),
                Op::Lte => ordering.is_le(),
                Op::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
    }
}

/// Spreadsheet cells often carry numbers as text, so `"5"` equals `5` here.
fn values_equal(left: &Value, right: &Value) -> bool {
    if left.loose_eq(right) {
        return true;
    }
    if left.is_null() || right.is_null() {
        return left.is_blank() && right.is_blank();
    }
    if left.is_numeric() || right.is_numeric() {
        if let (Some(a), Some(b)) = (left.as_decimal(), right.as_decimal()) {
            return a == b;
        }
    }
    left.as_display() == right.as_display()
}

/// A scalar target makes `in` behave like equality.
fn membership(candidate: &Value, target: &Value) -> bool {
    match target {
        Value::List(items) => items.iter().any(|item| values_equal(candidate, item)),
        Value::Map(map) => map.contains_key(&candidate.as_display()),
        scalar => values_equal(candidate, scalar),
    }
}

fn ordered(candidate: &Value, target: &Value) -> Option<std::cmp::Ordering> {
    if candidate.is_null() || target.is_null() {
        return None;
    }
    match (candidate.as_decimal(), target.as_decimal()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => candidate.compare(target),
    }
}
