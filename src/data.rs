//! Cell values, rows, and the coercion helpers shared by every pipeline stage.
//!
//! [`Value`] is the single dynamic value type flowing through the importer:
//! raw spreadsheet cells, transformed fields, sandbox expression results and
//! persisted record payloads all use it. Lists and maps only appear inside
//! expressions and integration-rule payloads; persisted fields are scalar.

use std::{cmp::Ordering, collections::BTreeMap, fmt, str::FromStr};

use anyhow::{Result, anyhow};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy, prelude::FromPrimitive, prelude::ToPrimitive};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Field name to value mapping used for rows and record payloads.
pub type Fields = BTreeMap<String, Value>;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

// Excel's 1900 date system, including the phantom 1900-02-29.
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
const EXCEL_SERIAL_MIN: f64 = 1.0;
const EXCEL_SERIAL_MAX: f64 = 2_958_465.0;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Builds a value from a raw text cell; blank cells become [`Value::Null`].
    pub fn from_cell(raw: &str) -> Self {
        if raw.trim().is_empty() {
            Value::Null
        } else {
            Value::String(raw.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, whitespace-only strings and NaN floats all count as blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan")
            }
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Value::Decimal(d) => d.to_string(),
            Value::String(s) => s.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            Value::List(items) => items
                .iter()
                .map(Value::as_display)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(map) => serde_json::to_string(&map_to_json(map)).unwrap_or_default(),
        }
    }

    /// Integer view of the value, accepting integral floats, decimals and numeric strings.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed.parse::<i64>().ok().or_else(|| {
                    parse_decimal_literal(trimmed)
                        .ok()
                        .filter(|d| d.fract().is_zero())
                        .and_then(|d| d.to_i64())
                })
            }
            _ => None,
        }
    }

    /// Numeric coercion used by comparisons and arithmetic.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Integer(i) => Some(Decimal::from(*i)),
            Value::Float(f) => Decimal::from_f64(*f),
            Value::Decimal(d) => Some(*d),
            Value::Boolean(b) => Some(Decimal::from(*b as i64)),
            Value::String(s) => parse_decimal_literal(s).ok(),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_) | Value::Decimal(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Decimal(d) => !d.is_zero(),
            Value::String(s) => !s.is_empty(),
            Value::Date(_) | Value::DateTime(_) => true,
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Equality with numeric promotion (`1 == 1.0 == Decimal(1)`).
    pub fn loose_eq(&self, other: &Value) -> bool {
        if self.is_numeric() && other.is_numeric() {
            return self.as_decimal() == other.as_decimal();
        }
        match (self, other) {
            (Value::Date(a), Value::DateTime(b)) | (Value::DateTime(b), Value::Date(a)) => {
                b.date() == *a && b.time() == chrono::NaiveTime::MIN
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            _ => self == other,
        }
    }

    /// Ordering between comparable values; `None` for heterogeneous pairs.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if self.is_numeric() && other.is_numeric() {
            return self.as_decimal()?.partial_cmp(&other.as_decimal()?);
        }
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::DateTime(b)) => Some(a.and_time(chrono::NaiveTime::MIN).cmp(b)),
            (Value::DateTime(a), Value::Date(b)) => Some(a.cmp(&b.and_time(chrono::NaiveTime::MIN))),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(_) | Value::DateTime(_) => serde_json::Value::String(self.as_display()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => map_to_json(map),
        }
    }
}

fn map_to_json(map: &BTreeMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    // Keep literal precision for configured amounts such as 10.15.
                    Decimal::from_str(&n.to_string())
                        .map(Value::Decimal)
                        .unwrap_or_else(|_| Value::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

/// One source row on its way through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    /// Symbolic token other rows use to reference this one before it has a key.
    pub row_id: String,
    pub sheet: String,
    /// 1-based row number in the source sheet.
    pub row_number: usize,
    pub fields: Fields,
    /// Trigger-only values that never map onto the persisted entity.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: Fields,
}

impl Row {
    pub fn new(row_id: impl Into<String>, sheet: impl Into<String>, row_number: usize) -> Self {
        Self {
            row_id: row_id.into(),
            sheet: sheet.into(),
            row_number,
            fields: Fields::new(),
            extras: Fields::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

pub fn synthetic_row_token(sheet: &str, row_number: usize) -> String {
    format!("{sheet}:{row_number}")
}

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(parsed);
        }
    }
    if let Ok(parsed) = parse_naive_datetime(trimmed) {
        return Ok(parsed.date());
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as datetime"))
}

/// Converts an Excel 1900-system serial number into a calendar date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !(EXCEL_SERIAL_MIN..=EXCEL_SERIAL_MAX).contains(&serial) {
        return None;
    }
    let (year, month, day) = EXCEL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(year, month, day)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}

/// Normalizes date-like values (Excel serials, ISO strings, datetimes) to a calendar date.
pub fn coerce_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::DateTime(dt) => Some(dt.date()),
        Value::Integer(i) => excel_serial_to_date(*i as f64),
        Value::Float(f) => excel_serial_to_date(*f),
        Value::Decimal(d) => d.to_f64().and_then(excel_serial_to_date),
        Value::String(s) => {
            let trimmed = s.trim();
            parse_naive_date(trimmed).ok().or_else(|| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|_| !trimmed.contains(['-', '/']))
                    .and_then(excel_serial_to_date)
            })
        }
        _ => None,
    }
}

pub fn coerce_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::String(s) => parse_naive_datetime(s)
            .ok()
            .or_else(|| coerce_date(value).map(|d| d.and_time(chrono::NaiveTime::MIN))),
        other => coerce_date(other).map(|d| d.and_time(chrono::NaiveTime::MIN)),
    }
}

/// Interprets the usual spreadsheet spellings of true/false.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Boolean(b) => Some(*b),
        Value::Integer(i) => match i {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        Value::Float(_) | Value::Decimal(_) => value.as_i64().and_then(|i| parse_bool(&Value::Integer(i))),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "on" | "x" | "si" | "sí" => Some(true),
            "false" | "f" | "no" | "n" | "0" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parses decimal text, tolerating thousands separators, currency symbols and
/// accounting-style negatives such as `(1,250.00)`.
pub fn parse_decimal_literal(value: &str) -> Result<Decimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Empty decimal literal"));
    }
    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner.trim()),
        None => (false, trimmed),
    };
    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' ' | '$' | '€' | '£'))
        .collect();
    let parsed = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|err| anyhow!("Failed to parse '{value}' as decimal: {err}"))?;
    Ok(if negative { -parsed } else { parsed })
}

/// Quantizes to `scale` places, rounding half away from zero (financial half-up).
pub fn quantize(value: Decimal, scale: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(scale);
    rounded
}

pub fn normalize_column_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_column_name_replaces_non_alphanumeric() {
        assert_eq!(normalize_column_name("Order ID"), "order_id");
        assert_eq!(normalize_column_name("$Percent%"), "_percent_");
    }

    #[test]
    fn parse_naive_date_supports_multiple_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert_eq!(parse_naive_date("2024-05-06").unwrap(), expected);
        assert_eq!(parse_naive_date("06/05/2024").unwrap(), expected);
        assert_eq!(parse_naive_date("2024/05/06").unwrap(), expected);
        assert_eq!(parse_naive_date("2024-05-06T10:11:12").unwrap(), expected);
    }

    #[test]
    fn excel_serials_become_calendar_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(coerce_date(&Value::Integer(45306)), Some(expected));
        assert_eq!(coerce_date(&Value::Float(45306.75)), Some(expected));
        assert_eq!(coerce_date(&Value::from("45306")), Some(expected));
        assert_eq!(coerce_date(&Value::Integer(0)), None);
    }

    #[test]
    fn boolean_spellings_are_recognized() {
        assert_eq!(parse_bool(&Value::from("Yes")), Some(true));
        assert_eq!(parse_bool(&Value::from(" off ")), Some(false));
        assert_eq!(parse_bool(&Value::Integer(1)), Some(true));
        assert_eq!(parse_bool(&Value::from("maybe")), None);
    }

    #[test]
    fn decimal_literals_accept_accounting_formats() {
        assert_eq!(parse_decimal_literal("1,250.50").unwrap(), Decimal::new(125050, 2));
        assert_eq!(parse_decimal_literal("(10.00)").unwrap(), Decimal::new(-1000, 2));
        assert_eq!(parse_decimal_literal("$ 3").unwrap(), Decimal::from(3));
        assert!(parse_decimal_literal("abc").is_err());
    }

    #[test]
    fn quantize_rounds_half_up() {
        assert_eq!(quantize(Decimal::new(1005, 3), 2).to_string(), "1.01");
        assert_eq!(quantize(Decimal::new(-1005, 3), 2).to_string(), "-1.01");
        assert_eq!(quantize(Decimal::from(7), 2).to_string(), "7.00");
    }

    #[test]
    fn loose_equality_promotes_numbers() {
        assert!(Value::Integer(2).loose_eq(&Value::Decimal(Decimal::new(200, 2))));
        assert!(Value::Float(1.5).loose_eq(&Value::Decimal(Decimal::new(15, 1))));
        assert!(!Value::from("2").loose_eq(&Value::Integer(2)));
    }

    #[test]
    fn json_numbers_keep_decimal_precision() {
        let value = Value::from(serde_json::json!(10.15));
        assert_eq!(value, Value::Decimal(Decimal::new(1015, 2)));
        assert_eq!(Value::from(serde_json::json!(3)), Value::Integer(3));
    }

    #[test]
    fn blank_detection_covers_nan_and_whitespace() {
        assert!(Value::Null.is_blank());
        assert!(Value::from("  ").is_blank());
        assert!(Value::from("NaN").is_blank());
        assert!(Value::Float(f64::NAN).is_blank());
        assert!(!Value::Integer(0).is_blank());
    }
}
