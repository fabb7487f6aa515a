//! Content fingerprints of an import batch and advisory duplicate detection.
//!
//! A row hash covers only identity-bearing fields: volatile columns
//! (auto timestamps, audit columns, the primary key) are excluded, decimals are
//! quantized to the field scale, dates are stringified and relations reduce to
//! an integer id or null. The table hash combines the sorted column list with
//! the sorted unique row hashes, so row order and key order never matter.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    data::{Fields, Row, Value, coerce_date, coerce_datetime, parse_bool, quantize},
    schema::{EntitySchema, FieldDescriptor, FieldKind},
    transform::string_ops::collapse_whitespace,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFingerprint {
    pub row_count: usize,
    pub column_names: Vec<String>,
    /// Sorted and de-duplicated.
    pub row_hashes: Vec<String>,
    pub table_hash: String,
}

/// The uploaded file a batch came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSnapshot {
    pub id: String,
    pub company: String,
    pub entity: String,
    pub row_count: usize,
    pub column_names: Vec<String>,
    /// Leading sample of the sorted row hashes.
    pub row_hashes: Vec<String>,
    pub table_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<SourceFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_to_previous: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ImportSnapshot {
    pub fn from_fingerprint(
        company: &str,
        entity: &str,
        fingerprint: &TableFingerprint,
        source_file: Option<SourceFile>,
        sample_limit: usize,
        similarity_to_previous: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            company: company.to_string(),
            entity: entity.to_string(),
            row_count: fingerprint.row_count,
            column_names: fingerprint.column_names.clone(),
            row_hashes: fingerprint.row_hashes.iter().take(sample_limit).cloned().collect(),
            table_hash: fingerprint.table_hash.clone(),
            source_file,
            similarity_to_previous,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of committed batches.
pub trait SnapshotStore {
    fn append(&mut self, snapshot: ImportSnapshot) -> Result<()>;
    /// Most recent first.
    fn recent(&self, company: &str, entity: &str, limit: usize) -> Vec<ImportSnapshot>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Vec<ImportSnapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn append(&mut self, snapshot: ImportSnapshot) -> Result<()> {
        self.snapshots.push(snapshot);
        Ok(())
    }

    fn recent(&self, company: &str, entity: &str, limit: usize) -> Vec<ImportSnapshot> {
        self.snapshots
            .iter()
            .rev()
            .filter(|s| s.company == company && s.entity == entity)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Snapshot history kept as JSON lines, one snapshot per line.
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
    snapshots: Vec<ImportSnapshot>,
}

impl FileSnapshotStore {
    /// Opens the history at `path`; a missing file is an empty history.
    pub fn open(path: &Path) -> Result<Self> {
        let mut snapshots = Vec::new();
        if path.exists() {
            let file = File::open(path).with_context(|| format!("Opening snapshot history {path:?}"))?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.with_context(|| format!("Reading snapshot history {path:?}"))?;
                if line.trim().is_empty() {
                    continue;
                }
                let snapshot = serde_json::from_str(&line)
                    .with_context(|| format!("Parsing snapshot on line {} of {path:?}", idx + 1))?;
                snapshots.push(snapshot);
            }
        }
        debug!("Loaded {} snapshot(s) from {path:?}", snapshots.len());
        Ok(Self {
            path: path.to_path_buf(),
            snapshots,
        })
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn append(&mut self, snapshot: ImportSnapshot) -> Result<()> {
        let line = serde_json::to_string(&snapshot).context("Serializing snapshot")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Opening snapshot history {:?}", self.path))?;
        writeln!(file, "{line}").with_context(|| format!("Appending to {:?}", self.path))?;
        self.snapshots.push(snapshot);
        Ok(())
    }

    fn recent(&self, company: &str, entity: &str, limit: usize) -> Vec<ImportSnapshot> {
        self.snapshots
            .iter()
            .rev()
            .filter(|s| s.company == company && s.entity == entity)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Advisory duplicate information; never blocks an import.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupReport {
    pub exact_table_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closest_snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    pub compared: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Canonical JSON object for one row, keyed by stored column name.
pub fn canonical_row(schema: &EntitySchema, fields: &Fields) -> BTreeMap<String, JsonValue> {
    let mut canonical = BTreeMap::new();
    for (key, value) in fields {
        let Some((field, _)) = schema.resolve_key(key) else {
            continue;
        };
        if field.is_volatile() {
            continue;
        }
        let column = field.attribute_name();
        let normalized = canonical_value(field, value);
        // A resolved id wins over a leftover token spelling of the same relation.
        if normalized.is_null() && canonical.contains_key(&column) {
            continue;
        }
        canonical.insert(column, normalized);
    }
    canonical
}

fn canonical_value(field: &FieldDescriptor, value: &Value) -> JsonValue {
    if value.is_blank() {
        return JsonValue::Null;
    }
    match &field.datatype {
        FieldKind::Relation(_) => value.as_i64().map(JsonValue::from).unwrap_or(JsonValue::Null),
        FieldKind::Decimal(spec) => value
            .as_decimal()
            .map(|d| JsonValue::String(quantize(d, spec.scale).to_string()))
            .unwrap_or_else(|| text(value)),
        FieldKind::Date => coerce_date(value)
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or_else(|| text(value)),
        FieldKind::DateTime => coerce_datetime(value)
            .map(|dt| JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()))
            .unwrap_or_else(|| text(value)),
        FieldKind::Integer => value.as_i64().map(JsonValue::from).unwrap_or_else(|| text(value)),
        FieldKind::Boolean => parse_bool(value).map(JsonValue::Bool).unwrap_or_else(|| text(value)),
        FieldKind::String => text(value),
    }
}

fn text(value: &Value) -> JsonValue {
    JsonValue::String(collapse_whitespace(&value.as_display()).into_owned())
}

pub fn row_hash(schema: &EntitySchema, fields: &Fields) -> String {
    let canonical = canonical_row(schema, fields);
    let encoded = serde_json::to_string(&canonical).unwrap_or_default();
    sha256_hex(encoded.as_bytes())
}

pub fn fingerprint(schema: &EntitySchema, rows: &[Row]) -> TableFingerprint {
    let mut columns = BTreeSet::new();
    let mut hashes = BTreeSet::new();
    for row in rows {
        let canonical = canonical_row(schema, &row.fields);
        columns.extend(canonical.keys().cloned());
        let encoded = serde_json::to_string(&canonical).unwrap_or_default();
        hashes.insert(sha256_hex(encoded.as_bytes()));
    }
    let column_names = columns.into_iter().collect::<Vec<_>>();
    let row_hashes = hashes.into_iter().collect::<Vec<_>>();

    let mut hasher = Sha256::new();
    hasher.update(column_names.join(",").as_bytes());
    hasher.update(b"\n");
    hasher.update(row_hashes.join("\n").as_bytes());
    let table_hash = format!("{:x}", hasher.finalize());

    TableFingerprint {
        row_count: rows.len(),
        column_names,
        row_hashes,
        table_hash,
    }
}

/// Jaccard similarity of two hash sets; two empty sets are identical.
pub fn jaccard(left: &[String], right: &[String]) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let left = left.iter().collect::<BTreeSet<_>>();
    let right = right.iter().collect::<BTreeSet<_>>();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Compares a batch against prior snapshots, most recent first. Snapshots keep
/// only the leading `sample_limit` sorted row hashes, so the batch is sampled
/// the same way before measuring similarity.
pub fn compare(fingerprint: &TableFingerprint, history: &[ImportSnapshot], sample_limit: usize) -> DedupReport {
    let mut report = DedupReport {
        compared: history.len(),
        ..DedupReport::default()
    };
    if let Some(exact) = history
        .iter()
        .find(|s| s.table_hash == fingerprint.table_hash && s.row_count == fingerprint.row_count)
    {
        report.exact_table_duplicate = true;
        report.duplicate_of = Some(exact.id.clone());
    }
    let sample = &fingerprint.row_hashes[..fingerprint.row_hashes.len().min(sample_limit)];
    let closest = history
        .iter()
        .map(|s| (s, jaccard(sample, &s.row_hashes)))
        .max_by(|(_, a), (_, b)| a.total_cmp(b));
    if let Some((snapshot, similarity)) = closest {
        debug!(
            "Closest prior snapshot {} for {} has similarity {similarity:.3}",
            snapshot.id, snapshot.entity
        );
        report.closest_snapshot = Some(snapshot.id.clone());
        report.similarity = Some(similarity);
    }
    report
}

/// Hashes of the most frequent duplicate rows within one batch.
pub fn repeated_rows(schema: &EntitySchema, rows: &[Row]) -> Vec<(String, usize)> {
    rows.iter()
        .map(|row| row_hash(schema, &row.fields))
        .counts()
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::schema::DecimalSpec;

    fn entry_schema() -> EntitySchema {
        EntitySchema::new(
            "entry",
            vec![
                FieldDescriptor::new("id", FieldKind::Integer).primary_key(),
                FieldDescriptor::new("account", FieldKind::Relation("account".into())),
                FieldDescriptor::new("amount", FieldKind::Decimal(DecimalSpec::new(12, 2).unwrap())),
                FieldDescriptor::new("memo", FieldKind::String).nullable(),
                FieldDescriptor::new("posted_on", FieldKind::Date),
                FieldDescriptor::new("created_at", FieldKind::DateTime).auto_timestamp(),
            ],
        )
    }

    fn entry(id: i64, account: i64, amount: &str, memo: &str) -> Row {
        Row::new(format!("e{id}"), "Entries", id as usize)
            .with_field("id", id)
            .with_field("account_id", account)
            .with_field("amount", amount)
            .with_field("memo", memo)
            .with_field("posted_on", "2024-03-01")
    }

    #[test]
    fn canonical_row_normalizes_identity_fields() {
        let schema = entry_schema();
        let row = entry(7, 42, "10.5", "  coffee   beans ")
            .with_field("account_fk", "t1")
            .with_field("created_at", "2024-03-01 10:00:00")
            .with_field("unknown", "x");
        let canonical = canonical_row(&schema, &row.fields);
        assert_eq!(
            serde_json::to_string(&canonical).unwrap(),
            r#"{"account_id":42,"amount":"10.50","memo":"coffee beans","posted_on":"2024-03-01"}"#
        );
    }

    #[test]
    fn volatile_fields_and_order_do_not_change_table_hash() {
        let schema = entry_schema();
        let first = vec![entry(1, 42, "10", "a"), entry(2, 43, "5.00", "b")];
        let second = vec![
            entry(9, 43, "5", "b").with_field("created_at", "2025-01-01 00:00:00"),
            entry(8, 42, "10.00", "a"),
        ];
        assert_eq!(fingerprint(&schema, &first).table_hash, fingerprint(&schema, &second).table_hash);

        let changed = vec![entry(1, 42, "10", "a"), entry(2, 43, "5.01", "b")];
        assert_ne!(fingerprint(&schema, &first).table_hash, fingerprint(&schema, &changed).table_hash);
    }

    #[test]
    fn jaccard_edge_cases() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "z".to_string()];
        assert_eq!(jaccard(&[], &[]), 1.0);
        assert_eq!(jaccard(&a, &[]), 0.0);
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn compare_reports_exact_and_closest_snapshots() {
        let schema = entry_schema();
        let rows = vec![entry(1, 42, "10", "a"), entry(2, 43, "5", "b")];
        let fp = fingerprint(&schema, &rows);
        let mut store = MemorySnapshotStore::new();
        store
            .append(ImportSnapshot::from_fingerprint("acme", "entry", &fp, None, 1000, None))
            .unwrap();
        let partial = fingerprint(&schema, &rows[..1]);
        store
            .append(ImportSnapshot::from_fingerprint("acme", "entry", &partial, None, 1000, None))
            .unwrap();

        let history = store.recent("acme", "entry", 5);
        assert_eq!(history.len(), 2);
        let report = compare(&fp, &history, 1000);
        assert!(report.exact_table_duplicate);
        assert_eq!(report.duplicate_of.as_ref(), Some(&history[1].id));
        assert_eq!(report.similarity, Some(1.0));
        assert!(store.recent("other", "entry", 5).is_empty());
    }

    #[test]
    fn similarity_uses_the_same_sample_as_stored_snapshots() {
        let schema = entry_schema();
        let rows = (1..=30)
            .map(|id| entry(id, 42, "10", &format!("invoice {id}")))
            .collect::<Vec<_>>();
        let fp = fingerprint(&schema, &rows);
        let snapshot = ImportSnapshot::from_fingerprint("acme", "entry", &fp, None, 10, None);
        assert_eq!(snapshot.row_hashes.len(), 10);

        let report = compare(&fp, &[snapshot], 10);
        assert!(report.exact_table_duplicate);
        assert_eq!(report.similarity, Some(1.0));
    }

    #[test]
    fn repeated_rows_are_counted() {
        let schema = entry_schema();
        let rows = vec![entry(1, 42, "10", "a"), entry(2, 42, "10.00", "a"), entry(3, 1, "1", "z")];
        let repeated = repeated_rows(&schema, &rows);
        assert_eq!(repeated.len(), 1);
        assert_eq!(repeated[0].1, 2);
        assert_eq!(
            canonical_value(&schema.fields[2], &Value::Decimal(Decimal::new(1005, 3))),
            JsonValue::String("1.01".into())
        );
    }

    #[test]
    fn file_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");
        let schema = entry_schema();
        let fp = fingerprint(&schema, &[entry(1, 42, "10", "a")]);
        let source = SourceFile {
            name: "entries.csv".into(),
            sha256: sha256_hex(b"entries"),
        };

        let mut store = FileSnapshotStore::open(&path).unwrap();
        assert!(store.is_empty());
        store
            .append(ImportSnapshot::from_fingerprint("acme", "entry", &fp, Some(source.clone()), 10, None))
            .unwrap();

        let reopened = FileSnapshotStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        let history = reopened.recent("acme", "entry", 5);
        assert_eq!(history[0].table_hash, fp.table_hash);
        assert_eq!(history[0].source_file, Some(source));
        assert!(compare(&fp, &history, 10).exact_table_duplicate);
    }
}
