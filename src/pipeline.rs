//! One import job end to end: sheets are matched to transformation rules,
//! transformed, substituted, grouped per entity and handed to the executor.
//! Sheet- and row-level problems are collected into the [`ImportReport`];
//! only unexpected failures surface as errors, which mark the job failed.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{ImportContext, ImportMode, Workspace},
    error::{Diagnostic, DiagnosticCode, ImportError},
    executor::{EntityBatch, ExecutionOutcome, ImportExecutor, RowResult, RowStatus},
    fingerprint::{DedupReport, SnapshotStore, SourceFile},
    job::{FollowOnRequest, JobLogEntry, JobSink, JobStatus},
    rules::RuleStore,
    schema::SchemaProvider,
    store::EntityStore,
    substitution::{ProcessedSet, SubstitutionEngine},
    transform::{RawSheet, TransformStats, identity_rule, transform},
};

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRequest {
    pub sheets: Vec<RawSheet>,
    pub source_file: Option<SourceFile>,
}

impl ImportRequest {
    pub fn new(sheets: Vec<RawSheet>) -> Self {
        Self {
            sheets,
            source_file: None,
        }
    }

    pub fn with_source_file(mut self, source_file: SourceFile) -> Self {
        self.source_file = Some(source_file);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetStatus {
    Processed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetSummary {
    pub sheet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub status: SheetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<TransformStats>,
    pub substitutions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub sheets_found: usize,
    pub sheets_processed: usize,
    pub sheets_skipped: usize,
    pub sheets_failed: usize,
    pub rows_ok: usize,
    pub rows_failed: usize,
    pub rows_skipped: usize,
}

/// Transformed and substituted sheets, grouped per entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedImport {
    pub batches: Vec<EntityBatch>,
    pub sheets: Vec<SheetSummary>,
    pub counts: ImportCounts,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl PreparedImport {
    pub fn has_failed_sheets(&self) -> bool {
        self.counts.sheets_failed > 0
    }

    fn batch_mut(&mut self, entity: &str) -> &mut EntityBatch {
        let position = match self.batches.iter().position(|b| b.entity == entity) {
            Some(position) => position,
            None => {
                self.batches.push(EntityBatch::new(entity));
                self.batches.len() - 1
            }
        };
        &mut self.batches[position]
    }

    fn fail_sheet(&mut self, sheet: &RawSheet, entity: Option<String>, error: ImportError) {
        warn!("Sheet '{}' failed: {error}", sheet.name);
        self.counts.sheets_failed += 1;
        self.errors.push(error.to_diagnostic().sheet(&sheet.name));
        self.sheets.push(SheetSummary {
            sheet: sheet.name.clone(),
            entity,
            status: SheetStatus::Failed,
            stats: None,
            substitutions: 0,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelReport {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupReport>,
    pub rows: Vec<RowResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub committed: bool,
    pub mode: ImportMode,
    pub models: Vec<ModelReport>,
    pub sheets: Vec<SheetSummary>,
    pub counts: ImportCounts,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub follow_ons: Vec<FollowOnRequest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
}

impl ImportReport {
    pub fn rows(&self) -> impl Iterator<Item = &RowResult> {
        self.models.iter().flat_map(|m| m.rows.iter())
    }

    pub fn model(&self, name: &str) -> Option<&ModelReport> {
        self.models.iter().find(|m| m.model == name)
    }
}

/// Runs transformation and substitution for every sheet without touching a store.
pub fn prepare_sheets(ctx: &ImportContext, workspace: &Workspace, sheets: &[RawSheet]) -> PreparedImport {
    let mut prepared = PreparedImport {
        counts: ImportCounts {
            sheets_found: sheets.len(),
            ..ImportCounts::default()
        },
        ..PreparedImport::default()
    };

    let mut engine = match SubstitutionEngine::for_company(&workspace.rules, &ctx.company) {
        Ok(engine) => engine.with_cache(workspace.settings.substitution_cache),
        Err(err) => {
            warn!("Substitution rules for {} are invalid: {err:#}", ctx.company);
            for sheet in sheets {
                prepared.fail_sheet(
                    sheet,
                    None,
                    ImportError::Preparation {
                        sheet: sheet.name.clone(),
                        message: format!("substitution rules are invalid: {err:#}"),
                        suggestions: Default::default(),
                    },
                );
            }
            return prepared;
        }
    };
    debug!("Loaded {} substitution rule(s) for {}", engine.rule_count(), ctx.company);
    let mut processed = ProcessedSet::new();

    for sheet in sheets {
        let rule = match (
            workspace.rules.transformation_rule_for_sheet(&ctx.company, &sheet.name),
            &sheet.entity,
        ) {
            (Some(rule), _) => rule.clone(),
            (None, Some(entity)) => identity_rule(sheet, &ctx.company, entity),
            (None, None) => {
                debug!("No transformation rule or entity for sheet '{}'", sheet.name);
                prepared.counts.sheets_skipped += 1;
                prepared.warnings.push(
                    Diagnostic::new(
                        DiagnosticCode::SheetSkipped,
                        "no transformation rule matches this sheet and it names no entity",
                    )
                    .sheet(&sheet.name),
                );
                prepared.sheets.push(SheetSummary {
                    sheet: sheet.name.clone(),
                    entity: None,
                    status: SheetStatus::Skipped,
                    stats: None,
                    substitutions: 0,
                });
                continue;
            }
        };

        let Some(schema) = workspace.schema.entity(&rule.entity) else {
            let error = ImportError::Preparation {
                sheet: sheet.name.clone(),
                message: format!("unknown entity '{}'", rule.entity),
                suggestions: Default::default(),
            };
            prepared.fail_sheet(sheet, Some(rule.entity.clone()), error);
            continue;
        };

        let outcome = transform(sheet, &rule, Some(schema));
        prepared.warnings.extend(outcome.warnings);
        if !outcome.errors.is_empty() {
            warn!("Sheet '{}' failed preparation", sheet.name);
            prepared.counts.sheets_failed += 1;
            prepared.errors.extend(outcome.errors);
            prepared.sheets.push(SheetSummary {
                sheet: sheet.name.clone(),
                entity: Some(schema.name.clone()),
                status: SheetStatus::Failed,
                stats: Some(outcome.stats),
                substitutions: 0,
            });
            continue;
        }

        let (rows, changes) = engine.apply(
            ctx,
            &schema.name,
            Some(schema),
            &outcome.columns,
            outcome.rows,
            &mut processed,
        );
        info!(
            "Sheet '{}' -> {}: {} row(s), {} substitution(s)",
            sheet.name,
            schema.name,
            rows.len(),
            changes.len()
        );
        let stats = outcome.stats;
        prepared.counts.sheets_processed += 1;
        prepared.counts.rows_skipped += stats.filtered_rows + stats.dropped_blank_rows + stats.limited_rows;
        prepared.sheets.push(SheetSummary {
            sheet: sheet.name.clone(),
            entity: Some(schema.name.clone()),
            status: SheetStatus::Processed,
            stats: Some(stats),
            substitutions: changes.len(),
        });
        let batch = prepared.batch_mut(&schema.name);
        batch.rows.extend(rows);
        batch.substitutions.extend(changes);
        batch.triggers.insert(sheet.name.clone(), rule.triggers.clone());
    }
    if engine.cache_hits() > 0 {
        debug!("Substitution cache served {} lookup(s)", engine.cache_hits());
    }
    prepared
}

/// Runs one import job and records its lifecycle on the job sink.
pub fn run_import(
    ctx: &ImportContext,
    workspace: &Workspace,
    store: &mut dyn EntityStore,
    snapshots: &mut dyn SnapshotStore,
    jobs: &mut dyn JobSink,
    request: ImportRequest,
) -> Result<ImportReport> {
    if let Some(job) = &ctx.job_id {
        jobs.set_status(job, JobStatus::Running)
            .with_context(|| format!("Starting job {job}"))?;
        jobs.log(
            job,
            JobLogEntry::info(format!(
                "{} import of {} sheet(s) for {}",
                ctx.mode.as_str(),
                request.sheets.len(),
                ctx.company
            )),
        );
    }

    let result = execute_request(ctx, workspace, store, snapshots, jobs, request);
    let Some(job) = &ctx.job_id else {
        return result;
    };
    match &result {
        Ok(report) => {
            for diagnostic in &report.errors {
                jobs.log(job, JobLogEntry::error(diagnostic.clone()));
            }
            for diagnostic in &report.warnings {
                jobs.log(job, JobLogEntry::warning(diagnostic.clone()));
            }
            jobs.set_status(job, JobStatus::Succeeded)
                .with_context(|| format!("Finishing job {job}"))?;
        }
        Err(err) => {
            jobs.log(job, JobLogEntry::info(format!("import failed: {err:#}")));
            jobs.set_status(job, JobStatus::Failed)
                .with_context(|| format!("Failing job {job}"))?;
        }
    }
    result
}

fn execute_request(
    ctx: &ImportContext,
    workspace: &Workspace,
    store: &mut dyn EntityStore,
    snapshots: &mut dyn SnapshotStore,
    jobs: &mut dyn JobSink,
    request: ImportRequest,
) -> Result<ImportReport> {
    info!(
        "Starting {} for {} with {} sheet(s)",
        ctx.mode.as_str(),
        ctx.company,
        request.sheets.len()
    );
    let prepared = prepare_sheets(ctx, workspace, &request.sheets);
    let executor = ImportExecutor::new(ctx, &workspace.schema, &workspace.rules, &workspace.settings);
    let preparation_failed = prepared.has_failed_sheets();
    let PreparedImport {
        batches,
        sheets,
        mut counts,
        mut errors,
        mut warnings,
    } = prepared;
    let outcome = executor
        .execute(
            store,
            snapshots,
            jobs,
            batches,
            preparation_failed,
            request.source_file.as_ref(),
        )
        .context("Executing import batch")?;

    let ExecutionOutcome {
        committed,
        entities,
        errors: row_errors,
        warnings: row_warnings,
        follow_ons,
        snapshots: snapshot_ids,
    } = outcome;
    for row in entities.iter().flat_map(|e| &e.rows) {
        if row.status == RowStatus::Error {
            counts.rows_failed += 1;
        } else if row
            .warnings
            .iter()
            .any(|w| w.code == DiagnosticCode::NotExecuted)
        {
            counts.rows_skipped += 1;
        } else {
            counts.rows_ok += 1;
        }
    }
    errors.extend(row_errors);
    warnings.extend(row_warnings);
    info!(
        "Import {} for {}: {} ok, {} failed, {} skipped",
        if committed { "committed" } else { "not committed" },
        ctx.company,
        counts.rows_ok,
        counts.rows_failed,
        counts.rows_skipped
    );

    Ok(ImportReport {
        committed,
        mode: ctx.mode,
        models: entities
            .into_iter()
            .map(|entity| ModelReport {
                model: entity.entity,
                dedup: entity.dedup,
                rows: entity.rows,
            })
            .collect(),
        sheets,
        counts,
        errors,
        warnings,
        follow_ons,
        snapshots: snapshot_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fingerprint::MemorySnapshotStore, job::MemoryJobSink, store::MemoryStore};

    const WORKSPACE: &str = r#"
schema:
  priority: [account]
  entities:
    - name: account
      fields:
        - { name: id, datatype: integer, primary_key: true }
        - { name: code, datatype: string }
        - { name: name, datatype: string }
rules:
  transformations:
    - id: accounts
      company: acme
      entity: account
      sheet_name: Chart
      column_mappings:
        - { source: Code, target: code }
        - { source: Name, target: name }
"#;

    #[test]
    fn unmatched_sheets_are_skipped_and_broken_sheets_block_commit() {
        let workspace = Workspace::from_yaml_str(WORKSPACE).unwrap();
        let ctx = ImportContext::new("acme", "tester", ImportMode::Commit).with_job("job-7");
        let request = ImportRequest::new(vec![
            RawSheet::from_text("chart", &["Code", "Name"], &[&["1000", "Cash"]]),
            RawSheet::from_text("Notes", &["Text"], &[&["hello"]]),
            RawSheet::from_text("Other", &["Code"], &[&["1"]]).with_entity("ledger"),
        ]);
        let mut store = MemoryStore::new();
        let mut snapshots = MemorySnapshotStore::new();
        let mut jobs = MemoryJobSink::new();
        let report = run_import(&ctx, &workspace, &mut store, &mut snapshots, &mut jobs, request).unwrap();

        assert!(!report.committed);
        assert_eq!(report.counts.sheets_found, 3);
        assert_eq!(report.counts.sheets_processed, 1);
        assert_eq!(report.counts.sheets_skipped, 1);
        assert_eq!(report.counts.sheets_failed, 1);
        assert_eq!(report.counts.rows_skipped, 1);
        assert_eq!(report.errors[0].code, DiagnosticCode::Preparation);
        assert_eq!(store.total_records(), 0);
        assert_eq!(jobs.status("job-7"), Some(JobStatus::Succeeded));
        assert!(!jobs.job("job-7").unwrap().logs.is_empty());
    }

    #[test]
    fn preview_reports_rows_without_persisting() {
        let workspace = Workspace::from_yaml_str(WORKSPACE).unwrap();
        let ctx = ImportContext::new("acme", "tester", ImportMode::Preview);
        let request = ImportRequest::new(vec![RawSheet::from_text(
            "Chart",
            &["Code", "Name"],
            &[&["1000", "Cash"], &["1010", "Bank"]],
        )]);
        let mut store = MemoryStore::new();
        let report = run_import(
            &ctx,
            &workspace,
            &mut store,
            &mut MemorySnapshotStore::new(),
            &mut MemoryJobSink::new(),
            request,
        )
        .unwrap();
        assert!(!report.committed);
        assert_eq!(report.counts.rows_ok, 2);
        assert_eq!(report.model("account").unwrap().rows[1].record_id, Some(2));
        assert_eq!(store.total_records(), 0);
    }
}
