pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod filter;
pub mod fingerprint;
pub mod io_utils;
pub mod job;
pub mod pipeline;
pub mod rules;
pub mod schema;
pub mod store;
pub mod substitution;
pub mod table;
pub mod transform;

use std::{collections::BTreeMap, env, fs, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};
use serde::Serialize;

use crate::{
    cli::{Cli, Commands, CommitArgs, ImportArgs},
    config::{ImportContext, ImportMode, Workspace},
    fingerprint::{DedupReport, FileSnapshotStore, MemorySnapshotStore, SnapshotStore, TableFingerprint},
    job::MemoryJobSink,
    pipeline::{ImportReport, ImportRequest, prepare_sheets, run_import},
    schema::SchemaProvider,
    store::{EntityStore, MemoryStore},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("ledger_import", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Preview(args) => handle_import(&args, ImportMode::Preview, None),
        Commands::Commit(CommitArgs { import, records }) => {
            handle_import(&import, ImportMode::Commit, records.as_deref())
        }
        Commands::Transform(args) => handle_transform(&args),
        Commands::Fingerprint(args) => handle_fingerprint(&args),
    }
}

struct LoadedInput {
    workspace: Workspace,
    request: ImportRequest,
}

fn load_input(args: &ImportArgs) -> Result<LoadedInput> {
    let mut workspace =
        Workspace::load(&args.workspace).with_context(|| format!("Loading workspace {:?}", args.workspace))?;
    args.apply_overrides(&mut workspace.settings);
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;

    let mut sheets = Vec::with_capacity(args.sheets.len());
    let mut hashes = Vec::with_capacity(args.sheets.len());
    for spec in &args.sheets {
        let (sheet, sha256) = io_utils::read_sheet(&spec.name, &spec.path, args.delimiter, encoding)
            .with_context(|| format!("Reading sheet '{}'", spec.name))?;
        let sheet = match &spec.entity {
            Some(entity) => sheet.with_entity(entity),
            None => sheet,
        };
        debug!("Sheet '{}' has {} line(s)", spec.name, sheet.grid.len());
        let file_name = spec
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.path.display().to_string());
        hashes.push((file_name, sha256));
        sheets.push(sheet);
    }
    let mut request = ImportRequest::new(sheets);
    if let Some(source) = io_utils::source_file(&hashes) {
        request = request.with_source_file(source);
    }
    Ok(LoadedInput { workspace, request })
}

fn context_for(args: &ImportArgs, mode: ImportMode) -> ImportContext {
    let ctx = ImportContext::new(&args.company, &args.user, mode);
    match &args.job {
        Some(job) => ctx.with_job(job),
        None => ctx,
    }
}

fn open_history(args: &ImportArgs) -> Result<Box<dyn SnapshotStore>> {
    Ok(match &args.history {
        Some(path) => Box::new(
            FileSnapshotStore::open(path).with_context(|| format!("Opening snapshot history {path:?}"))?,
        ),
        None => Box::new(MemorySnapshotStore::new()),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Serializing output")?;
    println!("{rendered}");
    Ok(())
}

fn handle_import(args: &ImportArgs, mode: ImportMode, records: Option<&std::path::Path>) -> Result<()> {
    let LoadedInput { workspace, request } = load_input(args)?;
    let ctx = context_for(args, mode);
    info!(
        "{} of {} sheet(s) for company '{}'",
        mode.as_str(),
        request.sheets.len(),
        ctx.company
    );
    let mut store = MemoryStore::new();
    let mut snapshots = open_history(args)?;
    let mut jobs = MemoryJobSink::new();
    let report = run_import(&ctx, &workspace, &mut store, snapshots.as_mut(), &mut jobs, request)?;

    if args.json {
        print_json(&report)?;
    } else {
        print!("{}", table::render_report(&report));
    }
    for request in jobs.queued() {
        info!("Follow-on rule '{}' queued for event '{}'", request.rule_id, request.event);
    }

    if let Some(path) = records {
        if report.committed {
            write_records(&workspace, &store, path)?;
        }
    }
    ensure_committed(&report)
}

fn ensure_committed(report: &ImportReport) -> Result<()> {
    if report.mode == ImportMode::Commit && !report.committed {
        bail!(
            "Import was not committed: {} error(s), {} row(s) failed",
            report.errors.len(),
            report.counts.rows_failed
        );
    }
    Ok(())
}

fn write_records(workspace: &Workspace, store: &MemoryStore, path: &std::path::Path) -> Result<()> {
    let records = workspace
        .schema
        .entity_names()
        .into_iter()
        .filter(|entity| store.count(entity) > 0)
        .map(|entity| {
            let records = store.records(&entity);
            (entity, records)
        })
        .collect::<BTreeMap<_, _>>();
    let rendered = serde_json::to_string_pretty(&records).context("Serializing records")?;
    fs::write(path, rendered).with_context(|| format!("Writing records to {path:?}"))?;
    info!("Committed records written to {path:?}");
    Ok(())
}

fn handle_transform(args: &ImportArgs) -> Result<()> {
    let LoadedInput { workspace, request } = load_input(args)?;
    let ctx = context_for(args, ImportMode::Preview);
    let prepared = prepare_sheets(&ctx, &workspace, &request.sheets);
    if args.json {
        #[derive(Serialize)]
        struct EntityRows<'a> {
            entity: &'a str,
            rows: &'a [data::Row],
            substitutions: &'a [substitution::SubstitutionChange],
        }
        #[derive(Serialize)]
        struct TransformOutput<'a> {
            entities: Vec<EntityRows<'a>>,
            sheets: &'a [pipeline::SheetSummary],
            errors: &'a [error::Diagnostic],
            warnings: &'a [error::Diagnostic],
        }
        print_json(&TransformOutput {
            entities: prepared
                .batches
                .iter()
                .map(|batch| EntityRows {
                    entity: &batch.entity,
                    rows: &batch.rows,
                    substitutions: &batch.substitutions,
                })
                .collect(),
            sheets: &prepared.sheets,
            errors: &prepared.errors,
            warnings: &prepared.warnings,
        })?;
    } else {
        print!("{}", table::render_prepared(&prepared));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct FingerprintOutput {
    entity: String,
    #[serde(flatten)]
    fingerprint: TableFingerprint,
    dedup: DedupReport,
}

fn handle_fingerprint(args: &ImportArgs) -> Result<()> {
    let LoadedInput { workspace, request } = load_input(args)?;
    let ctx = context_for(args, ImportMode::Preview);
    let prepared = prepare_sheets(&ctx, &workspace, &request.sheets);
    if let Some(error) = prepared.errors.first() {
        bail!("Cannot fingerprint: {error}");
    }
    let history = open_history(args)?;
    let mut outputs = Vec::with_capacity(prepared.batches.len());
    for batch in &prepared.batches {
        let schema = workspace
            .schema
            .entity(&batch.entity)
            .with_context(|| format!("Entity '{}' is not registered", batch.entity))?;
        let computed = fingerprint::fingerprint(schema, &batch.rows);
        let recent = history.recent(&ctx.company, &batch.entity, workspace.settings.dedup_history);
        let dedup = fingerprint::compare(&computed, &recent, workspace.settings.sample_hash_limit);
        outputs.push(FingerprintOutput {
            entity: batch.entity.clone(),
            fingerprint: computed,
            dedup,
        });
    }

    if args.json {
        return print_json(&outputs);
    }
    let headers = ["entity", "rows", "table hash", "duplicate of", "similarity"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let rows = outputs
        .iter()
        .map(|output| {
            vec![
                output.entity.clone(),
                output.fingerprint.row_count.to_string(),
                output.fingerprint.table_hash.clone(),
                output.dedup.duplicate_of.clone().unwrap_or_default(),
                output
                    .dedup
                    .similarity
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_default(),
            ]
        })
        .collect::<Vec<_>>();
    print!("{}", table::render_table(&headers, &rows));
    Ok(())
}
