use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ImportSettings;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Import tenant spreadsheets into ledger entities",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the full import and roll everything back, reporting what would happen
    Preview(ImportArgs),
    /// Run the import all-or-nothing and keep the result
    Commit(CommitArgs),
    /// Show transformed and substituted rows without executing them
    Transform(ImportArgs),
    /// Fingerprint sheets and compare them with previous imports
    Fingerprint(ImportArgs),
}

/// A sheet given as `name=path` or `name=path:entity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSpec {
    pub name: String,
    pub path: PathBuf,
    pub entity: Option<String>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Workspace YAML holding the entity registry and tenant rules
    #[arg(short, long)]
    pub workspace: PathBuf,
    /// Tenant whose rules apply
    #[arg(short, long)]
    pub company: String,
    /// User recorded on the import
    #[arg(long, default_value = "cli")]
    pub user: String,
    /// Sheet to import as `name=path[:entity]` (repeatable)
    #[arg(short, long = "sheet", required = true, action = clap::ArgAction::Append, value_parser = parse_sheet_spec)]
    pub sheets: Vec<SheetSpec>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Job id to record lifecycle and follow-on work under
    #[arg(long)]
    pub job: Option<String>,
    /// JSON-lines file holding snapshots of previous imports
    #[arg(long)]
    pub history: Option<PathBuf>,
    /// Number of previous snapshots compared for duplicates
    #[arg(long = "dedup-history")]
    pub dedup_history: Option<usize>,
    /// Rows between progress updates
    #[arg(long = "progress-every")]
    pub progress_every: Option<usize>,
    /// Evaluate every substitution lookup without caching
    #[arg(long = "no-substitution-cache")]
    pub no_substitution_cache: bool,
    /// Print the report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

impl ImportArgs {
    pub fn apply_overrides(&self, settings: &mut ImportSettings) {
        if let Some(depth) = self.dedup_history {
            settings.dedup_history = depth;
        }
        if let Some(every) = self.progress_every {
            settings.progress_every = every;
        }
        if self.no_substitution_cache {
            settings.substitution_cache = false;
        }
    }
}

#[derive(Debug, Args)]
pub struct CommitArgs {
    #[command(flatten)]
    pub import: ImportArgs,
    /// Write committed records as JSON to this file
    #[arg(long)]
    pub records: Option<PathBuf>,
}

pub fn parse_sheet_spec(value: &str) -> Result<SheetSpec, String> {
    let (name, rest) = value
        .split_once('=')
        .ok_or_else(|| format!("Sheet '{value}' must look like name=path[:entity]"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("Sheet name cannot be empty".to_string());
    }
    let (path, entity) = match rest.rsplit_once(':') {
        Some((path, entity))
            if !path.is_empty()
                && !entity.is_empty()
                && entity.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            (path, Some(entity.to_string()))
        }
        _ => (rest, None),
    };
    if path.is_empty() {
        return Err(format!("Sheet '{name}' has no path"));
    }
    Ok(SheetSpec {
        name: name.to_string(),
        path: PathBuf::from(path),
        entity,
    })
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_specs_split_name_path_and_entity() {
        assert_eq!(
            parse_sheet_spec("Chart=data/chart.csv:account").unwrap(),
            SheetSpec {
                name: "Chart".into(),
                path: PathBuf::from("data/chart.csv"),
                entity: Some("account".into()),
            }
        );
        let plain = parse_sheet_spec("Entries=entries.csv").unwrap();
        assert_eq!(plain.entity, None);
        let windows = parse_sheet_spec(r"Entries=C:\exports\entries.csv").unwrap();
        assert_eq!(windows.path, PathBuf::from(r"C:\exports\entries.csv"));
        assert_eq!(windows.entity, None);
        assert!(parse_sheet_spec("entries.csv").is_err());
        assert!(parse_sheet_spec("=entries.csv").is_err());
    }

    #[test]
    fn delimiter_aliases() {
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert_eq!(parse_delimiter(";"), Ok(b';'));
        assert!(parse_delimiter("ab").is_err());
    }

    #[test]
    fn command_line_parses() {
        let cli = Cli::try_parse_from([
            "ledger-import",
            "commit",
            "-w",
            "ws.yaml",
            "-c",
            "acme",
            "--sheet",
            "Chart=chart.csv",
            "--sheet",
            "Entries=entries.csv:entry",
            "--dedup-history",
            "3",
            "--records",
            "out.json",
        ])
        .unwrap();
        let Commands::Commit(args) = cli.command else {
            panic!("expected commit");
        };
        assert_eq!(args.import.sheets.len(), 2);
        assert_eq!(args.records, Some(PathBuf::from("out.json")));
        let mut settings = ImportSettings::default();
        args.import.apply_overrides(&mut settings);
        assert_eq!(settings.dedup_history, 3);
        assert!(settings.substitution_cache);
    }
}
