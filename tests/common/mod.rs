#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use ledger_import::{
    config::{ImportContext, ImportMode, Workspace},
    fingerprint::MemorySnapshotStore,
    job::MemoryJobSink,
    pipeline::{ImportReport, ImportRequest, run_import},
    store::MemoryStore,
    transform::RawSheet,
};
use tempfile::{TempDir, tempdir};

pub const COMPANY: &str = "acme";

/// Returns the absolute path to a fixture under `tests/data`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

/// Chart of accounts, journal and entry entities with the tenant rules for `acme`.
pub fn ledger_workspace() -> Workspace {
    Workspace::load(&fixture_path("ledger_workspace.yaml")).expect("load ledger workspace")
}

pub fn chart(rows: &[&[&str]]) -> RawSheet {
    RawSheet::from_text("Chart", &["__row_id", "Code", "Name", "Parent"], rows)
}

pub fn journal(rows: &[&[&str]]) -> RawSheet {
    RawSheet::from_text(
        "Journal",
        &["__row_id", "Ref", "Date", "Amount", "Status", "Debit", "Credit"],
        rows,
    )
}

pub fn entries(rows: &[&[&str]]) -> RawSheet {
    RawSheet::from_text("Entries", &["Transaction", "Account", "Amount", "Memo"], rows)
}

/// In-memory collaborators for running imports against one store.
pub struct Harness {
    pub workspace: Workspace,
    pub store: MemoryStore,
    pub snapshots: MemorySnapshotStore,
    pub jobs: MemoryJobSink,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_workspace(ledger_workspace())
    }

    pub fn with_workspace(workspace: Workspace) -> Self {
        Self {
            workspace,
            store: MemoryStore::new(),
            snapshots: MemorySnapshotStore::new(),
            jobs: MemoryJobSink::new(),
        }
    }

    pub fn context(&self, mode: ImportMode) -> ImportContext {
        ImportContext::new(COMPANY, "tester", mode)
    }

    pub fn run(&mut self, mode: ImportMode, sheets: Vec<RawSheet>) -> ImportReport {
        let ctx = self.context(mode);
        self.run_with(&ctx, sheets)
    }

    pub fn run_with(&mut self, ctx: &ImportContext, sheets: Vec<RawSheet>) -> ImportReport {
        run_import(
            ctx,
            &self.workspace,
            &mut self.store,
            &mut self.snapshots,
            &mut self.jobs,
            ImportRequest::new(sheets),
        )
        .expect("import runs")
    }
}

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }
}
