mod common;

use std::fs;

use assert_cmd::Command;
use common::{TestWorkspace, fixture_path};
use predicates::str::contains;
use serde_json::Value as JsonValue;

const CHART: &str = "__row_id,Code,Name,Parent\nassets,1000,Assets,\ncash,1010,Cash,assets\n";
const JOURNAL: &str = "__row_id,Ref,Date,Amount,Status,Debit,Credit\nt1,J-1,2024-03-01,12.50,PEND,,\n";

fn ledger_import() -> Command {
    Command::cargo_bin("ledger-import").expect("binary exists")
}

fn workspace_arg() -> String {
    fixture_path("ledger_workspace.yaml").to_string_lossy().into_owned()
}

fn sheet_arg(name: &str, path: &std::path::Path) -> String {
    format!("{name}={}", path.display())
}

fn json_stdout(output: &std::process::Output) -> JsonValue {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn preview_reports_rows_without_committing() {
    let scratch = TestWorkspace::new();
    let chart = scratch.write("chart.csv", CHART);
    ledger_import()
        .args(["preview", "-w", workspace_arg().as_str(), "-c", "acme", "--sheet", sheet_arg("Chart", &chart).as_str()])
        .assert()
        .success()
        .stdout(contains("preview not committed"))
        .stdout(contains("created account #2"));
}

#[test]
fn commit_writes_json_report_and_records() {
    let scratch = TestWorkspace::new();
    let chart = scratch.write("chart.csv", CHART);
    let journal = scratch.write("journal.csv", JOURNAL);
    let records = scratch.path().join("records.json");

    let output = ledger_import()
        .args([
            "commit",
            "-w",
            workspace_arg().as_str(),
            "-c",
            "acme",
            "--sheet",
            sheet_arg("Chart", &chart).as_str(),
            "--sheet",
            sheet_arg("Journal", &journal).as_str(),
            "--json",
            "--records",
            records.to_str().unwrap(),
        ])
        .output()
        .expect("run commit");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report = json_stdout(&output);
    assert_eq!(report["committed"], JsonValue::Bool(true));
    assert_eq!(report["mode"], "commit");
    assert_eq!(report["counts"]["rows_ok"], 3);
    assert_eq!(report["models"][0]["model"], "account");
    assert_eq!(report["models"][0]["rows"][1]["data"]["parent_id"], 1);
    assert_eq!(report["models"][1]["rows"][0]["data"]["status"], "pending");

    let stored: JsonValue = serde_json::from_str(&fs::read_to_string(&records).unwrap()).unwrap();
    assert_eq!(stored["account"].as_array().unwrap().len(), 2);
    assert_eq!(stored["transaction"].as_array().unwrap().len(), 1);
}

#[test]
fn history_file_detects_a_repeated_commit() {
    let scratch = TestWorkspace::new();
    let chart = scratch.write("chart.csv", CHART);
    let history = scratch.path().join("history.jsonl");
    let run = || {
        ledger_import()
            .args([
                "commit",
                "-w",
                workspace_arg().as_str(),
                "-c",
                "acme",
                "--sheet",
                sheet_arg("Chart", &chart).as_str(),
                "--history",
                history.to_str().unwrap(),
                "--json",
            ])
            .output()
            .expect("run commit")
    };

    let first = json_stdout(&run());
    assert_eq!(first["models"][0]["dedup"]["exact_table_duplicate"], false);
    let second = json_stdout(&run());
    let dedup = &second["models"][0]["dedup"];
    assert_eq!(dedup["exact_table_duplicate"], true);
    assert_eq!(dedup["duplicate_of"], first["snapshots"][0]);

    let lines = fs::read_to_string(&history).unwrap();
    assert_eq!(lines.lines().count(), 2);
    assert!(lines.contains("chart.csv"));
}

#[test]
fn failed_commit_exits_with_error() {
    let scratch = TestWorkspace::new();
    let chart = scratch.write("chart.csv", "Code,Name\n1000,Cash\n1000,Also cash\n");
    ledger_import()
        .args(["commit", "-w", workspace_arg().as_str(), "-c", "acme", "--sheet", sheet_arg("Chart", &chart).as_str()])
        .assert()
        .failure()
        .stdout(contains("same unique value"))
        .stderr(contains("Import was not committed"));
}

#[test]
fn transform_shows_substituted_rows() {
    let scratch = TestWorkspace::new();
    let journal = scratch.write("journal.csv", JOURNAL);
    let output = ledger_import()
        .args([
            "transform",
            "-w",
            workspace_arg().as_str(),
            "-c",
            "acme",
            "--sheet",
            sheet_arg("Journal", &journal).as_str(),
            "--json",
        ])
        .output()
        .expect("run transform");
    assert!(output.status.success());
    let rendered = json_stdout(&output);
    let entity = &rendered["entities"][0];
    assert_eq!(entity["entity"], "transaction");
    assert_eq!(entity["rows"][0]["fields"]["status"], "pending");
    assert_eq!(entity["substitutions"][0]["rule_id"], "pending-status");
    assert_eq!(rendered["sheets"][0]["status"], "processed");
}

#[test]
fn fingerprint_reads_custom_delimiter_and_entity_hint() {
    let scratch = TestWorkspace::new();
    let extra = scratch.write("extra.csv", "Code;Name\n2000;Payables\n2010;Accruals\n");
    ledger_import()
        .args([
            "fingerprint",
            "-w",
            workspace_arg().as_str(),
            "-c",
            "acme",
            "--sheet",
            format!("Extra={}:account", extra.display()).as_str(),
            "--delimiter",
            ";",
        ])
        .assert()
        .success()
        .stdout(contains("table hash"))
        .stdout(contains("account"));
}

#[test]
fn missing_sheet_file_is_reported() {
    ledger_import()
        .args(["preview", "-w", workspace_arg().as_str(), "-c", "acme", "--sheet", "Chart=does-not-exist.csv"])
        .assert()
        .failure()
        .stderr(contains("Reading sheet 'Chart'"));
}
