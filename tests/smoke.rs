//! Smoke tests -- verify the binary runs and the main subcommands work end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn usagewatch(dir: &Path) -> Command {
    let config = dir.join("usagewatch.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = {:?}\n\n[analysis]\nworkers = 2\n",
            dir.join("usage.db").display().to_string()
        ),
    )
    .unwrap();
    let mut cmd = Command::cargo_bin("usagewatch").unwrap();
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("usagewatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("anomaly scoring"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("usagewatch")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("usagewatch"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["ingest", "--help"],
        vec!["forecast", "import", "--help"],
        vec!["recompute", "--help"],
        vec!["serve", "--help"],
        vec!["schedule", "dry-run", "--help"],
        vec!["show", "--help"],
    ] {
        Command::cargo_bin("usagewatch").unwrap().args(&args).assert().success();
    }
}

#[test]
fn test_schedule_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    usagewatch(dir.path())
        .args(["schedule", "dry-run", "--hours", "48"])
        .assert()
        .success()
        .stdout(predicate::str::contains("recompute"));
}

#[test]
fn test_ingest_recompute_show() {
    let dir = tempfile::tempdir().unwrap();
    let events = dir.path().join("events.jsonl");
    std::fs::write(
        &events,
        r#"{"timestamp":"2025-08-18T09:10:00Z","user":"ALICE","role":"ANALYST","warehouse":"WH","database":"SALES","execution_time":25}
{"timestamp":"2025-08-18T09:20:00Z","user":"BOB","role":"LOADER","warehouse":"WH","database":"SALES","query_type":"INSERT","rows_inserted":500,"execution_time":75}
{"timestamp":"2025-08-18T09:30:00Z","event_type":"metering","warehouse":"WH","credits_compute":8}
"#,
    )
    .unwrap();

    usagewatch(dir.path())
        .arg("ingest")
        .arg(&events)
        .assert()
        .success()
        .stdout(predicate::str::contains("Ingested 3 event(s)"));

    usagewatch(dir.path())
        .args(["recompute", "--from", "2025-08-18"])
        .assert()
        .success()
        .stdout(predicate::str::contains("success"));

    usagewatch(dir.path())
        .args(["show", "cost_attribution", "--from", "2025-08-18", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"compute_credits\": 2.0"))
        .stdout(predicate::str::contains("\"compute_credits\": 6.0"));

    usagewatch(dir.path())
        .args(["show", "daily_write_activity", "--from", "2025-08-18"])
        .assert()
        .success()
        .stdout(predicate::str::contains("LOADER | SALES"))
        .stdout(predicate::str::contains("(1 row(s))"));
}

#[test]
fn test_unknown_view_fails() {
    let dir = tempfile::tempdir().unwrap();
    usagewatch(dir.path())
        .args(["show", "nope", "--from", "2025-08-18"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown materialization"));
}

#[test]
fn test_reversed_range_fails() {
    let dir = tempfile::tempdir().unwrap();
    usagewatch(dir.path())
        .args(["recompute", "--from", "2025-08-19", "--to", "2025-08-18"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid bucket range"));
}

#[test]
fn test_recompute_empty_log_fails() {
    let dir = tempfile::tempdir().unwrap();
    usagewatch(dir.path())
        .arg("recompute")
        .assert()
        .failure()
        .stderr(predicate::str::contains("event log is empty"));
}
