//! CLI subprocess integration tests.
//!
//! These tests invoke the `strata` binary as a subprocess against a temporary
//! store and verify exit codes, stdout content, and JSON output.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn strata_bin(store: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_strata"));
    cmd.env_remove("STRATA_LOG");
    cmd.arg("--store").arg(store);
    cmd
}

fn temp_store() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

fn write_request(dir: &Path, machine_id: &str, builder: &str) -> PathBuf {
    let path = dir.join(format!("{machine_id}.toml"));
    std::fs::write(
        &path,
        format!(
            r#"machine_id = "{machine_id}"
username = "alice"
provider = "mock"

[builder]
{builder}
"#
        ),
    )
    .unwrap();
    path
}

fn json_stdout(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("invalid JSON ({e}): {stdout}"))
}

fn build_json(store: &Path, request: &Path) -> Output {
    strata_bin(store)
        .args(["--json", "build"])
        .arg(request)
        .output()
        .unwrap()
}

#[test]
fn cli_version_exits_zero() {
    let store = temp_store();
    let output = strata_bin(store.path()).arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("strata"));
}

#[test]
fn cli_help_lists_commands() {
    let store = temp_store();
    let output = strata_bin(store.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["build", "status", "list", "events", "recover", "verify-store"] {
        assert!(stdout.contains(command), "help must list '{command}'");
    }
}

#[test]
fn cli_build_succeeds_with_mock() {
    let store = temp_store();
    let request = write_request(store.path(), "m1", r#"instanceName = "vm-1""#);

    let output = build_json(store.path(), &request);
    assert!(
        output.status.success(),
        "build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = json_stdout(&output);
    assert_eq!(json["run_id"], "build-m1");
    assert_eq!(json["state"], "Running");
    assert_eq!(json["error"], "");

    let status = strata_bin(store.path())
        .args(["--json", "status", "m1"])
        .output()
        .unwrap();
    assert!(status.status.success());
    let record = json_stdout(&status);
    assert_eq!(record["state"], "Running");
    assert_eq!(record["kind"], "build");
    assert_eq!(record["data"]["instanceName"], "vm-1");
    assert_eq!(record["data"]["username"], "alice");
}

#[test]
fn cli_rebuild_of_running_machine_is_request_error() {
    let store = temp_store();
    let request = write_request(store.path(), "m1", "");
    assert!(build_json(store.path(), &request).status.success());

    let again = build_json(store.path(), &request);
    assert_eq!(again.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&again.stderr);
    assert!(stderr.contains("already initialized"), "{stderr}");
}

#[test]
fn cli_failed_build_reverts_and_exits_one() {
    let store = temp_store();
    let request = write_request(store.path(), "m1", r#"mockOutcome = "fail""#);

    let output = build_json(store.path(), &request);
    assert_eq!(output.status.code(), Some(1));
    let json = json_stdout(&output);
    assert_eq!(json["state"], "NotInitialized");
    assert_eq!(json["error"], "Building failed. Please contact support.");

    let status = strata_bin(store.path())
        .args(["--json", "status", "m1"])
        .output()
        .unwrap();
    assert_eq!(json_stdout(&status)["state"], "NotInitialized");

    let retry = write_request(store.path(), "m1", "");
    assert!(build_json(store.path(), &retry).status.success());
}

#[test]
fn cli_malformed_instance_name_is_request_error() {
    let store = temp_store();
    let request = write_request(store.path(), "m1", "instanceName = 42");
    let output = build_json(store.path(), &request);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_missing_request_file_is_request_error() {
    let store = temp_store();
    let output = strata_bin(store.path())
        .args(["build", "does-not-exist.toml"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_events_show_terminal_record() {
    let store = temp_store();
    let request = write_request(store.path(), "m1", "");
    assert!(build_json(store.path(), &request).status.success());

    let output = strata_bin(store.path())
        .args(["--json", "events", "build-m1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let events = json_stdout(&output);
    let events = events.as_array().unwrap();
    assert!(events.len() >= 2);
    assert_eq!(
        events[0]["message"],
        "Building process started. Provider 'mock'. MachineId: m1"
    );
    let last = events.last().unwrap();
    assert_eq!(last["percentage"], 100);
    assert_eq!(last["status"], "Running");
    assert_eq!(
        events.iter().filter(|e| e["percentage"] == 100).count(),
        1
    );
}

#[test]
fn cli_events_of_unknown_run_is_request_error() {
    let store = temp_store();
    let output = strata_bin(store.path())
        .args(["events", "build-nothing"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_list_json_contains_built_machines() {
    let store = temp_store();
    for id in ["m1", "m2"] {
        let request = write_request(store.path(), id, "");
        assert!(build_json(store.path(), &request).status.success());
    }

    let output = strata_bin(store.path())
        .args(["--json", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = json_stdout(&output);
    let ids: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["machine_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[test]
fn cli_verify_store_detects_tampering() {
    let store = temp_store();
    let request = write_request(store.path(), "m1", "");
    assert!(build_json(store.path(), &request).status.success());

    let clean = strata_bin(store.path())
        .args(["--json", "verify-store"])
        .output()
        .unwrap();
    assert!(clean.status.success());
    assert_eq!(json_stdout(&clean)["failed"], 0);

    let record = store.path().join("store").join("machines").join("m1");
    let content = std::fs::read_to_string(&record).unwrap();
    std::fs::write(&record, content.replace("\"Running\"", "\"Stopped\"")).unwrap();

    let tampered = strata_bin(store.path())
        .args(["--json", "verify-store"])
        .output()
        .unwrap();
    assert_eq!(tampered.status.code(), Some(3));
    assert_eq!(json_stdout(&tampered)["failed"], 1);
}

#[test]
fn cli_recover_on_clean_store() {
    let store = temp_store();
    let output = strata_bin(store.path())
        .args(["--json", "recover", "--grace-secs", "0"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = json_stdout(&output);
    assert_eq!(json["reverted"].as_array().unwrap().len(), 0);
    assert_eq!(json["removed"], 0);
}

#[test]
fn cli_completions_bash() {
    let store = temp_store();
    let output = strata_bin(store.path())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("strata"));
}
