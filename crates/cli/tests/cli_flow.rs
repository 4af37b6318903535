#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::tempdir;

fn spool() -> Command {
    let mut cmd = Command::cargo_bin("spool").expect("binary");
    cmd.arg("--quiet");
    cmd
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json on stdout")
}

#[test]
fn schema_describes_response_fields() {
    let output = spool().arg("schema").output().expect("run");
    assert!(output.status.success());
    let schema = json_stdout(&output);
    let props = &schema["properties"];
    for field in ["success", "sessionId", "timestamp", "response", "status"] {
        assert!(props.get(field).is_some(), "missing {field} in {schema}");
    }
}

#[test]
fn enqueue_writes_request_with_given_session() {
    let temp = tempdir().unwrap();
    spool()
        .args(["enqueue", "--root"])
        .arg(temp.path())
        .args(["--session", "abc", "--text", "R1"])
        .assert()
        .success()
        .stdout("abc\n");

    let body = fs::read_to_string(temp.path().join("spool-request-abc.txt")).unwrap();
    assert_eq!(body, "R1");
}

#[test]
fn enqueue_rejects_path_like_session() {
    let temp = tempdir().unwrap();
    spool()
        .args(["enqueue", "--root"])
        .arg(temp.path())
        .args(["--session", "../escape", "--text", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid session id"));
}

#[test]
fn wait_times_out_with_exit_code_two() {
    let temp = tempdir().unwrap();
    let output = spool()
        .args(["wait", "--root"])
        .arg(temp.path())
        .args(["--session", "missing", "--timeout-ms", "100", "--json"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let body = json_stdout(&output);
    assert_eq!(body["status"], "timed_out");
    assert_eq!(body["sessionId"], "missing");
}

#[test]
fn wait_rejects_invalid_session_with_its_own_exit_code() {
    let temp = tempdir().unwrap();
    spool()
        .args(["wait", "--root"])
        .arg(temp.path())
        .args(["--session", "../escape", "--timeout-ms", "100"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("invalid session id"));
}

#[test]
fn wait_prints_ready_response() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("spool-response-abc.json"),
        r#"{"success":true,"sessionId":"abc","timestamp":"2026-10-15T12:00:00.000Z","response":"done","status":"completed","attempts":1}"#,
    )
    .unwrap();

    spool()
        .args(["wait", "--root"])
        .arg(temp.path())
        .args(["--session", "abc", "--timeout-ms", "1000"])
        .assert()
        .success()
        .stdout("done\n");
}

#[test]
fn wait_flags_failed_and_malformed_responses() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("spool-response-bad.json"),
        r#"{"success":false,"sessionId":"bad","timestamp":"2026-10-15T12:00:00.000Z","response":"","status":"failed","error":"session bad: malformed request: empty request body"}"#,
    )
    .unwrap();
    fs::write(
        temp.path().join("spool-response-junk.json"),
        r#"{"success":"yes"}"#,
    )
    .unwrap();

    spool()
        .args(["wait", "--root"])
        .arg(temp.path())
        .args(["--session", "bad", "--timeout-ms", "1000"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("empty request body"));

    let output = spool()
        .args(["wait", "--root"])
        .arg(temp.path())
        .args(["--session", "junk", "--timeout-ms", "1000", "--json"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(3));
    let body = json_stdout(&output);
    assert_eq!(body["status"], "malformed");
    assert!(body["defects"].as_array().is_some_and(|d| !d.is_empty()));
}

#[test]
fn diagnose_reports_json_and_markdown() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("spool-request-pending.txt"), "work").unwrap();

    let output = spool()
        .args(["diagnose", "--json", "--root"])
        .arg(temp.path())
        .output()
        .expect("run");
    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["root_exists"], true);
    assert_eq!(report["pending_requests"], 1);
    assert_eq!(report["health_score"], 100);
    assert_eq!(report["status"], "healthy");

    std::thread::sleep(std::time::Duration::from_millis(20));
    let output = spool()
        .args(["diagnose", "--json", "--stale-after-ms", "1", "--root"])
        .arg(temp.path())
        .output()
        .expect("run");
    let report = json_stdout(&output);
    assert_eq!(report["stale_requests"][0]["file_name"], "spool-request-pending.txt");
    assert_eq!(report["health_score"], 90);

    spool()
        .args(["diagnose", "--root"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("# Spool diagnostic report"));
}

#[test]
fn diagnose_missing_root_scores_zero() {
    let temp = tempdir().unwrap();
    let output = spool()
        .args(["diagnose", "--json", "--root"])
        .arg(temp.path().join("nope"))
        .output()
        .expect("run");
    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["root_exists"], false);
    assert_eq!(report["health_score"], 0);
    assert_eq!(report["status"], "critical");
}

#[test]
fn status_reads_persisted_health_report() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("health.json");

    spool()
        .args(["status", "--health-file"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no health report"));

    fs::write(
        &path,
        r#"{"status":"healthy","root_reachable":true,"watcher_alive":true,"in_flight":0,"pending_requests":0,"lifetime_processed":3,"lifetime_failed":0,"duplicates_skipped":1,"restarts":0,"watcher_faults":0,"last_check_unix_ms":1}"#,
    )
    .unwrap();
    let output = spool()
        .args(["status", "--health-file"])
        .arg(&path)
        .output()
        .expect("run");
    assert!(output.status.success());
    assert_eq!(json_stdout(&output)["lifetime_processed"], 3);
}
