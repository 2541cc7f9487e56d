//! Drive the `warden` binary against a temp pipeline and check exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

const PIPELINE: &str = r#"digraph release {
    build [handler="codegen"]
    package
    build -> package
}"#;

const CONFIG: &str = r#"
[guard]
spot_check_rate = 0.0
"#;

fn warden(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_warden"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("failed to run warden")
}

fn setup() -> tempfile::TempDir {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join("release.dot"), PIPELINE).unwrap();
    fs::write(temp.path().join("warden.toml"), CONFIG).unwrap();
    let out = warden(temp.path(), &["init", "release.dot"]);
    assert!(out.status.success(), "init failed: {}", String::from_utf8_lossy(&out.stderr));
    temp
}

fn json_stdout(out: &Output) -> Value {
    assert!(
        out.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout is JSON")
}

#[test]
fn status_lists_nodes_as_json() {
    let temp = setup();
    let rows = json_stdout(&warden(temp.path(), &["status", "release.dot", "--json"]));
    let ids: Vec<&str> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["build", "package"]);
    assert_eq!(rows[0]["status"], "pending");

    let ready = json_stdout(&warden(temp.path(), &["status", "release.dot", "--deps-met", "--json"]));
    assert_eq!(ready.as_array().unwrap().len(), 1);
}

#[test]
fn transition_updates_graph_file() {
    let temp = setup();
    let out = warden(
        temp.path(),
        &["transition", "release.dot", "build", "active", "--actor", "sched", "--role", "scheduler"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let text = fs::read_to_string(temp.path().join("release.dot")).unwrap();
    assert!(text.contains(r#"status="active""#), "{text}");

    let active = json_stdout(&warden(
        temp.path(),
        &["status", "release.dot", "--filter", "active", "--json"],
    ));
    assert_eq!(active[0]["id"], "build");
}

#[test]
fn illegal_transition_exits_3() {
    let temp = setup();
    let out = warden(temp.path(), &["transition", "release.dot", "build", "validated"]);
    assert_eq!(out.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Illegal transition"));
}

#[test]
fn guard_rejection_exits_5() {
    let temp = setup();
    warden(temp.path(), &["transition", "release.dot", "build", "active"]);
    let out = warden(
        temp.path(),
        &["transition", "release.dot", "build", "impl_complete", "--actor", "w1", "--role", "implementer"],
    );
    assert_eq!(out.status.code(), Some(5));

    let evidence = format!(
        r#"{{"actor":"w1","produced_at":"{}"}}"#,
        chrono::Utc::now().to_rfc3339()
    );
    let out = warden(
        temp.path(),
        &[
            "transition", "release.dot", "build", "impl_complete", "--actor", "w1", "--role",
            "implementer", "--evidence", &evidence,
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn invalid_graph_file_exits_2() {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join("loop.dot"), "digraph loop { a -> b -> a }").unwrap();
    let out = warden(temp.path(), &["validate", "loop.dot"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stdout).contains("ERROR"));
}

#[test]
fn cycle_closing_edge_exits_2_and_keeps_graph() {
    let temp = setup();
    let out = warden(temp.path(), &["edge", "add", "release.dot", "package", "build"]);
    assert_eq!(out.status.code(), Some(2));

    let edges = json_stdout(&warden(temp.path(), &["edge", "list", "release.dot", "--json"]));
    assert_eq!(edges.as_array().unwrap().len(), 1);
}

#[test]
fn node_add_creates_paired_gate() {
    let temp = setup();
    let out = warden(
        temp.path(),
        &["node", "add", "release.dot", "docs", "--after", "build", "--set", "priority=2"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let rows = json_stdout(&warden(temp.path(), &["status", "release.dot", "--json"]));
    let ids: Vec<&str> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["build", "package", "docs", "docs_gate"]);

    let out = warden(temp.path(), &["node", "remove", "release.dot", "docs"]);
    assert_eq!(out.status.code(), Some(2));
    let out = warden(temp.path(), &["node", "remove", "release.dot", "docs", "--cascade"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn tampered_audit_log_exits_4() {
    let temp = setup();
    warden(temp.path(), &["transition", "release.dot", "build", "active"]);
    let verified = json_stdout(&warden(temp.path(), &["audit", "verify", "release.dot", "--json"]));
    assert_eq!(verified["entries"], 3);

    let audit = temp.path().join(".warden/audit/release.jsonl");
    let text = fs::read_to_string(&audit).unwrap();
    fs::write(&audit, text.replacen("pipeline.init", "pipeline.init2", 1)).unwrap();

    let out = warden(temp.path(), &["audit", "verify", "release.dot"]);
    assert_eq!(out.status.code(), Some(4));
}

#[test]
fn checkpoints_accumulate() {
    let temp = setup();
    warden(temp.path(), &["pause", "release.dot", "--reason", "freeze"]);
    warden(temp.path(), &["resume", "release.dot"]);
    let list = json_stdout(&warden(temp.path(), &["checkpoint", "list", "release.dot", "--json"]));
    let seqs: Vec<u64> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[test]
fn watch_once_dispatches() {
    let temp = setup();
    let report = json_stdout(&warden(temp.path(), &["watch", "release.dot", "--once", "--json"]));
    assert_eq!(report["dispatched"][0][0], "build");
    assert_eq!(report["dispatched"][0][1], "codegen");

    let listing = json_stdout(&warden(
        temp.path(),
        &["signal", "list", "release.dot", "codegen", "--json"],
    ));
    assert_eq!(listing[0]["signals"].as_array().unwrap().len(), 1);
}

#[test]
fn health_reports_label() {
    let temp = setup();
    let report = json_stdout(&warden(temp.path(), &["health", "release.dot", "--json"]));
    assert_eq!(report["label"], "healthy");
    assert_eq!(report["dispatchable"], 1);
}
