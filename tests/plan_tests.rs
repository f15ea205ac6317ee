//! Tests for plan-built steps
//!
//! These tests load plans from JSON, build steps with `into_steps()` and run
//! them through the sequencer with real `sh` commands. They verify:
//! - Install steps fall back only when the primary command fails
//! - Config and env steps skip exactly when a rerun would change nothing
//! - Model steps skip when listed and stream progress when downloading
//! - Inverted checks skip "upgrade if installed" steps
//! - A detached script reports the same SKIP/OK outcomes as an in-process run

use hostsetup::output_parser::ProgressEvent;
use hostsetup::plan::PlanFile;
use hostsetup::report::SequenceReport;
use hostsetup::sequencer::{Sequencer, SetupEvent, observer_fn};
use hostsetup::status_bridge::{render_script, write_script};
use hostsetup::step::Outcome;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sh(script: &str) -> Value {
    json!({ "program": "sh", "args": ["-c", script], "login_shell": false })
}

fn touch(path: &Path) -> Value {
    sh(&format!("touch '{}'", path.display()))
}

fn load(plan: Value) -> PlanFile {
    let plan: PlanFile = serde_json::from_value(plan).unwrap();
    plan.validate().unwrap();
    plan
}

fn run(plan: &PlanFile) -> (SequenceReport, Vec<SetupEvent>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut sequencer = Sequencer::new(plan.into_steps().unwrap());
    sequencer.subscribe(observer_fn(move |e: &SetupEvent| sink.lock().unwrap().push(e.clone())));
    let report = sequencer.run();
    let events = events.lock().unwrap().clone();
    (report, events)
}

// =============================================================================
// Install steps
// =============================================================================

#[test]
fn test_install_falls_back_when_primary_fails() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("node");
    let plan = load(json!({ "steps": [
        { "name": "node", "critical": true, "kind": "install",
          "check": { "path_exists": marker.to_string_lossy() },
          "run": sh("echo 'Permission denied'; exit 1"),
          "fallback": touch(&marker) }
    ]}));

    let (report, _) = run(&plan);
    assert!(report.success);
    assert_eq!(report.outcome("node"), Some(Outcome::Done));
    assert!(report.get("node").unwrap().message.starts_with("installed with fallback"));
    assert!(marker.exists());

    // The check now holds, so nothing runs the second time.
    let (report, _) = run(&plan);
    assert_eq!(report.outcome("node"), Some(Outcome::Skipped));
    assert!(report.get("node").unwrap().message.ends_with("already exists"));
}

#[test]
fn test_install_without_fallback_fails_with_output() {
    let dir = TempDir::new().unwrap();
    let plan = load(json!({ "steps": [
        { "name": "node", "critical": true, "kind": "install",
          "check": { "path_exists": dir.path().join("missing").to_string_lossy() },
          "run": sh("echo 'Error: no such formula'; exit 1") },
        { "name": "gateway", "kind": "command", "run": sh("true") }
    ]}));

    let (report, _) = run(&plan);
    assert!(!report.success);
    assert_eq!(report.outcome("node"), Some(Outcome::Failed));
    assert_eq!(report.get("node").unwrap().message, "Error: no such formula");
    assert_eq!(report.halted_by.as_deref(), Some("node"));
    assert_eq!(report.outcome("gateway"), Some(Outcome::Pending));
}

#[test]
fn test_fallback_not_tried_after_primary_succeeds() {
    let dir = TempDir::new().unwrap();
    let fallback_marker = dir.path().join("fallback-ran");
    let plan = load(json!({ "steps": [
        { "name": "node", "kind": "install",
          "check": { "path_exists": dir.path().join("missing").to_string_lossy() },
          "run": sh("true"),
          "fallback": touch(&fallback_marker) }
    ]}));

    let (report, _) = run(&plan);
    assert_eq!(report.outcome("node"), Some(Outcome::Done));
    assert!(!report.get("node").unwrap().message.contains("fallback"));
    assert!(!fallback_marker.exists());
}

#[test]
fn test_cancelled_primary_never_reaches_fallback() {
    let dir = TempDir::new().unwrap();
    let fallback_marker = dir.path().join("fallback-ran");
    let plan = load(json!({ "steps": [
        { "name": "node", "kind": "install",
          "check": { "path_exists": dir.path().join("missing").to_string_lossy() },
          "run": sh("echo started; sleep 30"),
          "fallback": touch(&fallback_marker) }
    ]}));

    let (tx, rx) = mpsc::channel();
    let mut sequencer = Sequencer::new(plan.into_steps().unwrap());
    sequencer.subscribe(tx);
    let handle = sequencer.spawn();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let event = rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .expect("install never started");
        if matches!(&event, SetupEvent::Progress { progress: ProgressEvent::Line(l), .. } if l == "started")
        {
            break;
        }
    }

    handle.cancel();
    let report = handle.join();
    assert!(report.cancelled);
    assert_eq!(report.outcome("node"), Some(Outcome::Failed));
    assert_eq!(report.get("node").unwrap().message, "cancelled");
    assert!(!fallback_marker.exists());
}

#[test]
fn test_inverted_check_skips_upgrade_of_missing_tool() {
    let dir = TempDir::new().unwrap();
    let upgraded = dir.path().join("upgraded");
    let plan = load(json!({ "steps": [
        { "name": "upgrade-missing", "kind": "install",
          "check": { "not": { "command_exists": "hostsetup-no-such-tool-42" } },
          "run": touch(&dir.path().join("never")) },
        { "name": "upgrade-sh", "kind": "install",
          "check": { "not": { "command_exists": "sh" } },
          "run": touch(&upgraded) }
    ]}));

    let (report, _) = run(&plan);
    assert_eq!(report.outcome("upgrade-missing"), Some(Outcome::Skipped));
    assert_eq!(
        report.get("upgrade-missing").unwrap().message,
        "hostsetup-no-such-tool-42 not installed"
    );
    assert!(!dir.path().join("never").exists());
    assert_eq!(report.outcome("upgrade-sh"), Some(Outcome::Done));
    assert!(upgraded.exists());
}

// =============================================================================
// Config and env steps
// =============================================================================

#[test]
fn test_config_step_skips_when_already_applied() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("openclaw.json");
    let plan = load(json!({
        "config_path": path.to_string_lossy(),
        "steps": [
            { "name": "config", "kind": "config",
              "set": { "gateway.mode": "local", "gateway.port": 18789 } }
        ]
    }));

    let (report, _) = run(&plan);
    assert_eq!(report.outcome("config"), Some(Outcome::Done));
    let first = fs::read(&path).unwrap();

    let (report, _) = run(&plan);
    assert_eq!(report.outcome("config"), Some(Outcome::Skipped));
    assert_eq!(report.get("config").unwrap().message, "configuration already up to date");
    assert_eq!(fs::read(&path).unwrap(), first);

    // Drift is repaired on the next run.
    fs::write(&path, r#"{"gateway":{"mode":"remote","port":18789}}"#).unwrap();
    let (report, _) = run(&plan);
    assert_eq!(report.outcome("config"), Some(Outcome::Done));
    assert_eq!(fs::read(&path).unwrap(), first);
}

#[test]
fn test_env_step_skips_when_line_present() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".env");
    let step = |value: &str| {
        load(json!({ "steps": [
            { "name": "api-key", "kind": "env", "path": path.to_string_lossy(),
              "key": "OPENAI_API_KEY", "value": value }
        ]}))
    };

    let (report, _) = run(&step("sk-1"));
    assert_eq!(report.outcome("api-key"), Some(Outcome::Done));

    let (report, _) = run(&step("sk-1"));
    assert_eq!(report.outcome("api-key"), Some(Outcome::Skipped));
    assert_eq!(report.get("api-key").unwrap().message, "environment entry already set");

    let (report, _) = run(&step("sk-2"));
    assert_eq!(report.outcome("api-key"), Some(Outcome::Done));
    assert_eq!(fs::read_to_string(&path).unwrap(), "OPENAI_API_KEY=sk-2\n");
}

// =============================================================================
// Model steps
// =============================================================================

#[test]
fn test_model_step_skips_when_listed() {
    let dir = TempDir::new().unwrap();
    let downloaded = dir.path().join("downloaded");
    let plan = load(json!({ "steps": [
        { "name": "model", "kind": "model", "query": "Qwen3-14B@q4_k_m",
          "list": sh("echo 'qwen3-14b    8.99 GB'"),
          "download": touch(&downloaded) }
    ]}));

    let (report, _) = run(&plan);
    assert_eq!(report.outcome("model"), Some(Outcome::Skipped));
    assert_eq!(
        report.get("model").unwrap().message,
        "Qwen3-14B@q4_k_m already downloaded"
    );
    assert!(!downloaded.exists());
}

#[test]
fn test_model_step_streams_download_progress() {
    let plan = load(json!({ "steps": [
        { "name": "model", "kind": "model", "query": "qwen3-14b@q4_k_m",
          "list": sh("echo 'some-other-model'"),
          "download": sh("echo 'Downloading qwen3-14b.gguf'; echo '50%'") }
    ]}));

    let (report, events) = run(&plan);
    assert_eq!(report.outcome("model"), Some(Outcome::Done));
    assert_eq!(report.get("model").unwrap().message, "qwen3-14b@q4_k_m downloaded");

    let progress: Vec<&ProgressEvent> = events
        .iter()
        .filter_map(|e| match e {
            SetupEvent::Progress { step, progress } if step == "model" => Some(progress),
            _ => None,
        })
        .collect();
    assert!(progress.contains(&&ProgressEvent::File("qwen3-14b.gguf".into())));
    assert!(progress.contains(&&ProgressEvent::Percent(0.5)));
}

// =============================================================================
// Detached scripts
// =============================================================================

#[test]
fn test_detached_script_skips_what_an_in_process_run_would() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("openclaw.json");
    let env = dir.path().join(".env");
    let plan = load(json!({
        "config_path": config.to_string_lossy(),
        "status_file": dir.path().join("status").to_string_lossy(),
        "marker_file": dir.path().join("done").to_string_lossy(),
        "steps": [
            { "name": "config", "kind": "config", "set": { "gateway.port": 18789 } },
            { "name": "api-key", "kind": "env", "path": env.to_string_lossy(),
              "key": "OPENAI_API_KEY", "value": "sk-1" }
        ]
    }));
    let channel = plan.channel();
    let blocks = plan.to_script_blocks(env!("CARGO_BIN_EXE_hostsetup")).unwrap();
    let script = dir.path().join("run.sh");
    write_script(&script, &render_script(&blocks, &channel)).unwrap();

    let run_script = || {
        channel.remove().unwrap();
        let status = std::process::Command::new("bash")
            .arg(&script)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
        fs::read_to_string(&channel.status_path).unwrap()
    };

    assert_eq!(run_script(), "config:OK\napi-key:OK\n");
    assert_eq!(run_script(), "config:SKIP\napi-key:SKIP\n");

    // The in-process run agrees.
    let (report, _) = run(&plan);
    assert_eq!(report.outcome("config"), Some(Outcome::Skipped));
    assert_eq!(report.outcome("api-key"), Some(Outcome::Skipped));
}
