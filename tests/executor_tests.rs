//! Tests for command execution
//!
//! These tests spawn real `sh` processes and verify:
//! - Lines are delivered as they are produced, not batched at exit
//! - Streaming delivery through a channel and through closures
//! - Cancellation terminates the whole process group
//! - Spawn failures become synthetic results

use hostsetup::command::CommandSpec;
use hostsetup::executor::{ExecEvent, Executor, SPAWN_FAILURE_CODE, sink_fn};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn sh(script: &str) -> CommandSpec {
    CommandSpec::direct("sh").args(["-c", script])
}

// =============================================================================
// Blocking runs
// =============================================================================

#[test]
fn test_lines_arrive_before_exit() {
    let started = Instant::now();
    let mut first_line_at = None;
    let out = Executor::new().run_with_lines(&sh("echo first; sleep 1; echo second"), |line| {
        if line == "first" && first_line_at.is_none() {
            first_line_at = Some(started.elapsed());
        }
    });

    assert!(out.success());
    let first = first_line_at.expect("first line seen");
    assert!(first < Duration::from_millis(900), "first line took {:?}", first);
}

#[test]
fn test_login_shell_runs_program() {
    let out = Executor::new().run(&CommandSpec::new("echo").arg("through login shell"));
    assert!(out.success());
    assert!(out.output.ends_with("through login shell"));
}

#[test]
fn test_env_and_cwd_are_applied() {
    let dir = tempfile::TempDir::new().unwrap();
    let spec = sh("printf '%s %s\\n' \"$HOSTSETUP_TEST\" \"$(pwd)\"")
        .env("HOSTSETUP_TEST", "value")
        .cwd(dir.path());
    let out = Executor::new().run(&spec);
    assert!(out.success());
    assert!(out.output.starts_with("value "));
}

#[test]
fn test_signal_exit_code() {
    let out = Executor::new().run(&sh("kill -TERM $$"));
    assert_eq!(out.exit_code, 128 + 15);
    assert!(!out.success());
}

#[test]
fn test_spawn_failure_never_panics() {
    let out = Executor::new().run(&CommandSpec::direct("/nonexistent/tool"));
    assert!(out.spawn_failed);
    assert_eq!(out.exit_code, SPAWN_FAILURE_CODE);
    assert!(out.output.contains("/nonexistent/tool"));
}

// =============================================================================
// Streaming runs
// =============================================================================

#[test]
fn test_streaming_to_channel() {
    let (tx, rx) = mpsc::channel();
    let handle = Executor::new().run_streaming(sh("echo one; echo two >&2; exit 4"), tx);

    let events: Vec<ExecEvent> = rx.iter().collect();
    let out = handle.join();

    assert_eq!(out.exit_code, 4);
    assert_eq!(events.last(), Some(&ExecEvent::Exit(4)));
    let exits = events.iter().filter(|e| matches!(e, ExecEvent::Exit(_))).count();
    assert_eq!(exits, 1);
    assert!(events.contains(&ExecEvent::Line("one".into())));
    assert!(events.contains(&ExecEvent::Line("two".into())));
}

#[test]
fn test_streaming_to_closures() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let exit = Arc::new(Mutex::new(None));
    let (l, e) = (Arc::clone(&lines), Arc::clone(&exit));

    let handle = Executor::new().run_streaming(
        sh("printf 'a\\nb\\npartial'"),
        sink_fn(
            move |line| l.lock().unwrap().push(line),
            move |code| *e.lock().unwrap() = Some(code),
        ),
    );
    handle.join();

    assert_eq!(*lines.lock().unwrap(), vec!["a", "b", "partial"]);
    assert_eq!(*exit.lock().unwrap(), Some(0));
}

#[test]
fn test_streaming_spawn_failure_still_calls_on_exit() {
    let (tx, rx) = mpsc::channel();
    let handle = Executor::new().run_streaming(CommandSpec::direct("/nonexistent/tool"), tx);
    handle.join();
    let events: Vec<ExecEvent> = rx.iter().collect();
    assert_eq!(events, vec![ExecEvent::Exit(SPAWN_FAILURE_CODE)]);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_terminates_streaming_process() {
    let executor = Executor::new().with_grace_period(Duration::from_millis(500));
    let (tx, rx) = mpsc::channel();
    let handle = executor.run_streaming(sh("echo ready; sleep 30"), tx);

    // Wait until the process is up.
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        ExecEvent::Line("ready".into())
    );

    let started = Instant::now();
    handle.cancel();
    let out = handle.join();

    assert!(out.cancelled);
    assert!(!out.success());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(executor.active_pid(), None);
}

#[test]
fn test_cancel_reaches_grandchildren() {
    let executor = Executor::new().with_grace_period(Duration::from_millis(500));
    let (tx, rx) = mpsc::channel();
    // The inner sleep holds the pipe open; the run only ends if it dies too.
    let handle = executor.run_streaming(sh("sh -c 'sleep 30' & echo spawned; wait"), tx);

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        ExecEvent::Line("spawned".into())
    );

    let started = Instant::now();
    executor.cancel();
    let out = handle.join();
    assert!(out.cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_cancel_after_exit_is_noop() {
    let executor = Executor::new();
    let out = executor.run(&sh("exit 0"));
    executor.cancel();
    assert!(out.success());
    assert!(!out.cancelled);
}
