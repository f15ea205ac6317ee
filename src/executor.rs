//! Command execution.
//!
//! [`Executor`] spawns one external command at a time per call and reports
//! combined stdout/stderr plus an exit code. It never returns an error: a
//! command that cannot be started produces a synthetic failing
//! [`CommandOutput`] with exit code 127.
//!
//! Three entry points share one implementation:
//!
//! - [`Executor::run`] blocks and captures everything.
//! - [`Executor::run_with_lines`] blocks, but hands each line to a callback on
//!   the calling thread as soon as it is complete.
//! - [`Executor::run_streaming`] returns immediately; a worker thread delivers
//!   lines and the exit code to an [`OutputSink`]. Delivery is serialised
//!   because the worker owns the sink. Passing an `mpsc::Sender<ExecEvent>` as
//!   the sink marshals delivery to whichever thread owns the receiver.

use crate::command::CommandSpec;
use crate::output_parser::LineParser;
use crate::process_guard::{self, ChildRegistry, DEFAULT_GRACE_PERIOD};
use std::collections::VecDeque;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit code reported when a command could not be spawned.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Lines kept in [`CommandOutput::output`]; older lines are dropped.
const MAX_CAPTURED_LINES: usize = 5_000;

const READ_CHUNK: usize = 4096;

/// Exit code of a command refused after [`Executor::halt`], as if it had been
/// terminated by SIGTERM.
const REFUSED_EXIT_CODE: i32 = 128 + 15;

/// Result of one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `128 + signal` when killed by a signal.
    pub exit_code: i32,
    /// Interleaved stdout/stderr lines, joined with `\n`.
    pub output: String,
    /// The process never started.
    pub spawn_failed: bool,
    /// The process was terminated through [`Executor::cancel`].
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.spawn_failed && !self.cancelled
    }

    fn spawn_failure(spec: &CommandSpec, err: &std::io::Error) -> Self {
        Self {
            exit_code: SPAWN_FAILURE_CODE,
            output: format!("Failed to start `{}`: {}", spec.program, err),
            spawn_failed: true,
            cancelled: false,
        }
    }

    /// The executor was halted before this command could start.
    fn refused(spec: &CommandSpec) -> Self {
        Self {
            exit_code: REFUSED_EXIT_CODE,
            output: format!("`{}` not started: execution was cancelled", spec.program),
            spawn_failed: false,
            cancelled: true,
        }
    }

    /// First output line, handy for `--version` output.
    pub fn first_line(&self) -> Option<&str> {
        self.output.lines().next()
    }
}

/// Event delivered by a streaming invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Line(String),
    Exit(i32),
}

/// Receiver of streamed output. `on_exit` is called exactly once, last.
pub trait OutputSink: Send + 'static {
    fn on_line(&mut self, line: String);
    fn on_exit(&mut self, code: i32);
}

impl OutputSink for Sender<ExecEvent> {
    fn on_line(&mut self, line: String) {
        let _ = self.send(ExecEvent::Line(line));
    }

    fn on_exit(&mut self, code: i32) {
        let _ = self.send(ExecEvent::Exit(code));
    }
}

/// Closure-pair sink built by [`sink_fn`].
pub struct FnSink<L, E> {
    on_line: L,
    on_exit: E,
}

/// Build an [`OutputSink`] from two closures.
pub fn sink_fn<L, E>(on_line: L, on_exit: E) -> FnSink<L, E>
where
    L: FnMut(String) + Send + 'static,
    E: FnMut(i32) + Send + 'static,
{
    FnSink { on_line, on_exit }
}

impl<L, E> OutputSink for FnSink<L, E>
where
    L: FnMut(String) + Send + 'static,
    E: FnMut(i32) + Send + 'static,
{
    fn on_line(&mut self, line: String) {
        (self.on_line)(line)
    }

    fn on_exit(&mut self, code: i32) {
        (self.on_exit)(code)
    }
}

#[derive(Debug, Default)]
struct ActiveProcess {
    pid: Option<u32>,
    cancelled_pid: Option<u32>,
    /// Set by [`Executor::halt`]; nothing spawns afterwards.
    halted: bool,
}

/// Spawns commands and tracks the most recent one for cancellation.
///
/// Cloning is cheap; clones share the cancellation target.
#[derive(Debug, Clone)]
pub struct Executor {
    active: Arc<Mutex<ActiveProcess>>,
    grace_period: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(ActiveProcess::default())),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Override the SIGTERM-to-SIGKILL grace period used by [`cancel`](Self::cancel).
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Run to completion and capture output.
    pub fn run(&self, spec: &CommandSpec) -> CommandOutput {
        self.run_with_lines(spec, |_| {})
    }

    /// Run to completion, calling `on_line` for each line as it arrives.
    pub fn run_with_lines<F>(&self, spec: &CommandSpec, mut on_line: F) -> CommandOutput
    where
        F: FnMut(&str),
    {
        if self.is_halted() {
            info!(command = %spec, "executor halted, not spawning");
            return CommandOutput::refused(spec);
        }

        info!(command = %spec, "spawning");
        let mut child = match spec.to_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %spec, error = %e, "spawn failed");
                return CommandOutput::spawn_failure(spec, &e);
            }
        };

        let pid = child.id();
        if !self.set_active(pid) {
            // Halted between the check above and the spawn.
            info!(pid, "executor halted during spawn, terminating");
            let grace = self.grace_period;
            thread::spawn(move || {
                process_guard::terminate_group(pid, grace);
            });
        }
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone()));
        }
        drop(tx);

        let mut captured: VecDeque<String> = VecDeque::new();
        for line in rx {
            on_line(&line);
            if captured.len() == MAX_CAPTURED_LINES {
                captured.pop_front();
            }
            captured.push_back(line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        let exit_code = match child.wait() {
            Ok(status) => status
                .code()
                .or_else(|| status.signal().map(|sig| 128 + sig))
                .unwrap_or(-1),
            Err(e) => {
                warn!(pid, error = %e, "failed waiting for child");
                -1
            }
        };

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }
        let cancelled = self.clear_active(pid);

        info!(pid, exit_code, cancelled, "process exited");
        CommandOutput {
            exit_code,
            output: Vec::from(captured).join("\n"),
            spawn_failed: false,
            cancelled,
        }
    }

    /// Run on a worker thread, streaming to `sink`.
    pub fn run_streaming<S: OutputSink>(&self, spec: CommandSpec, mut sink: S) -> StreamHandle {
        let executor = self.clone();
        let worker = thread::spawn(move || {
            let output = executor.run_with_lines(&spec, |line| sink.on_line(line.to_string()));
            sink.on_exit(output.exit_code);
            output
        });
        StreamHandle {
            worker,
            executor: self.clone(),
        }
    }

    /// Terminate the most recently spawned process, if it is still running.
    ///
    /// Returns immediately; escalation to SIGKILL happens in the background.
    pub fn cancel(&self) {
        let pid = match self.active.lock() {
            Ok(mut active) => match active.pid {
                Some(pid) => {
                    active.cancelled_pid = Some(pid);
                    pid
                }
                None => {
                    debug!("cancel requested with no active process");
                    return;
                }
            },
            Err(_) => return,
        };

        info!(pid, "cancelling active process");
        let grace = self.grace_period;
        thread::spawn(move || {
            process_guard::terminate_group(pid, grace);
        });
    }

    /// Cancel the active process and refuse every later spawn.
    ///
    /// Commands started through this executor (or any clone) after the call
    /// return a cancelled [`CommandOutput`] without running.
    pub fn halt(&self) {
        match self.active.lock() {
            Ok(mut active) => {
                if active.halted {
                    return;
                }
                active.halted = true;
            }
            Err(_) => return,
        }
        info!("executor halted");
        self.cancel();
    }

    pub fn is_halted(&self) -> bool {
        self.active.lock().map(|a| a.halted).unwrap_or(false)
    }

    /// PID of the most recently spawned, still running process.
    pub fn active_pid(&self) -> Option<u32> {
        self.active.lock().ok().and_then(|a| a.pid)
    }

    /// Record `pid` as active. Returns false if the executor was halted, in
    /// which case `pid` is marked cancelled and must be terminated.
    fn set_active(&self, pid: u32) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return true;
        };
        active.pid = Some(pid);
        if active.halted {
            active.cancelled_pid = Some(pid);
            return false;
        }
        true
    }

    /// Clear `pid` if it is still the active one; report whether it was cancelled.
    fn clear_active(&self, pid: u32) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return false;
        };
        if active.pid == Some(pid) {
            active.pid = None;
        }
        if active.cancelled_pid == Some(pid) {
            active.cancelled_pid = None;
            return true;
        }
        false
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut parser = LineParser::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in parser.feed(&buf[..n]) {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "output pipe read failed");
                    break;
                }
            }
        }
        if let Some(line) = parser.finish() {
            let _ = tx.send(line);
        }
    })
}

/// Handle to a streaming invocation.
pub struct StreamHandle {
    worker: JoinHandle<CommandOutput>,
    executor: Executor,
}

impl StreamHandle {
    /// Wait for the process and the sink's `on_exit` to finish.
    pub fn join(self) -> CommandOutput {
        self.worker.join().unwrap_or_else(|_| CommandOutput {
            exit_code: -1,
            output: "output sink panicked".to_string(),
            spawn_failed: false,
            cancelled: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn cancel(&self) {
        self.executor.cancel();
    }
}
