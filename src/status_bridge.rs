//! Cross-process status bridge.
//!
//! Some runs have to happen in a process we do not manage, typically a new
//! terminal window the user can type a password into. That process reports
//! back through two files:
//!
//! - the **status channel**, append-only, one `component:STATE` line per
//!   finished phase
//! - the **completion marker**, created empty as the very last write
//!
//! [`StatusWatcher`] polls both. Each poll checks the marker *first* and only
//! then drains the channel, so every line written before the marker is seen
//! before completion is declared. Only newline-terminated lines are consumed
//! while the writer may still be running; a trailing partial line is picked up
//! once the marker exists. Consumed lines are counted and never re-emitted.
//!
//! The wait is bounded. When the deadline passes, every step still Pending is
//! marked TimedOut and both files are left where they are.

use crate::command::CommandSpec;
use crate::config_merge::write_atomic;
use crate::error::{Result, SetupError};
use crate::output_parser::ProgressEvent;
use crate::process_guard::CommandProcessGroup;
use crate::report::SequenceReport;
use crate::sequencer::{Observer, SetupEvent};
use crate::step::{Outcome, StepResult};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll cadence of the watcher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long a detached run may take before it is given up on.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Longest single sleep, so cancellation is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub const DEFAULT_STATUS_FILE: &str = "hostsetup_status";
pub const DEFAULT_MARKER_FILE: &str = "hostsetup_done";

/// State word on the right of `component:STATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Ok,
    Skip,
    Fail,
    Pending,
    /// Anything else; tolerated and passed through.
    Other(String),
}

impl ChannelState {
    /// The outcome this state settles, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Ok => Some(Outcome::Done),
            Self::Skip => Some(Outcome::Skipped),
            Self::Fail => Some(Outcome::Failed),
            Self::Pending | Self::Other(_) => None,
        }
    }
}

impl FromStr for ChannelState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim() {
            "OK" => Self::Ok,
            "SKIP" => Self::Skip,
            "FAIL" => Self::Fail,
            "PENDING" => Self::Pending,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Skip => write!(f, "SKIP"),
            Self::Fail => write!(f, "FAIL"),
            Self::Pending => write!(f, "PENDING"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<Outcome> for ChannelState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => Self::Ok,
            Outcome::Skipped => Self::Skip,
            Outcome::Failed => Self::Fail,
            Outcome::Pending => Self::Pending,
            Outcome::TimedOut => Self::Other(outcome.to_string()),
        }
    }
}

/// One `component:state` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub component: String,
    pub state: ChannelState,
}

impl StatusEntry {
    pub fn new(component: impl Into<String>, state: ChannelState) -> Self {
        Self {
            component: component.into(),
            state,
        }
    }

    /// Parse a trimmed line. The state is everything after the last `:`.
    pub fn parse(line: &str) -> Option<Self> {
        let (component, state) = line.trim().rsplit_once(':')?;
        let component = component.trim();
        if component.is_empty() {
            return None;
        }
        let state = match state.parse::<ChannelState>() {
            Ok(state) => state,
            Err(never) => match never {},
        };
        Some(Self::new(component, state))
    }
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.state)
    }
}

/// The pair of files a detached run talks through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChannel {
    pub status_path: PathBuf,
    pub marker_path: PathBuf,
}

impl Default for StatusChannel {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self::new(tmp.join(DEFAULT_STATUS_FILE), tmp.join(DEFAULT_MARKER_FILE))
    }
}

impl StatusChannel {
    pub fn new(status_path: impl Into<PathBuf>, marker_path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
            marker_path: marker_path.into(),
        }
    }

    /// Both files under `dir`, with the default names.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DEFAULT_STATUS_FILE), dir.join(DEFAULT_MARKER_FILE))
    }

    pub fn marker_exists(&self) -> bool {
        self.marker_path.exists()
    }

    /// Raw channel content; a missing file reads as empty.
    pub fn read(&self) -> Result<String> {
        match fs::read(&self.status_path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one record. Used by in-process writers and tests.
    pub fn append(&self, entry: &StatusEntry) -> Result<()> {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.status_path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }

    pub fn touch_marker(&self) -> Result<()> {
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.marker_path)?;
        Ok(())
    }

    /// Remove both files. Missing files are fine.
    pub fn remove(&self) -> Result<()> {
        for path in [&self.status_path, &self.marker_path] {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(SetupError::channel(format!(
                        "failed to remove {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Poll {
    /// One event per newly consumed, non-blank line.
    pub events: Vec<(String, ProgressEvent)>,
    /// The marker was seen and every line before it drained.
    pub complete: bool,
}

/// How a watch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    Completed(SequenceReport),
    TimedOut(SequenceReport),
    Cancelled,
}

impl WatchOutcome {
    pub fn report(&self) -> Option<&SequenceReport> {
        match self {
            Self::Completed(report) | Self::TimedOut(report) => Some(report),
            Self::Cancelled => None,
        }
    }
}

/// Polling cadence and deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WATCH_TIMEOUT,
        }
    }
}

/// Reconstructs step outcomes from a status channel.
#[derive(Debug)]
pub struct StatusWatcher {
    channel: StatusChannel,
    report: SequenceReport,
    consumed: usize,
    completed: bool,
}

impl StatusWatcher {
    /// Watch `channel`, starting from `report` (usually every step Pending).
    pub fn new(channel: StatusChannel, report: SequenceReport) -> Self {
        Self {
            channel,
            report,
            consumed: 0,
            completed: false,
        }
    }

    pub fn channel(&self) -> &StatusChannel {
        &self.channel
    }

    pub fn report(&self) -> &SequenceReport {
        &self.report
    }

    /// Lines consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Check the marker, drain new lines, update the local report.
    pub fn poll_once(&mut self) -> Result<Poll> {
        if self.completed {
            return Ok(Poll {
                events: Vec::new(),
                complete: true,
            });
        }

        let marker_seen = self.channel.marker_exists();
        let content = self.channel.read()?;

        let mut records: Vec<&str> = content.split('\n').collect();
        // The last piece is unterminated (or empty); it only counts once the
        // writer is known to be done.
        let tail = records.pop().unwrap_or_default();
        if marker_seen && !tail.trim().is_empty() {
            records.push(tail);
        }

        if records.len() < self.consumed {
            warn!(
                path = %self.channel.status_path.display(),
                had = self.consumed,
                now = records.len(),
                "status channel shrank, ignoring rewritten lines"
            );
            self.consumed = records.len();
        }

        let mut poll = Poll::default();
        for raw in &records[self.consumed..] {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let component = match StatusEntry::parse(line) {
                Some(entry) => {
                    self.apply(&entry);
                    entry.component
                }
                None => {
                    debug!(line, "unstructured status line");
                    String::new()
                }
            };
            poll.events
                .push((component, ProgressEvent::Line(line.to_string())));
        }
        self.consumed = records.len();

        if marker_seen {
            info!(consumed = self.consumed, "completion marker observed");
            self.completed = true;
            poll.complete = true;
        }
        Ok(poll)
    }

    fn apply(&mut self, entry: &StatusEntry) {
        let Some(outcome) = entry.state.outcome() else {
            debug!(component = %entry.component, state = %entry.state, "no outcome change");
            return;
        };
        if !self.report.contains(&entry.component) {
            debug!(component = %entry.component, "component not in plan, tracking it");
            self.report.add_step(entry.component.clone(), false);
        }
        let result = StepResult::new(outcome, format!("reported {}", entry.state));
        if let Err(e) = self.report.record(&entry.component, result) {
            warn!(error = %e, "ignoring status entry");
        }
    }

    /// Poll until the marker appears, the deadline passes or `cancel` is set.
    ///
    /// Each new line reaches `observer` as [`SetupEvent::Progress`]; completion
    /// and timeout both end with one [`SetupEvent::Finished`]. On completion
    /// the channel files are removed.
    pub fn watch(
        &mut self,
        observer: &mut dyn Observer,
        options: WatchOptions,
        cancel: &AtomicBool,
    ) -> Result<WatchOutcome> {
        let deadline = Instant::now() + options.timeout;
        info!(
            status = %self.channel.status_path.display(),
            marker = %self.channel.marker_path.display(),
            interval_ms = options.interval.as_millis() as u64,
            timeout_secs = options.timeout.as_secs(),
            "watching detached run"
        );

        loop {
            if cancel.load(Ordering::SeqCst) {
                info!("watch cancelled");
                return Ok(WatchOutcome::Cancelled);
            }

            let poll = self.poll_once()?;
            for (step, progress) in poll.events {
                observer.notify(&SetupEvent::Progress { step, progress });
            }

            if poll.complete {
                observer.notify(&SetupEvent::Finished {
                    report: self.report.clone(),
                });
                if let Err(e) = self.channel.remove() {
                    warn!(error = %e, "failed to clean up status channel");
                }
                info!(success = self.report.success, "detached run complete");
                return Ok(WatchOutcome::Completed(self.report.clone()));
            }

            if Instant::now() >= deadline {
                warn!(
                    timeout_secs = options.timeout.as_secs(),
                    "no completion marker before deadline"
                );
                self.report.time_out_pending(&format!(
                    "no completion marker within {}s",
                    options.timeout.as_secs()
                ));
                observer.notify(&SetupEvent::Finished {
                    report: self.report.clone(),
                });
                return Ok(WatchOutcome::TimedOut(self.report.clone()));
            }

            sleep_until_next_tick(options.interval, deadline, cancel);
        }
    }

    /// [`watch`](Self::watch) a run started from the generated `script`.
    ///
    /// The script can hold secrets (env values), so it is deleted once the run
    /// completes. A timed-out or cancelled run keeps it, like the channel files.
    pub fn watch_script(
        &mut self,
        script: &Path,
        observer: &mut dyn Observer,
        options: WatchOptions,
        cancel: &AtomicBool,
    ) -> Result<WatchOutcome> {
        let outcome = self.watch(observer, options, cancel)?;
        if matches!(outcome, WatchOutcome::Completed(_)) {
            match fs::remove_file(script) {
                Ok(()) => debug!(script = %script.display(), "removed detached script"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(script = %script.display(), error = %e, "failed to remove detached script"),
            }
        }
        Ok(outcome)
    }
}

fn sleep_until_next_tick(interval: Duration, deadline: Instant, cancel: &AtomicBool) {
    let wake = (Instant::now() + interval).min(deadline);
    while !cancel.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= wake {
            break;
        }
        thread::sleep((wake - now).min(SLEEP_SLICE));
    }
}

/// One guarded block of a detached script.
///
/// `check` and `actions` are shell fragments that are already quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlock {
    pub name: String,
    pub critical: bool,
    pub check: Option<String>,
    /// Tried in order until one succeeds.
    pub actions: Vec<String>,
}

impl ScriptBlock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            critical: false,
            check: None,
            actions: Vec::new(),
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }
}

/// Render a spec as one script line, including its env and working dir.
pub fn script_command(spec: &CommandSpec) -> String {
    let mut line = String::new();
    if !spec.env.is_empty() {
        line.push_str("env ");
        for (key, value) in &spec.env {
            line.push_str(&shell_words::quote(&format!("{}={}", key, value)));
            line.push(' ');
        }
    }
    line.push_str(&spec.to_shell_line());
    match &spec.cwd {
        Some(dir) => format!(
            "(cd {} && {})",
            shell_words::quote(&dir.to_string_lossy()),
            line
        ),
        None => line,
    }
}

/// Render a bash script that runs `blocks` in order and reports through
/// `channel`. A failed critical block stops the remaining blocks, which then
/// never report. Touching the marker is always the last statement.
pub fn render_script(blocks: &[ScriptBlock], channel: &StatusChannel) -> String {
    let quote = |p: &Path| shell_words::quote(&p.to_string_lossy()).into_owned();
    let mut out = String::new();
    out.push_str("#!/bin/bash\n");
    out.push_str("# Generated by hostsetup. Reports progress through the status channel.\n\n");
    out.push_str(&format!("STATUS_FILE={}\n", quote(&channel.status_path)));
    out.push_str(&format!("MARKER_FILE={}\n", quote(&channel.marker_path)));
    out.push_str("halted=0\n\n");
    out.push_str("report() { printf '%s:%s\\n' \"$1\" \"$2\" >> \"$STATUS_FILE\"; }\n");

    for block in blocks {
        let name = shell_words::quote(&block.name);
        out.push_str(&format!("\n# {}\n", block.name.replace('\n', " ")));
        out.push_str("if [ \"$halted\" -eq 0 ]; then\n");
        out.push_str(&format!("  echo \"==> {}\"\n", block.name.replace(['"', '\\', '$', '`', '\n'], "")));

        let mut branch = "if";
        if let Some(check) = &block.check {
            out.push_str(&format!("  {} {}; then\n", branch, check));
            out.push_str(&format!("    report {} SKIP\n", name));
            branch = "elif";
        }
        let actions = if block.actions.is_empty() {
            "true".to_string()
        } else {
            block.actions.join(" || ")
        };
        out.push_str(&format!("  {} {}; then\n", branch, actions));
        out.push_str(&format!("    report {} OK\n", name));
        out.push_str("  else\n");
        out.push_str(&format!("    report {} FAIL\n", name));
        if block.critical {
            out.push_str("    halted=1\n");
        }
        out.push_str("  fi\n");
        out.push_str("fi\n");
    }

    out.push_str("\ntouch \"$MARKER_FILE\"\n");
    out
}

/// Write `script` to `path` with mode 0700.
pub fn write_script(path: &Path, script: &str) -> Result<()> {
    write_atomic(path, script.as_bytes(), true)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// The launcher used when none is given.
pub fn default_launcher() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["open".into(), "-a".into(), "Terminal".into()]
    } else {
        vec!["setsid".into()]
    }
}

/// Start `launcher... script` in its own session and return without waiting.
///
/// The process is deliberately not tracked by the child registry: it must
/// outlive us, and its only link back is the status channel.
pub fn launch_detached(launcher: &[String], script: &Path) -> Result<()> {
    let (program, args) = launcher
        .split_first()
        .ok_or_else(|| SetupError::spawn("empty launcher command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .in_new_session();

    let mut child = cmd
        .spawn()
        .map_err(|e| SetupError::spawn(format!("failed to launch `{}`: {}", program, e)))?;
    info!(launcher = %program, script = %script.display(), pid = child.id(), "detached run launched");

    // Reap the launcher itself; whatever it started keeps running.
    thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}
