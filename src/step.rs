//! Steps and outcomes.
//!
//! A [`Step`] is a named, idempotent unit of work: an optional precondition
//! ("is this already satisfied?") and an action. Running a step always yields
//! a [`StepResult`]; errors and panics from either closure are caught here and
//! become [`Outcome::Failed`].
//!
//! # Outcome flow
//!
//! ```text
//! Pending ──precondition true──▶ Skipped
//!    │
//!    └──precondition false──▶ action ──▶ Done | Failed
//!
//! (the status bridge may also assign TimedOut)
//! ```
//!
//! Transitions are monotonic within one run: once a step leaves `Pending` its
//! outcome never changes. [`Outcome::transition`] enforces this.

use crate::command::CommandSpec;
use crate::executor::{CommandOutput, Executor};
use crate::output_parser::{OutputParser, ProgressEvent};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use strum::Display;
use thiserror::Error;
use tracing::{debug, warn};

/// Classification of a step's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Not run yet (or never reached).
    #[strum(to_string = "PENDING")]
    Pending,
    /// The action ran and succeeded.
    #[strum(to_string = "OK")]
    Done,
    /// The precondition reported the work already satisfied.
    #[strum(to_string = "SKIP")]
    Skipped,
    /// The action ran and failed.
    #[strum(to_string = "FAIL")]
    Failed,
    /// A detached run never reported this step before the watch deadline.
    #[strum(to_string = "TIMEOUT")]
    TimedOut,
}

impl Outcome {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Done or Skipped.
    #[inline]
    pub const fn is_satisfied(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    /// Failed or TimedOut.
    #[inline]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Validate a transition of `step` from `self` to `to`.
    pub fn transition(self, step: &str, to: Outcome) -> Result<Outcome, OutcomeTransitionError> {
        if self.is_terminal() {
            return Err(OutcomeTransitionError::AlreadyTerminal {
                step: step.to_string(),
                from: self,
                to,
            });
        }
        if !to.is_terminal() {
            return Err(OutcomeTransitionError::BackToPending {
                step: step.to_string(),
            });
        }
        Ok(to)
    }
}

/// Errors from invalid outcome transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutcomeTransitionError {
    /// The step already has a terminal outcome.
    #[error("Step '{step}' is already {from}, cannot become {to}")]
    AlreadyTerminal { step: String, from: Outcome, to: Outcome },

    /// A step cannot be moved (back) to Pending.
    #[error("Step '{step}' cannot transition to PENDING")]
    BackToPending { step: String },

    /// No step with that name exists in the report.
    #[error("Unknown step '{step}'")]
    UnknownStep { step: String },
}

/// Message of a step stopped by cancellation.
pub const CANCELLED: &str = "cancelled";

/// An outcome plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub outcome: Outcome,
    pub message: String,
}

impl StepResult {
    pub fn new(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }

    pub fn pending() -> Self {
        Self::new(Outcome::Pending, "")
    }

    pub fn done(message: impl Into<String>) -> Self {
        Self::new(Outcome::Done, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(Outcome::Skipped, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Outcome::Failed, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(Outcome::TimedOut, message)
    }

    /// Done with `done_message` on success, otherwise Failed carrying the
    /// captured output.
    pub fn from_output(output: &CommandOutput, done_message: impl Into<String>) -> Self {
        if output.success() {
            Self::done(done_message)
        } else if output.cancelled {
            Self::failed(CANCELLED)
        } else if output.output.is_empty() {
            Self::failed(format!("exited with code {}", output.exit_code))
        } else {
            Self::failed(output.output.clone())
        }
    }
}

/// What a running step can reach: the executor and the progress channel.
pub struct StepContext<'a> {
    step: &'a str,
    executor: &'a Executor,
    emit: &'a dyn Fn(ProgressEvent),
}

impl<'a> StepContext<'a> {
    pub fn new(step: &'a str, executor: &'a Executor, emit: &'a dyn Fn(ProgressEvent)) -> Self {
        Self {
            step,
            executor,
            emit,
        }
    }

    pub fn step_name(&self) -> &str {
        self.step
    }

    pub fn executor(&self) -> &Executor {
        self.executor
    }

    /// The run was cancelled; commands started from here will not run.
    pub fn is_cancelled(&self) -> bool {
        self.executor.is_halted()
    }

    /// Run a command, publishing its lines and extracted progress.
    pub fn run(&self, spec: &CommandSpec) -> CommandOutput {
        let mut parser = OutputParser::new();
        let output = self.executor.run_with_lines(spec, |line| {
            let mut chunk = line.as_bytes().to_vec();
            chunk.push(b'\n');
            for event in parser.feed(&chunk) {
                (self.emit)(event);
            }
        });
        for event in parser.finish() {
            (self.emit)(event);
        }
        output
    }

    /// Run a command without publishing anything (version lookups, checks).
    pub fn run_quiet(&self, spec: &CommandSpec) -> CommandOutput {
        self.executor.run(spec)
    }

    /// Publish an arbitrary progress event.
    pub fn progress(&self, event: ProgressEvent) {
        (self.emit)(event)
    }
}

pub type Precondition = Box<dyn Fn(&StepContext<'_>) -> anyhow::Result<bool> + Send>;
pub type Action = Box<dyn Fn(&StepContext<'_>) -> anyhow::Result<StepResult> + Send>;

/// A named unit of work.
pub struct Step {
    name: String,
    critical: bool,
    precondition: Option<(Precondition, String)>,
    action: Action,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .field("has_precondition", &self.precondition.is_some())
            .finish()
    }
}

impl Step {
    /// Non-critical step with no precondition.
    pub fn new<A>(name: impl Into<String>, action: A) -> Self
    where
        A: Fn(&StepContext<'_>) -> anyhow::Result<StepResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            critical: false,
            precondition: None,
            action: Box::new(action),
        }
    }

    /// Step whose action is a single command.
    pub fn command(name: impl Into<String>, spec: CommandSpec, done_message: impl Into<String>) -> Self {
        let done_message = done_message.into();
        Self::new(name, move |ctx| Ok(StepResult::from_output(&ctx.run(&spec), done_message.clone())))
    }

    /// Mark the step critical: its failure halts the sequence.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Skip the action, with `message`, when `check` returns true.
    pub fn skip_if<P>(mut self, check: P, message: impl Into<String>) -> Self
    where
        P: Fn(&StepContext<'_>) -> anyhow::Result<bool> + Send + 'static,
    {
        self.precondition = Some((Box::new(check), message.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Evaluate the precondition, then the action if needed. Never fails.
    ///
    /// A cancelled run never reaches the action: a precondition interrupted by
    /// cancellation reads as Failed "cancelled", not as "not satisfied".
    pub fn execute(&self, ctx: &StepContext<'_>) -> StepResult {
        if ctx.is_cancelled() {
            return StepResult::failed(CANCELLED);
        }

        if let Some((check, message)) = &self.precondition {
            let checked = guarded(|| check(ctx));
            if ctx.is_cancelled() {
                debug!(step = %self.name, "cancelled during precondition");
                return StepResult::failed(CANCELLED);
            }
            match checked {
                Ok(true) => {
                    debug!(step = %self.name, "precondition satisfied");
                    return StepResult::skipped(message.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(step = %self.name, error = %e, "precondition check failed");
                    return StepResult::failed(format!("precondition check failed: {e:#}"));
                }
            }
        }

        match guarded(|| (self.action)(ctx)) {
            Ok(result) if result.outcome.is_terminal() => result,
            Ok(_) => StepResult::failed("action finished without an outcome"),
            Err(e) => {
                warn!(step = %self.name, error = %e, "action failed");
                StepResult::failed(format!("{e:#}"))
            }
        }
    }
}

/// Run `f`, turning a panic into an error.
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("panicked: {msg}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn with_ctx<T>(f: impl FnOnce(&StepContext<'_>) -> T) -> T {
        let executor = Executor::new();
        let emit = |_e: ProgressEvent| {};
        let ctx = StepContext::new("test", &executor, &emit);
        f(&ctx)
    }

    #[test]
    fn test_outcome_display_matches_channel_vocabulary() {
        assert_eq!(Outcome::Pending.to_string(), "PENDING");
        assert_eq!(Outcome::Done.to_string(), "OK");
        assert_eq!(Outcome::Skipped.to_string(), "SKIP");
        assert_eq!(Outcome::Failed.to_string(), "FAIL");
        assert_eq!(Outcome::TimedOut.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_transition_from_pending() {
        assert_eq!(Outcome::Pending.transition("node", Outcome::Done), Ok(Outcome::Done));
        assert_eq!(Outcome::Pending.transition("node", Outcome::Skipped), Ok(Outcome::Skipped));
    }

    #[test]
    fn test_transition_is_monotonic() {
        let err = Outcome::Done.transition("node", Outcome::Done).unwrap_err();
        assert!(matches!(err, OutcomeTransitionError::AlreadyTerminal { .. }));

        let err = Outcome::Pending.transition("node", Outcome::Pending).unwrap_err();
        assert!(matches!(err, OutcomeTransitionError::BackToPending { .. }));
    }

    #[test]
    fn test_transition_error_display() {
        let err = Outcome::Failed.transition("config", Outcome::Done).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("config"));
        assert!(msg.contains("FAIL"));
        assert!(msg.contains("OK"));
    }

    #[test]
    fn test_satisfied_precondition_skips_action() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let step = Step::new("brew", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::done("installed"))
        })
        .skip_if(|_| Ok(true), "Homebrew already installed");

        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Skipped);
        assert_eq!(result.message, "Homebrew already installed");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_action_error_becomes_failed() {
        let step = Step::new("config", |_| anyhow::bail!("disk full"));
        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.message.contains("disk full"));
    }

    #[test]
    fn test_action_panic_becomes_failed() {
        let step = Step::new("boom", |_| panic!("unexpected state"));
        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.message.contains("unexpected state"));
    }

    #[test]
    fn test_precondition_error_becomes_failed() {
        let step = Step::new("x", |_| Ok(StepResult::done("ran")))
            .skip_if(|_| anyhow::bail!("check crashed"), "never");
        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.message.contains("check crashed"));
    }

    #[test]
    fn test_pending_from_action_is_rejected() {
        let step = Step::new("x", |_| Ok(StepResult::pending()));
        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Failed);
    }

    #[test]
    fn test_cancelled_context_skips_precondition_and_action() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (c1, c2) = (Arc::clone(&calls), Arc::clone(&calls));
        let step = Step::new("node", move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::done("installed"))
        })
        .skip_if(
            move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
            "never",
        );

        let executor = Executor::new();
        executor.halt();
        let emit = |_e: ProgressEvent| {};
        let ctx = StepContext::new("node", &executor, &emit);

        let result = step.execute(&ctx);
        assert_eq!(result, StepResult::failed(CANCELLED));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_during_precondition_never_runs_action() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let step = Step::new("node", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepResult::done("installed"))
        })
        .skip_if(
            |ctx| {
                // Cancelled mid-check: the interrupted command reads as "not installed".
                ctx.executor().halt();
                Ok(false)
            },
            "never",
        );

        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.message, CANCELLED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_command_step_carries_output_on_failure() {
        let spec = CommandSpec::direct("sh").args(["-c", "echo 'Error: no such formula'; exit 1"]);
        let step = Step::command("node", spec, "Node installed");
        let result = with_ctx(|ctx| step.execute(ctx));
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.message, "Error: no such formula");
    }

    #[test]
    fn test_context_run_publishes_progress() {
        use std::sync::Mutex;
        let seen = Mutex::new(Vec::new());
        let executor = Executor::new();
        let emit = |e: ProgressEvent| seen.lock().unwrap().push(e);
        let ctx = StepContext::new("model", &executor, &emit);

        let spec = CommandSpec::direct("sh").args(["-c", "echo 'Downloading model.gguf'; echo '45%'"]);
        assert!(ctx.run(&spec).success());

        let seen = seen.into_inner().unwrap();
        assert!(seen.contains(&ProgressEvent::File("model.gguf".into())));
        assert!(seen.contains(&ProgressEvent::Percent(0.45)));
    }
}
