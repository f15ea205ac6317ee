//! Step sequencer.
//!
//! Runs steps strictly in declaration order. Later steps may depend on the
//! effects of earlier ones (a precondition can check for a tool an earlier
//! step installed); ordering is the only dependency mechanism.
//!
//! For each step the sequencer publishes `StepStarted`, any progress the step
//! produces, then `StepFinished`, before touching the next step. A failed
//! critical step halts the run; remaining steps stay Pending in the report. A
//! failed non-critical step is recorded and the run continues. The sequencer
//! never retries.
//!
//! Observers are registered explicitly on the sequencer; there is no global
//! status state.

use crate::executor::Executor;
use crate::output_parser::ProgressEvent;
use crate::report::SequenceReport;
use crate::step::{CANCELLED, Step, StepContext, StepResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Everything an observer can see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SetupEvent {
    StepStarted {
        step: String,
    },
    Progress {
        step: String,
        progress: ProgressEvent,
    },
    StepFinished {
        step: String,
        critical: bool,
        result: StepResult,
    },
    Finished {
        report: SequenceReport,
    },
}

/// Receives [`SetupEvent`]s in publication order.
pub trait Observer: Send {
    fn notify(&mut self, event: &SetupEvent);
}

/// Forward events to a channel; the receiver's thread becomes the delivery context.
impl Observer for Sender<SetupEvent> {
    fn notify(&mut self, event: &SetupEvent) {
        let _ = self.send(event.clone());
    }
}

/// Closure observer built by [`observer_fn`].
pub struct FnObserver<F>(F);

pub fn observer_fn<F>(f: F) -> FnObserver<F>
where
    F: FnMut(&SetupEvent) + Send,
{
    FnObserver(f)
}

impl<F> Observer for FnObserver<F>
where
    F: FnMut(&SetupEvent) + Send,
{
    fn notify(&mut self, event: &SetupEvent) {
        (self.0)(event)
    }
}

/// Fan-out to registered observers.
#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<Box<dyn Observer>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: impl Observer + 'static) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(Box::new(observer));
        }
    }

    pub fn publish(&self, event: SetupEvent) {
        if let Ok(mut observers) = self.observers.lock() {
            for observer in observers.iter_mut() {
                observer.notify(&event);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancels a running sequence: terminates the active subprocess, refuses any
/// further spawn, and stops before the next step.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    executor: Executor,
}

impl CancelToken {
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("sequence cancellation requested");
        }
        self.executor.halt();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Ordered list of steps plus observers.
pub struct Sequencer {
    steps: Vec<Step>,
    bus: EventBus,
    executor: Executor,
    cancelled: Arc<AtomicBool>,
}

impl Sequencer {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            bus: EventBus::new(),
            executor: Executor::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn subscribe(&mut self, observer: impl Observer + 'static) {
        self.bus.subscribe(observer);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.cancelled),
            executor: self.executor.clone(),
        }
    }

    /// Run every step in order and return the final report.
    pub fn run(&mut self) -> SequenceReport {
        let mut report = SequenceReport::new(
            self.steps
                .iter()
                .map(|s| (s.name().to_string(), s.is_critical())),
        );
        info!(steps = self.steps.len(), "starting sequence");

        for step in &self.steps {
            if self.cancelled.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }

            let name = step.name();
            self.bus.publish(SetupEvent::StepStarted {
                step: name.to_string(),
            });

            let bus = &self.bus;
            let emit = |progress: ProgressEvent| {
                bus.publish(SetupEvent::Progress {
                    step: name.to_string(),
                    progress,
                });
            };
            let ctx = StepContext::new(name, &self.executor, &emit);
            let mut result = step.execute(&ctx);

            if self.cancelled.load(Ordering::SeqCst) {
                report.cancelled = true;
                if result.outcome.is_failure() {
                    result = StepResult::failed(CANCELLED);
                }
            }

            info!(step = %name, outcome = %result.outcome, critical = step.is_critical(), "step finished");
            if let Err(e) = report.record(name, result.clone()) {
                error!(error = %e, "step result rejected");
            }

            self.bus.publish(SetupEvent::StepFinished {
                step: name.to_string(),
                critical: step.is_critical(),
                result: result.clone(),
            });

            if report.cancelled {
                break;
            }
            if step.is_critical() && result.outcome.is_failure() {
                warn!(step = %name, "critical step failed, halting sequence");
                report.halted_by = Some(name.to_string());
                break;
            }
        }

        info!(success = report.success, cancelled = report.cancelled, "sequence finished");
        self.bus.publish(SetupEvent::Finished {
            report: report.clone(),
        });
        report
    }

    /// Run on a background thread.
    pub fn spawn(mut self) -> SequenceHandle {
        let cancel = self.cancel_token();
        let worker = thread::Builder::new()
            .name("sequencer".into())
            .spawn(move || self.run());
        SequenceHandle { worker, cancel }
    }
}

/// Handle to a sequence running on a background thread.
pub struct SequenceHandle {
    worker: std::io::Result<JoinHandle<SequenceReport>>,
    cancel: CancelToken,
}

impl SequenceHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Ok(handle) => handle.is_finished(),
            Err(_) => true,
        }
    }

    /// Wait for the final report.
    ///
    /// If the worker could not be started or died, an empty failed report is
    /// returned rather than an error.
    pub fn join(self) -> SequenceReport {
        let fallback = |msg: &str| {
            error!("{msg}");
            let mut report = SequenceReport::new(std::iter::empty::<(String, bool)>());
            report.success = false;
            report
        };
        match self.worker {
            Ok(handle) => match handle.join() {
                Ok(report) => report,
                Err(_) => fallback("sequencer thread panicked"),
            },
            Err(e) => fallback(&format!("failed to start sequencer thread: {e}")),
        }
    }
}
