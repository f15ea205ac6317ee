//! hostsetup library
//!
//! An installation/configuration orchestrator: ordered, idempotent steps run
//! against the host, with live progress for observers and a final report.
//! Steps either run in-process through the [`Sequencer`] or are handed to a
//! detached process whose progress comes back through the status channel.

pub mod cli;
pub mod command;
pub mod config_merge;
pub mod error;
pub mod executor;
pub mod output_parser;
pub mod plan;
pub mod probe;
pub mod process_guard;
pub mod recommend;
pub mod report;
pub mod sequencer;
pub mod status_bridge;
pub mod step;

// Re-export main types for convenience
pub use command::CommandSpec;
pub use config_merge::{ConfigDocument, KeyPath};
pub use error::{Result, SetupError};
pub use executor::{CommandOutput, ExecEvent, Executor, OutputSink, StreamHandle, sink_fn};
pub use output_parser::{LineParser, OutputParser, ProgressEvent, ProgressTracker};
pub use plan::PlanFile;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use report::{ReportEntry, SequenceReport};
pub use sequencer::{CancelToken, Observer, SequenceHandle, Sequencer, SetupEvent, observer_fn};
pub use status_bridge::{
    ChannelState, StatusChannel, StatusEntry, StatusWatcher, WatchOptions, WatchOutcome,
};
pub use step::{Outcome, OutcomeTransitionError, Step, StepContext, StepResult};
