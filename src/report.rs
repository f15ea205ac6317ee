//! Sequence reports.
//!
//! A [`SequenceReport`] lists every step in declaration order with its
//! outcome, so the final report always enumerates the whole plan, including
//! steps that never ran. It is produced by the sequencer and rebuilt locally
//! by the status bridge for detached runs.

use crate::step::{Outcome, OutcomeTransitionError, StepResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step's line in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub critical: bool,
    pub outcome: Outcome,
    pub message: String,
}

impl ReportEntry {
    /// A critical step that failed; everything after it was left Pending.
    pub fn is_blocking_failure(&self) -> bool {
        self.critical && self.outcome.is_failure()
    }
}

/// Ordered step outcomes plus the overall verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub entries: Vec<ReportEntry>,
    /// True iff no critical step failed or timed out.
    pub success: bool,
    /// Name of the critical step that halted the sequence, if any.
    pub halted_by: Option<String>,
    /// The run was cancelled before reaching the end.
    pub cancelled: bool,
}

impl SequenceReport {
    /// A report with every step Pending.
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            entries: steps
                .into_iter()
                .map(|(name, critical)| ReportEntry {
                    name: name.into(),
                    critical,
                    outcome: Outcome::Pending,
                    message: String::new(),
                })
                .collect(),
            success: true,
            halted_by: None,
            cancelled: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn outcome(&self, name: &str) -> Option<Outcome> {
        self.get(name).map(|e| e.outcome)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a step discovered after construction (e.g. an unexpected
    /// component on the status channel). No-op if it already exists.
    pub fn add_step(&mut self, name: impl Into<String>, critical: bool) {
        let name = name.into();
        if !self.contains(&name) {
            self.entries.push(ReportEntry {
                name,
                critical,
                outcome: Outcome::Pending,
                message: String::new(),
            });
        }
    }

    /// Assign a terminal result to a Pending step.
    pub fn record(&mut self, name: &str, result: StepResult) -> Result<(), OutcomeTransitionError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| OutcomeTransitionError::UnknownStep {
                step: name.to_string(),
            })?;

        entry.outcome = entry.outcome.transition(name, result.outcome)?;
        entry.message = result.message;
        if entry.is_blocking_failure() {
            self.success = false;
        }
        Ok(())
    }

    /// Mark every still-Pending step TimedOut.
    pub fn time_out_pending(&mut self, message: &str) {
        for entry in self.entries.iter_mut().filter(|e| e.outcome == Outcome::Pending) {
            entry.outcome = Outcome::TimedOut;
            entry.message = message.to_string();
            if entry.critical {
                self.success = false;
            }
        }
    }

    /// Fraction of steps that are Done or Skipped.
    pub fn progress(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let satisfied = self.entries.iter().filter(|e| e.outcome.is_satisfied()).count();
        satisfied as f64 / self.entries.len() as f64
    }

    pub fn blocking_failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.is_blocking_failure())
    }

    /// Non-critical failures: recorded, but did not stop the run.
    pub fn soft_failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| !e.critical && e.outcome.is_failure())
    }

    pub fn pending(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.outcome == Outcome::Pending)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for SequenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let tag = if entry.is_blocking_failure() {
                format!("{} (critical)", entry.outcome)
            } else {
                entry.outcome.to_string()
            };
            write!(f, "[{}] {}", tag, entry.name)?;
            if let Some(first) = entry.message.lines().next() {
                write!(f, ": {}", first)?;
            }
            writeln!(f)?;
        }
        if let Some(step) = &self.halted_by {
            writeln!(f, "halted by critical step '{}'", step)?;
        }
        if self.cancelled {
            writeln!(f, "cancelled")?;
        }
        write!(
            f,
            "{} ({:.0}% satisfied)",
            if self.success { "success" } else { "failed" },
            self.progress() * 100.0
        )
    }
}
