//! Declarative setup plans.
//!
//! A plan is a JSON file listing steps in the order they must run. It can be
//! turned into in-process [`Step`]s for the sequencer, or into a bash script
//! for a detached run that reports through the status channel.

use crate::command::CommandSpec;
use crate::config_merge::{self, ConfigDocument, KeyPath, is_valid_env_key};
use crate::probe;
use crate::report::SequenceReport;
use crate::status_bridge::{ScriptBlock, StatusChannel, script_command};
use crate::step::{CANCELLED, Step, StepContext, StepResult};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A whole plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    /// Default document for `config` steps that name no path.
    #[serde(default)]
    pub config_path: Option<String>,

    /// Status channel for detached runs.
    #[serde(default)]
    pub status_file: Option<String>,

    /// Completion marker for detached runs.
    #[serde(default)]
    pub marker_file: Option<String>,

    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,

    #[serde(default)]
    pub critical: bool,

    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Skip when `check` holds; otherwise `run`, then `fallback` if that failed.
    Install {
        check: Check,
        run: CommandSpec,
        #[serde(default)]
        fallback: Option<CommandSpec>,
    },
    /// Always runs.
    Command { run: CommandSpec },
    /// Upsert dotted keys into a JSON document.
    Config {
        #[serde(default)]
        path: Option<String>,
        set: BTreeMap<String, Value>,
        #[serde(default)]
        private: bool,
    },
    /// Upsert one `KEY=value` line into a dotenv file.
    Env {
        path: String,
        key: String,
        value: String,
    },
    /// Download a model unless `list` already shows it.
    Model {
        query: String,
        list: CommandSpec,
        download: CommandSpec,
    },
}

impl StepKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Command { .. } => "command",
            Self::Config { .. } => "config",
            Self::Env { .. } => "env",
            Self::Model { .. } => "model",
        }
    }
}

/// "Is this already satisfied?"
///
/// `not` inverts a check, for steps that only apply to what is already there:
/// `{ "not": { "command_exists": "node" } }` skips an upgrade when node is
/// missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    CommandExists(String),
    PathExists(String),
    CommandSucceeds(CommandSpec),
    OutputContains { run: CommandSpec, needle: String },
    Not(Box<Check>),
}

impl Check {
    pub fn evaluate(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(match self {
            Self::CommandExists(name) => probe::command_exists(ctx.executor(), name),
            Self::PathExists(path) => probe::path_exists(&expand_home(path)),
            Self::CommandSucceeds(spec) => ctx.run_quiet(spec).success(),
            Self::OutputContains { run, needle } => {
                let out = ctx.run_quiet(run);
                out.success() && contains_ignore_case(&out.output, needle)
            }
            Self::Not(inner) => !inner.evaluate(ctx)?,
        })
    }

    /// The same check as a shell condition.
    pub fn to_shell(&self) -> String {
        match self {
            Self::CommandExists(name) => {
                format!("command -v {} >/dev/null 2>&1", shell_words::quote(name))
            }
            Self::PathExists(path) => format!("[ -e {} ]", quote_path(&expand_home(path))),
            Self::CommandSucceeds(spec) => format!("{} >/dev/null 2>&1", script_command(spec)),
            Self::OutputContains { run, needle } => format!(
                "{} 2>/dev/null | grep -qiF -- {}",
                script_command(run),
                shell_words::quote(needle)
            ),
            Self::Not(inner) => format!("! {{ {}; }}", inner.to_shell()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::CommandExists(name) => format!("{} already installed", name),
            Self::PathExists(path) => format!("{} already exists", path),
            Self::CommandSucceeds(spec) => format!("`{}` already succeeds", spec),
            Self::OutputContains { needle, .. } => format!("{} already present", needle),
            Self::Not(inner) => match inner.as_ref() {
                Self::CommandExists(name) => format!("{} not installed", name),
                Self::PathExists(path) => format!("{} does not exist", path),
                Self::CommandSucceeds(spec) => format!("`{}` fails", spec),
                Self::OutputContains { needle, .. } => format!("{} not present", needle),
                Self::Not(twice) => twice.describe(),
            },
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

/// The part of a model query before `@` (the quantisation suffix).
pub fn model_base_name(query: &str) -> &str {
    query.split('@').next().unwrap_or(query).trim()
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    let home = || std::env::var_os("HOME").map(PathBuf::from);
    if path == "~" {
        if let Some(home) = home() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl PlanFile {
    /// Load a plan from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan from {:?}", path.as_ref()))?;

        let plan: Self = serde_json::from_str(&content).context("Failed to parse plan JSON")?;

        Ok(plan)
    }

    /// Validate the plan
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail!("Plan has no steps");
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name.trim();
            if name.is_empty() {
                bail!("Step names must not be empty");
            }
            if step.name.chars().any(char::is_control) {
                bail!("Step name {:?} contains control characters", step.name);
            }
            if !seen.insert(name) {
                bail!("Duplicate step name '{}'", name);
            }

            self.validate_kind(step)
                .with_context(|| format!("Invalid {} step '{}'", step.kind.label(), name))?;
        }

        Ok(())
    }

    fn validate_kind(&self, step: &PlanStep) -> Result<()> {
        match &step.kind {
            StepKind::Install {
                check,
                run,
                fallback,
            } => {
                validate_check(check)?;
                validate_command(run)?;
                if let Some(fallback) = fallback {
                    validate_command(fallback)?;
                }
            }
            StepKind::Command { run } => validate_command(run)?,
            StepKind::Config { path, set, .. } => {
                if path.is_none() && self.config_path.is_none() {
                    bail!("No path given and the plan has no config_path");
                }
                if set.is_empty() {
                    bail!("Nothing to set");
                }
                for key in set.keys() {
                    KeyPath::parse(key)?;
                }
            }
            StepKind::Env { path, key, value } => {
                if path.trim().is_empty() {
                    bail!("Env file path must be specified");
                }
                if !is_valid_env_key(key) {
                    bail!("'{}' is not a valid environment variable name", key);
                }
                if value.contains(['\n', '\r']) {
                    bail!("Value for '{}' contains a newline", key);
                }
            }
            StepKind::Model {
                query,
                list,
                download,
            } => {
                if model_base_name(query).is_empty() {
                    bail!("Model query must be specified");
                }
                validate_command(list)?;
                validate_command(download)?;
            }
        }
        Ok(())
    }

    pub fn channel(&self) -> StatusChannel {
        let defaults = StatusChannel::default();
        StatusChannel::new(
            self.status_file
                .as_deref()
                .map(expand_home)
                .unwrap_or(defaults.status_path),
            self.marker_file
                .as_deref()
                .map(expand_home)
                .unwrap_or(defaults.marker_path),
        )
    }

    /// Every step Pending, in plan order.
    pub fn initial_report(&self) -> SequenceReport {
        SequenceReport::new(self.steps.iter().map(|s| (s.name.clone(), s.critical)))
    }

    fn config_target(&self, path: &Option<String>) -> Result<PathBuf> {
        path.as_deref()
            .or(self.config_path.as_deref())
            .map(expand_home)
            .context("Config step has no path and the plan has no config_path")
    }

    /// Build sequencer steps.
    pub fn into_steps(&self) -> Result<Vec<Step>> {
        self.steps
            .iter()
            .map(|step| self.build_step(step))
            .collect()
    }

    fn build_step(&self, plan_step: &PlanStep) -> Result<Step> {
        let name = plan_step.name.trim().to_string();
        let step = match &plan_step.kind {
            StepKind::Install {
                check,
                run,
                fallback,
            } => {
                let (run, fallback) = (run.clone(), fallback.clone());
                let skip_message = check.describe();
                let check = check.clone();
                Step::new(name, move |ctx| Ok(install(ctx, &run, fallback.as_ref())))
                    .skip_if(move |ctx| check.evaluate(ctx), skip_message)
            }
            StepKind::Command { run } => {
                Step::command(name.clone(), run.clone(), format!("{} finished", name))
            }
            StepKind::Config { path, set, private } => {
                let target = self.config_target(path)?;
                let updates = set
                    .iter()
                    .map(|(key, value)| -> Result<(KeyPath, Value)> {
                        Ok((KeyPath::parse(key)?, value.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let private = *private;
                let check_target = target.clone();
                let check_updates = updates.clone();

                Step::new(name, move |_ctx| {
                    config_merge::upsert(&target, &updates, private)
                        .with_context(|| format!("Failed to update {}", target.display()))?;
                    Ok(StepResult::done(format!(
                        "{} updated ({} keys)",
                        target.display(),
                        updates.len()
                    )))
                })
                .skip_if(
                    move |_ctx| Ok(ConfigDocument::load(&check_target).contains_all(&check_updates)),
                    "configuration already up to date",
                )
            }
            StepKind::Env { path, key, value } => {
                let target = expand_home(path);
                let (key, value) = (key.clone(), value.clone());
                let (check_target, check_key, check_value) = (target.clone(), key.clone(), value.clone());

                Step::new(name, move |_ctx| {
                    config_merge::upsert_env_line(&target, &key, &value)
                        .with_context(|| format!("Failed to update {}", target.display()))?;
                    Ok(StepResult::done(format!("{} set in {}", key, target.display())))
                })
                .skip_if(
                    move |_ctx| {
                        Ok(config_merge::env_line_present(&check_target, &check_key, &check_value))
                    },
                    "environment entry already set",
                )
            }
            StepKind::Model {
                query,
                list,
                download,
            } => {
                let check = Check::OutputContains {
                    run: list.clone(),
                    needle: model_base_name(query).to_string(),
                };
                let download = download.clone();
                let done = format!("{} downloaded", query);
                Step::new(name, move |ctx| {
                    Ok(StepResult::from_output(&ctx.run(&download), done.clone()))
                })
                .skip_if(move |ctx| check.evaluate(ctx), format!("{} already downloaded", query))
            }
        };
        Ok(step.critical(plan_step.critical))
    }

    /// Build the blocks of a detached script. `hostsetup` is the path of this
    /// binary, used for config and env steps; their checks call the same
    /// `check` subcommands, so they report SKIP exactly when an in-process run
    /// would.
    pub fn to_script_blocks(&self, hostsetup: &str) -> Result<Vec<ScriptBlock>> {
        let mut blocks = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let block = ScriptBlock::new(step.name.trim()).critical(step.critical);
            let block = match &step.kind {
                StepKind::Install {
                    check,
                    run,
                    fallback,
                } => {
                    let mut block = block.check(check.to_shell()).action(script_command(run));
                    if let Some(fallback) = fallback {
                        block = block.action(script_command(fallback));
                    }
                    block
                }
                StepKind::Command { run } => block.action(script_command(run)),
                StepKind::Config { path, set, private } => {
                    let target = self.config_target(path)?;
                    let assignments = set
                        .iter()
                        .map(|(key, value)| -> Result<String> {
                            Ok(format!("{}={}", key, serde_json::to_string(value)?))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let config = |action: &str| {
                        CommandSpec::direct(hostsetup)
                            .args(["config", action])
                            .arg(target.to_string_lossy())
                            .args(assignments.iter().cloned())
                    };
                    let mut apply = config("set");
                    if *private {
                        apply = apply.arg("--private");
                    }
                    block
                        .check(script_command(&config("check")))
                        .action(script_command(&apply))
                }
                StepKind::Env { path, key, value } => {
                    let env = |action: &str| {
                        CommandSpec::direct(hostsetup)
                            .args(["env", action])
                            .arg(expand_home(path).to_string_lossy())
                            .args([key.as_str(), value.as_str()])
                    };
                    block
                        .check(script_command(&env("check")))
                        .action(script_command(&env("set")))
                }
                StepKind::Model {
                    query,
                    list,
                    download,
                } => {
                    let check = Check::OutputContains {
                        run: list.clone(),
                        needle: model_base_name(query).to_string(),
                    };
                    block.check(check.to_shell()).action(script_command(download))
                }
            };
            blocks.push(block);
        }
        Ok(blocks)
    }
}

fn validate_command(spec: &CommandSpec) -> Result<()> {
    if spec.program.trim().is_empty() {
        bail!("Command program must be specified");
    }
    Ok(())
}

fn validate_check(check: &Check) -> Result<()> {
    match check {
        Check::CommandExists(name) if name.trim().is_empty() => {
            bail!("command_exists needs a command name")
        }
        Check::PathExists(path) if path.trim().is_empty() => bail!("path_exists needs a path"),
        Check::CommandSucceeds(spec) => validate_command(spec),
        Check::OutputContains { run, needle } => {
            if needle.is_empty() {
                bail!("output_contains needs a needle");
            }
            validate_command(run)
        }
        Check::Not(inner) => validate_check(inner),
        _ => Ok(()),
    }
}

/// Run `run`; if it fails (and was not cancelled) try `fallback`.
fn install(ctx: &StepContext<'_>, run: &CommandSpec, fallback: Option<&CommandSpec>) -> StepResult {
    let first = ctx.run(run);
    if first.success() {
        return StepResult::done(format!("installed with `{}`", run));
    }
    if first.cancelled || ctx.is_cancelled() {
        return StepResult::failed(CANCELLED);
    }
    let Some(fallback) = fallback else {
        return StepResult::from_output(&first, "");
    };

    warn!(step = ctx.step_name(), exit_code = first.exit_code, "primary install failed, trying fallback");
    let second = ctx.run(fallback);
    if second.success() {
        info!(step = ctx.step_name(), "fallback install succeeded");
        StepResult::done(format!("installed with fallback `{}`", fallback))
    } else {
        StepResult::from_output(&second, "")
    }
}
