//! hostsetup - main entry point
//!
//! Runs a setup plan either in-process through the sequencer or handed to a
//! detached terminal, watched through the status channel. Human-readable
//! progress goes to stderr; the machine-readable report goes to stdout.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hostsetup::cli::{Cli, Commands, ConfigCommands, EnvCommands};
use hostsetup::config_merge::{self, ConfigDocument, KeyPath};
use hostsetup::executor::Executor;
use hostsetup::output_parser::ProgressEvent;
use hostsetup::plan::PlanFile;
use hostsetup::process_guard::{self, ProcessGuard};
use hostsetup::report::SequenceReport;
use hostsetup::sequencer::{SetupEvent, Sequencer, observer_fn};
use hostsetup::status_bridge::{
    self, StatusChannel, StatusWatcher, WatchOptions, WatchOutcome,
};
use hostsetup::{probe, recommend};

/// Initialize tracing: info by default, debug with `-v`, RUST_LOG wins.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    // Children are cleaned up on SIGINT/SIGTERM/SIGHUP, and by the guard on
    // normal exit.
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!(error = %e, "failed to initialize signal handlers");
    }
    let _guard = ProcessGuard::new();

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run { plan, report } => run_plan(&plan, report.as_deref()),
        Commands::Detach {
            plan,
            launcher,
            script,
            interval_secs,
            timeout_secs,
        } => detach_plan(
            &plan,
            launcher.as_deref(),
            script,
            watch_options(interval_secs, timeout_secs),
        ),
        Commands::Watch {
            status,
            marker,
            components,
            interval_secs,
            timeout_secs,
        } => {
            let defaults = StatusChannel::default();
            let channel = StatusChannel::new(
                status.unwrap_or(defaults.status_path),
                marker.unwrap_or(defaults.marker_path),
            );
            // Without a plan every expected component is treated as critical.
            let report = SequenceReport::new(components.into_iter().map(|c| (c, true)));
            watch(channel, report, None, watch_options(interval_secs, timeout_secs))
        }
        Commands::Config { action } => match action {
            ConfigCommands::Set {
                file,
                assignments,
                private,
            } => {
                let updates = assignments
                    .iter()
                    .map(|a| config_merge::parse_assignment(a))
                    .collect::<hostsetup::Result<Vec<_>>>()?;
                config_merge::upsert(&file, &updates, private)
                    .with_context(|| format!("Failed to update {}", file.display()))?;
                eprintln!("✓ Updated {} ({} keys)", file.display(), updates.len());
                Ok(ExitCode::SUCCESS)
            }
            ConfigCommands::Check { file, assignments } => {
                let updates = assignments
                    .iter()
                    .map(|a| config_merge::parse_assignment(a))
                    .collect::<hostsetup::Result<Vec<_>>>()?;
                let satisfied = ConfigDocument::load(&file).contains_all(&updates);
                debug!(file = %file.display(), satisfied, "config check");
                Ok(exit_code(satisfied))
            }
            ConfigCommands::Get { file, key } => {
                let key = KeyPath::parse(&key)?;
                match ConfigDocument::load(&file).get(&key) {
                    Some(value) => {
                        println!("{}", serde_json::to_string_pretty(value)?);
                        Ok(ExitCode::SUCCESS)
                    }
                    None => {
                        eprintln!("✗ {} is not set in {}", key, file.display());
                        Ok(ExitCode::FAILURE)
                    }
                }
            }
        },
        Commands::Env { action } => match action {
            EnvCommands::Set { file, key, value } => {
                config_merge::upsert_env_line(&file, &key, &value)
                    .with_context(|| format!("Failed to update {}", file.display()))?;
                eprintln!("✓ {} set in {}", key, file.display());
                Ok(ExitCode::SUCCESS)
            }
            EnvCommands::Check { file, key, value } => {
                Ok(exit_code(config_merge::env_line_present(&file, &key, &value)))
            }
        },
        Commands::Validate { plan } => {
            info!("Validating plan file: {:?}", plan);
            let loaded = PlanFile::load_from_file(&plan)?;
            loaded.validate()?;
            println!("✓ Plan is valid: {} steps", loaded.steps.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Versions { commands } => {
            let executor = Executor::new();
            let versions: BTreeMap<String, String> = commands
                .into_iter()
                .map(|command| {
                    let version = probe::installed_version(&executor, &command);
                    (command, version)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&versions)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recommend { memory_gb } => {
            let recommendation = recommend::recommend(memory_gb);
            println!("{}", serde_json::to_string_pretty(&recommendation)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn watch_options(interval_secs: u64, timeout_secs: u64) -> WatchOptions {
    WatchOptions {
        interval: Duration::from_secs(interval_secs.max(1)),
        timeout: Duration::from_secs(timeout_secs),
    }
}

fn load_plan(path: &Path) -> Result<PlanFile> {
    info!("Loading plan from: {:?}", path);
    let plan = PlanFile::load_from_file(path)?;
    plan.validate()?;
    Ok(plan)
}

/// Print events as they arrive.
fn print_event(event: &SetupEvent) {
    match event {
        SetupEvent::StepStarted { step } => eprintln!("==> {}", step),
        SetupEvent::Progress { step, progress } => match progress {
            ProgressEvent::Line(line) if step.is_empty() => eprintln!("    {}", line),
            ProgressEvent::Line(line) => eprintln!("    [{}] {}", step, line),
            other => debug!(step = %step, progress = %other, "progress"),
        },
        SetupEvent::StepFinished {
            step,
            critical,
            result,
        } => {
            let first = result.message.lines().next().unwrap_or_default();
            let tag = if *critical && result.outcome.is_failure() {
                format!("{} (critical)", result.outcome)
            } else {
                result.outcome.to_string()
            };
            eprintln!("[{}] {}: {}", tag, step, first);
        }
        SetupEvent::Finished { report } => eprintln!("\n{}", report),
    }
}

fn emit_report(report: &SequenceReport, path: Option<&Path>) -> Result<()> {
    let json = report.to_json_pretty()?;
    println!("{}", json);
    if let Some(path) = path {
        config_merge::write_atomic(path, format!("{}\n", json).as_bytes(), false)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run every step in this process.
fn run_plan(path: &Path, report_path: Option<&Path>) -> Result<ExitCode> {
    let plan = load_plan(path)?;
    let mut sequencer = Sequencer::new(plan.into_steps()?).with_executor(Executor::new());
    sequencer.subscribe(observer_fn(print_event));

    let report = sequencer.run();
    emit_report(&report, report_path)?;
    Ok(exit_code(report.success))
}

/// Render the plan as a script, launch it detached and watch it.
fn detach_plan(
    path: &Path,
    launcher: Option<&str>,
    script: Option<PathBuf>,
    options: WatchOptions,
) -> Result<ExitCode> {
    let plan = load_plan(path)?;

    let preflight = probe::verify_environment(&Executor::new(), probe::DETACH_BINARIES);
    if !preflight.is_ok() {
        bail!("Missing required binaries: {}", preflight.missing_binaries.join(", "));
    }

    let launcher = match launcher {
        Some(cmd) => shell_words::split(cmd).context("Failed to parse --launcher")?,
        None => status_bridge::default_launcher(),
    };

    let exe = std::env::current_exe().context("Failed to locate the hostsetup binary")?;
    let channel = plan.channel();
    // A stale marker from an earlier run must not look like completion.
    channel.remove()?;

    let blocks = plan.to_script_blocks(&exe.to_string_lossy())?;
    let script_path = script.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("hostsetup-{}.sh", std::process::id()))
    });
    status_bridge::write_script(&script_path, &status_bridge::render_script(&blocks, &channel))
        .with_context(|| format!("Failed to write script to {}", script_path.display()))?;
    info!(script = %script_path.display(), steps = blocks.len(), "detached script written");

    status_bridge::launch_detached(&launcher, &script_path)?;
    eprintln!("==> Running in a detached session; watching {}", channel.status_path.display());

    watch(channel, plan.initial_report(), Some(&script_path), options)
}

/// Watch a channel; `script` is the generated script of a detached run.
fn watch(
    channel: StatusChannel,
    report: SequenceReport,
    script: Option<&Path>,
    options: WatchOptions,
) -> Result<ExitCode> {
    let mut watcher = StatusWatcher::new(channel, report);
    let mut observer = observer_fn(print_event);
    let cancel = AtomicBool::new(false);

    let outcome = match script {
        Some(script) => watcher.watch_script(script, &mut observer, options, &cancel)?,
        None => watcher.watch(&mut observer, options, &cancel)?,
    };
    match outcome {
        WatchOutcome::Completed(report) => {
            emit_report(&report, None)?;
            Ok(exit_code(report.success))
        }
        WatchOutcome::TimedOut(report) => {
            eprintln!(
                "✗ Timed out after {}s; status files left at {} and {}",
                options.timeout.as_secs(),
                watcher.channel().status_path.display(),
                watcher.channel().marker_path.display()
            );
            emit_report(&report, None)?;
            Ok(ExitCode::FAILURE)
        }
        WatchOutcome::Cancelled => Ok(ExitCode::FAILURE),
    }
}
