//! Host probes used by step preconditions and pre-flight checks.
//!
//! Lookups first search `PATH` in-process with `which`, then ask the user's
//! login shell, since tools installed by a package manager are often only on
//! the login `PATH` (Homebrew, nvm, ...).

use crate::command::{CommandSpec, login_shell};
use crate::executor::Executor;
use std::path::Path;
use tracing::debug;

/// Returned by [`installed_version`] when the probe fails.
pub const NOT_INSTALLED: &str = "Not installed";

/// Binaries the detached path needs.
pub const DETACH_BINARIES: &[&str] = &["bash", "touch"];

/// Is `name` runnable?
pub fn command_exists(executor: &Executor, name: &str) -> bool {
    if name.trim().is_empty() {
        return false;
    }
    if which::which(name).is_ok() {
        return true;
    }

    // `$1` keeps the name out of the script text.
    let spec = CommandSpec::direct(login_shell()).args([
        "-lc",
        r#"command -v "$1" >/dev/null 2>&1"#,
        "sh",
        name,
    ]);
    let found = executor.run(&spec).success();
    debug!(command = name, found, "login shell lookup");
    found
}

pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

/// First line of `<command> --version`, or [`NOT_INSTALLED`].
pub fn installed_version(executor: &Executor, command: &str) -> String {
    let out = executor.run(&CommandSpec::new(command).arg("--version"));
    if !out.success() {
        return NOT_INSTALLED.to_string();
    }
    out.first_line()
        .map(str::to_string)
        .unwrap_or_else(|| NOT_INSTALLED.to_string())
}

/// Result of a pre-flight check.
#[derive(Debug)]
pub struct PreflightResult {
    pub missing_binaries: Vec<String>,
}

impl PreflightResult {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty()
    }
}

/// Check that every binary in `required` can be found.
pub fn verify_environment(executor: &Executor, required: &[&str]) -> PreflightResult {
    let missing_binaries = required
        .iter()
        .filter(|bin| !command_exists(executor, bin))
        .map(|bin| bin.to_string())
        .collect();
    PreflightResult { missing_binaries }
}
