//! Structured command descriptors.
//!
//! Every external action is described by a [`CommandSpec`]: an executable plus
//! an argument vector, never a single interpolated string. When a spec asks
//! for a login shell, the shell only sees a fixed trampoline script
//! (`exec "$0" "$@"`) and receives the program and arguments as positional
//! parameters, so user PATH customisations apply without any quoting hazard.

use crate::process_guard::CommandProcessGroup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Trampoline handed to the login shell. `$0` is the program, `$@` its args.
const LOGIN_TRAMPOLINE: &str = r#"exec "$0" "$@""#;

/// Shell used when `$SHELL` is unset.
const FALLBACK_SHELL: &str = "/bin/sh";

fn default_login_shell() -> bool {
    true
}

/// A single external invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables. Values are never logged.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory, if different from ours.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Resolve the program through the user's login shell.
    #[serde(default = "default_login_shell")]
    pub login_shell: bool,
}

impl CommandSpec {
    /// Create a spec that runs through the login shell.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            login_shell: true,
        }
    }

    /// Create a spec that is executed directly, bypassing the login shell.
    pub fn direct(program: impl Into<String>) -> Self {
        Self {
            login_shell: false,
            ..Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program and arguments as one argv vector.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Quoted shell rendering of the argv, safe to paste into a script.
    pub fn to_shell_line(&self) -> String {
        shell_words::join(self.argv())
    }

    /// Build a [`Command`] with piped output, null stdin and its own process group.
    pub fn to_command(&self) -> Command {
        let mut cmd = if self.login_shell {
            let mut cmd = Command::new(login_shell());
            cmd.arg("-lc").arg(LOGIN_TRAMPOLINE).arg(&self.program).args(&self.args);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);
            cmd
        };

        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_shell_line())?;
        if !self.env.is_empty() {
            let keys: Vec<&str> = self.env.keys().map(String::as_str).collect();
            write!(f, " [env: {}]", keys.join(", "))?;
        }
        Ok(())
    }
}

/// The user's login shell, falling back to `/bin/sh`.
pub fn login_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}
