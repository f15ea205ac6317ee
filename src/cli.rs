use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// hostsetup - unattended host setup from a declarative plan
#[derive(Parser)]
#[command(name = "hostsetup")]
#[command(about = "Run setup plans step by step, in-process or in a detached terminal")]
#[command(version)]
pub struct Cli {
    /// Verbose logging (debug level). RUST_LOG overrides this.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a plan in this process and print the JSON report
    Run {
        /// Path to the plan file
        plan: PathBuf,

        /// Also write the JSON report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run a plan in a detached terminal and watch its status channel
    Detach {
        /// Path to the plan file
        plan: PathBuf,

        /// Launcher command the script path is appended to
        /// (default: `open -a Terminal` on macOS, `setsid` elsewhere)
        #[arg(long)]
        launcher: Option<String>,

        /// Where to write the generated script (default: a temp file).
        /// It holds env values in plain text and is removed once the run completes.
        #[arg(long)]
        script: Option<PathBuf>,

        /// Seconds between status polls
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,

        /// Give up after this many seconds without a completion marker
        #[arg(long, default_value_t = 1800)]
        timeout_secs: u64,
    },
    /// Watch an existing status channel until its completion marker appears
    Watch {
        /// Status channel file
        #[arg(long)]
        status: Option<PathBuf>,

        /// Completion marker file
        #[arg(long)]
        marker: Option<PathBuf>,

        /// Component expected on the channel (repeatable)
        #[arg(long = "component")]
        components: Vec<String>,

        /// Seconds between status polls
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,

        /// Give up after this many seconds without a completion marker
        #[arg(long, default_value_t = 1800)]
        timeout_secs: u64,
    },
    /// Read or update a JSON config document
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Update a dotenv file
    Env {
        #[command(subcommand)]
        action: EnvCommands,
    },
    /// Validate a plan file
    Validate {
        /// Path to the plan file
        plan: PathBuf,
    },
    /// Print the installed version of each command as JSON
    Versions {
        /// Commands to probe with `--version`
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Recommend a model tier for the given memory size
    Recommend {
        /// Installed memory in GB
        #[arg(long)]
        memory_gb: u64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Upsert one or more dotted keys
    Set {
        /// Document to update (created if missing)
        file: PathBuf,

        /// Assignments like `gateway.port=18789`; values are JSON when they parse
        #[arg(required = true)]
        assignments: Vec<String>,

        /// Write the document with mode 0600
        #[arg(long)]
        private: bool,
    },
    /// Exit 0 if the document already holds every assignment
    Check {
        /// Document to read
        file: PathBuf,

        /// Assignments like `gateway.port=18789`
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Print the value at a dotted key
    Get {
        /// Document to read
        file: PathBuf,

        /// Dotted key path
        key: String,
    },
}

#[derive(Subcommand)]
pub enum EnvCommands {
    /// Set KEY=VALUE, replacing an existing entry
    Set {
        /// Dotenv file (created if missing)
        file: PathBuf,
        key: String,
        value: String,
    },
    /// Exit 0 if KEY=VALUE is already set
    Check {
        /// Dotenv file
        file: PathBuf,
        key: String,
        value: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
