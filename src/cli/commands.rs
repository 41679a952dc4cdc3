//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{AgentConfig, ScheduleMode};

/// confweave - renders configuration files from key-value stores.
#[derive(Parser, Debug)]
#[command(name = "confweave")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level when not verbose (error, warn, info, debug, trace).
    #[arg(long, global = true, env = "CONFWEAVE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent.
    Run(RunArgs),

    /// Validate the agent configuration and resource definitions.
    Validate,

    /// List the loaded template resources.
    Resources,

    /// Encrypt a value with the configured keyring.
    Encrypt {
        /// Plaintext value.
        value: String,
    },
}

/// Flags of the `run` command. Each one overrides the configuration file.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Backend name (etcd, file, env).
    #[arg(long)]
    pub backend: Option<String>,

    /// Backend node URL; repeat for several nodes.
    #[arg(long = "node")]
    pub nodes: Vec<String>,

    /// Base configuration directory.
    #[arg(long)]
    pub confdir: Option<PathBuf>,

    /// Key prefix for every resource.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Watch the backend for changes.
    #[arg(long, conflicts_with = "onetime")]
    pub watch: bool,

    /// Run a single pass and exit.
    #[arg(long)]
    pub onetime: bool,

    /// Seconds between passes in interval mode.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Render and compare only; never modify destinations.
    #[arg(long)]
    pub noop: bool,

    /// Replace destinations without running reload commands.
    #[arg(long)]
    pub sync_only: bool,

    /// Keep stage files of unchanged destinations.
    #[arg(long)]
    pub keep_stage_file: bool,

    /// Keyring file for the decrypting template functions.
    #[arg(long)]
    pub keyring: Option<PathBuf>,
}

impl RunArgs {
    /// Applies the flags on top of a loaded configuration.
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(backend) = &self.backend {
            config.backend.name.clone_from(backend);
        }
        if !self.nodes.is_empty() {
            config.backend.nodes.clone_from(&self.nodes);
        }
        if let Some(confdir) = &self.confdir {
            config.confdir.clone_from(confdir);
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = Some(prefix.clone());
        }
        if self.watch {
            config.mode = ScheduleMode::Watch;
        } else if self.onetime {
            config.mode = ScheduleMode::Onetime;
        }
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if let Some(keyring) = &self.keyring {
            config.secret_keyring = Some(keyring.clone());
        }
        config.noop |= self.noop;
        config.sync_only |= self.sync_only;
        config.keep_stage_file |= self.keep_stage_file;
    }
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
