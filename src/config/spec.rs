//! Configuration specification types for the agent.
//!
//! This module defines the structs that map to the `confweave.yaml` file.
//! One `AgentConfig` is built at startup and passed explicitly to every
//! component; nothing reads configuration from globals afterwards.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The root configuration structure for the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Base configuration directory.
    pub confdir: PathBuf,
    /// Directory holding resource definitions (default: `confdir/conf.d`).
    pub resource_dir: Option<PathBuf>,
    /// Directory holding template sources (default: `confdir/templates`).
    pub template_dir: Option<PathBuf>,
    /// Key prefix applied to every resource, overriding their own.
    pub prefix: Option<String>,
    /// Reconciliation mode.
    pub mode: ScheduleMode,
    /// Seconds between two passes in interval mode.
    pub interval_secs: u64,
    /// Render and diff but never replace destinations.
    pub noop: bool,
    /// Replace destinations but never run reload commands.
    pub sync_only: bool,
    /// Keep stage files when the destination is unchanged.
    pub keep_stage_file: bool,
    /// Key material for the decrypting template functions.
    pub secret_keyring: Option<PathBuf>,
    /// Capacity of the error report channel.
    pub error_buffer: usize,
    /// Backend configuration.
    pub backend: BackendConfig,
}

/// Reconciliation mode.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// One long-lived watcher per resource.
    Watch,
    /// A sequential pass over every resource on a fixed period.
    #[default]
    Interval,
    /// A single pass, then exit.
    Onetime,
}

/// Key-value backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend name (`etcdv3`, `etcd`, `file` or `env`).
    pub name: String,
    /// etcd node URLs.
    pub nodes: Vec<String>,
    /// etcd username.
    pub username: Option<String>,
    /// etcd password.
    pub password: Option<String>,
    /// PEM client certificate presented to etcd.
    pub client_cert: Option<PathBuf>,
    /// PEM private key of the client certificate.
    pub client_key: Option<PathBuf>,
    /// PEM CA bundle used to verify etcd nodes.
    pub client_ca_keys: Option<PathBuf>,
    /// Files or directories read by the file backend.
    pub files: Vec<PathBuf>,
    /// Seconds between two polls of the file backend.
    pub poll_interval_secs: u64,
    /// Upper bound in seconds for a single watch call.
    pub watch_timeout_secs: u64,
}

/// Default configuration directory.
pub const DEFAULT_CONFDIR: &str = "/etc/confweave";

/// Default backend.
pub const DEFAULT_BACKEND: &str = "etcdv3";

/// Default etcd node.
pub const DEFAULT_ETCD_NODE: &str = "http://127.0.0.1:2379";

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            confdir: PathBuf::from(DEFAULT_CONFDIR),
            resource_dir: None,
            template_dir: None,
            prefix: None,
            mode: ScheduleMode::default(),
            interval_secs: 600,
            noop: false,
            sync_only: false,
            keep_stage_file: false,
            secret_keyring: None,
            error_buffer: 10,
            backend: BackendConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::from(DEFAULT_BACKEND),
            nodes: vec![String::from(DEFAULT_ETCD_NODE)],
            username: None,
            password: None,
            client_cert: None,
            client_key: None,
            client_ca_keys: None,
            files: Vec::new(),
            poll_interval_secs: 2,
            watch_timeout_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Returns the directory scanned for resource definitions.
    #[must_use]
    pub fn resource_dir(&self) -> PathBuf {
        self.resource_dir
            .clone()
            .unwrap_or_else(|| self.confdir.join("conf.d"))
    }

    /// Returns the directory template sources are resolved against.
    #[must_use]
    pub fn template_dir(&self) -> PathBuf {
        self.template_dir
            .clone()
            .unwrap_or_else(|| self.confdir.join("templates"))
    }

    /// Returns the interval between two passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl BackendConfig {
    /// Returns the file backend polling interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Returns the watch bound.
    #[must_use]
    pub const fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}

impl std::fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Watch => write!(f, "watch"),
            Self::Interval => write!(f, "interval"),
            Self::Onetime => write!(f, "onetime"),
        }
    }
}
