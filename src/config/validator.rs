//! Configuration validation for the agent.
//!
//! Collects every problem in one pass so that `confweave validate` can
//! report them together. Errors stop the agent from starting; warnings are
//! printed and ignored.

use crate::error::{ConfigError, ConfweaveError, Result};
use tracing::debug;

use super::spec::{AgentConfig, BackendConfig, ScheduleMode};

/// Backend names understood by the backend factory.
pub const KNOWN_BACKENDS: &[&str] = &["etcdv3", "etcd", "file", "env"];

/// Validator for agent configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an agent configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &AgentConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(ConfweaveError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &AgentConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_schedule(config, &mut result);
        Self::validate_flags(config, &mut result);
        Self::validate_backend(&config.backend, &mut result);

        result
    }

    fn validate_schedule(config: &AgentConfig, result: &mut ValidationResult) {
        if config.mode == ScheduleMode::Interval && config.interval_secs == 0 {
            result.error("interval_secs", "Interval must be positive in interval mode");
        }

        if config.error_buffer == 0 {
            result.error("error_buffer", "Error buffer must hold at least one report");
        }

        if let Some(prefix) = &config.prefix {
            if !prefix.is_empty() && !prefix.starts_with('/') {
                result.warnings.push(format!(
                    "Prefix '{prefix}' does not start with '/', it will be treated as '/{prefix}'"
                ));
            }
        }
    }

    fn validate_flags(config: &AgentConfig, result: &mut ValidationResult) {
        if config.keep_stage_file && config.noop {
            result.warnings.push(String::from(
                "keep_stage_file has no effect on changed files in noop mode",
            ));
        }

        if config.noop && config.sync_only {
            result
                .warnings
                .push(String::from("sync_only is redundant when noop is set"));
        }

        if let Some(keyring) = &config.secret_keyring {
            if !keyring.exists() {
                result.error(
                    "secret_keyring",
                    format!("Keyring file {} does not exist", keyring.display()),
                );
            }
        }
    }

    fn validate_backend(backend: &BackendConfig, result: &mut ValidationResult) {
        match backend.name.as_str() {
            "etcdv3" | "etcd" => {
                if backend.nodes.is_empty() {
                    result.error("backend.nodes", "etcd backend needs at least one node");
                }
                for node in &backend.nodes {
                    if !node.starts_with("http://") && !node.starts_with("https://") {
                        result.error(
                            "backend.nodes",
                            format!("Node '{node}' must be an http:// or https:// URL"),
                        );
                    }
                }

                let plain_http = backend.nodes.iter().any(|n| n.starts_with("http://"));
                if backend.username.is_some() && plain_http {
                    result.warnings.push(String::from(
                        "etcd credentials are sent over plain HTTP",
                    ));
                }

                if backend.watch_timeout_secs == 0 {
                    result.error("backend.watch_timeout_secs", "Watch timeout must be positive");
                }

                Self::validate_tls(backend, result);
            }
            "file" => {
                if backend.files.is_empty() {
                    result.error("backend.files", "file backend needs at least one source");
                }
                for file in &backend.files {
                    if !file.exists() {
                        result
                            .warnings
                            .push(format!("File source {} does not exist yet", file.display()));
                    }
                }

                if backend.poll_interval_secs == 0 {
                    result.error("backend.poll_interval_secs", "Poll interval must be positive");
                }
            }
            "env" => {}
            other => result.error(
                "backend.name",
                format!(
                    "Unknown backend '{other}', expected one of: {}",
                    KNOWN_BACKENDS.join(", ")
                ),
            ),
        }
    }

    fn validate_tls(backend: &BackendConfig, result: &mut ValidationResult) {
        match (&backend.client_cert, &backend.client_key) {
            (Some(_), None) => {
                result.error("backend.client_key", "client_cert requires client_key");
            }
            (None, Some(_)) => {
                result.error("backend.client_cert", "client_key requires client_cert");
            }
            _ => {}
        }

        let files = [
            ("backend.client_cert", &backend.client_cert),
            ("backend.client_key", &backend.client_key),
            ("backend.client_ca_keys", &backend.client_ca_keys),
        ];
        for (field, path) in files {
            if let Some(path) = path {
                if !path.exists() {
                    result.error(field, format!("File {} does not exist", path.display()));
                }
            }
        }
    }
}
