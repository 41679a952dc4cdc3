//! Error types for the confweave agent.
//!
//! This module provides the error hierarchy for every stage of the agent's
//! life: startup configuration, backend access, and the per-resource sync
//! pipeline. Pipeline errors always carry the identity of the resource they
//! belong to so that reports can be attributed without extra context.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the confweave agent.
#[derive(Debug, Error)]
pub enum ConfweaveError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Key-value backend errors.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Sync pipeline errors.
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A resource definition could not be turned into a resource.
    #[error("Cannot process template resource {}: {message}", .path.display())]
    InvalidResource {
        /// Path to the resource definition.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// The resource directory cannot be read.
    #[error("Cannot read resource directory {}: {message}", .path.display())]
    ResourceDirUnreadable {
        /// Path to the resource directory.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The configured backend name is not known.
    #[error("Unknown backend: {name}")]
    UnknownBackend {
        /// The backend name that was requested.
        name: String,
    },

    /// Watch mode was requested for a backend that cannot watch.
    #[error("Backend '{backend}' does not support watch mode")]
    WatchUnsupported {
        /// Backend type name.
        backend: &'static str,
    },

    /// The secret keyring could not be loaded.
    #[error("Cannot load secret keyring {}: {message}", .path.display())]
    Keyring {
        /// Path to the keyring.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// Key-value backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("{backend}: connection failed: {message}")]
    Connection {
        /// Backend type name.
        backend: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The backend answered with something we could not use.
    #[error("{backend}: protocol error: {message}")]
    Protocol {
        /// Backend type name.
        backend: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The backend does not implement the requested operation.
    #[error("{backend}: operation '{operation}' is not supported")]
    Unsupported {
        /// Backend type name.
        backend: &'static str,
        /// Name of the unsupported operation.
        operation: &'static str,
    },
}

/// Errors raised by one execution of the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The destination file mode could not be resolved.
    #[error("{resource}: cannot resolve file mode: {message}")]
    Mode {
        /// Resource identity.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// Fetching values from the backend failed.
    #[error("{resource}: cannot fetch values: {source}")]
    Fetch {
        /// Resource identity.
        resource: String,
        /// Underlying backend error.
        #[source]
        source: BackendError,
    },

    /// The template source could not be read.
    #[error("{resource}: cannot read template {}: {source}", .path.display())]
    Template {
        /// Resource identity.
        resource: String,
        /// Template source path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Template evaluation failed.
    #[error("{resource}: render failed: {message}")]
    Render {
        /// Resource identity.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// Writing the stage file failed.
    #[error("{resource}: cannot stage {}: {source}", .path.display())]
    Stage {
        /// Resource identity.
        resource: String,
        /// Stage file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The check command rejected the staged file.
    #[error("{resource}: check command '{command}' failed: {message}")]
    Validation {
        /// Resource identity.
        resource: String,
        /// The rendered check command.
        command: String,
        /// Exit status and command output.
        message: String,
    },

    /// Replacing the destination failed.
    #[error("{resource}: cannot replace {}: {source}", .dest.display())]
    Apply {
        /// Resource identity.
        resource: String,
        /// Destination path.
        dest: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The reload command failed after the destination was replaced.
    #[error("{resource}: reload command '{command}' failed: {message}")]
    Reload {
        /// Resource identity.
        resource: String,
        /// The rendered reload command.
        command: String,
        /// Exit status and command output.
        message: String,
    },
}

/// Coarse classification used for error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Configuration or resource definition problem.
    Config,
    /// Transient backend failure.
    Backend,
    /// Backend lacks the requested capability.
    Unsupported,
    /// Template evaluation failure.
    Render,
    /// Check command failure.
    Validation,
    /// Reload command failure.
    Reload,
    /// Filesystem failure.
    Io,
    /// Anything else.
    Internal,
}

/// Result type alias for confweave operations.
pub type Result<T> = std::result::Result<T, ConfweaveError>;

impl ConfweaveError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Backend(e) => e.kind(),
            Self::Sync(e) => e.kind(),
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates an invalid resource error.
    #[must_use]
    pub fn invalid_resource(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidResource {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl BackendError {
    /// Creates a connection error.
    #[must_use]
    pub fn connection(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            backend,
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            backend,
            message: message.into(),
        }
    }

    /// Creates an unsupported operation error.
    #[must_use]
    pub const fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Protocol { .. })
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Connection { .. } | Self::Protocol { .. } => ErrorKind::Backend,
        }
    }
}

impl SyncError {
    /// Returns the identity of the resource this error belongs to.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Mode { resource, .. }
            | Self::Fetch { resource, .. }
            | Self::Template { resource, .. }
            | Self::Render { resource, .. }
            | Self::Stage { resource, .. }
            | Self::Validation { resource, .. }
            | Self::Apply { resource, .. }
            | Self::Reload { resource, .. } => resource,
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { source, .. } => source.kind(),
            Self::Render { .. } => ErrorKind::Render,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Reload { .. } => ErrorKind::Reload,
            Self::Mode { .. } | Self::Template { .. } | Self::Stage { .. } | Self::Apply { .. } => {
                ErrorKind::Io
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Backend => "backend",
            Self::Unsupported => "unsupported",
            Self::Render => "render",
            Self::Validation => "validation",
            Self::Reload => "reload",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_carries_resource() {
        let err = SyncError::Validation {
            resource: String::from("nginx.conf.tmpl => /etc/nginx/nginx.conf"),
            command: String::from("nginx -t"),
            message: String::from("exit status 1"),
        };

        assert_eq!(err.resource(), "nginx.conf.tmpl => /etc/nginx/nginx.conf");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("nginx -t"));
    }

    #[test]
    fn test_fetch_error_inherits_backend_kind() {
        let err = ConfweaveError::from(SyncError::Fetch {
            resource: String::from("app"),
            source: BackendError::connection("etcd", "refused"),
        });

        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_unsupported_is_not_retryable() {
        let err = BackendError::unsupported("env", "watch_prefix");

        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
