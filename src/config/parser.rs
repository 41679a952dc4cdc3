//! Configuration parser for loading the agent configuration.
//!
//! Precedence, lowest first: built-in defaults, the YAML file, a `.env`
//! file next to it, `CONFWEAVE_*` environment variables, then CLI flags
//! (applied by the caller).

use crate::error::{ConfigError, ConfweaveError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::AgentConfig;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "CONFWEAVE_CONFIG";

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["confweave.yaml", "confweave.yml"];

/// Configuration parser for loading agent configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<AgentConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfweaveError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfweaveError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<AgentConfig> {
        debug!("Parsing YAML configuration");

        // An empty document is a valid "all defaults" configuration.
        if content.trim().is_empty() {
            return Ok(AgentConfig::default());
        }

        let config: AgentConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConfweaveError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Parsed configuration for backend: {}", config.backend.name);
        Ok(config)
    }

    /// Resolves and loads the configuration, applying environment overrides.
    ///
    /// When `explicit` is `None` the file is searched for with
    /// [`locate_config_file`]; if none is found the defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is found but cannot be loaded, or an
    /// override has an invalid value.
    pub fn load(explicit: Option<&Path>) -> Result<AgentConfig> {
        let located = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => locate_config_file(|name| std::env::var(name).ok()),
        };

        let mut config = match &located {
            Some(path) => {
                let parser = path
                    .parent()
                    .map_or_else(Self::new, |dir| Self::new().with_base_path(dir));
                let config = parser.load_file(path)?;
                parser.load_dotenv()?;
                config
            }
            None => {
                info!("No configuration file found, using defaults");
                Self::new().load_dotenv()?;
                AgentConfig::default()
            }
        };

        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `CONFWEAVE_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `CONFWEAVE_INTERVAL` is not a number.
    pub fn apply_env_overrides<F>(config: &mut AgentConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("CONFWEAVE_BACKEND") {
            debug!("Overriding backend.name from environment");
            config.backend.name = name;
        }

        if let Some(nodes) = lookup("CONFWEAVE_NODES") {
            debug!("Overriding backend.nodes from environment");
            config.backend.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(username) = lookup("CONFWEAVE_USERNAME") {
            debug!("Overriding backend.username from environment");
            config.backend.username = Some(username);
        }

        if let Some(password) = lookup("CONFWEAVE_PASSWORD") {
            debug!("Overriding backend.password from environment");
            config.backend.password = Some(password);
        }

        if let Some(prefix) = lookup("CONFWEAVE_PREFIX") {
            debug!("Overriding prefix from environment");
            config.prefix = Some(prefix);
        }

        if let Some(confdir) = lookup("CONFWEAVE_CONFDIR") {
            debug!("Overriding confdir from environment");
            config.confdir = PathBuf::from(confdir);
        }

        if let Some(interval) = lookup("CONFWEAVE_INTERVAL") {
            debug!("Overriding interval_secs from environment");
            config.interval_secs = interval.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("CONFWEAVE_INTERVAL must be a number of seconds, got '{interval}'"),
                    "interval_secs",
                )
            })?;
        }

        if let Some(cert) = lookup("CONFWEAVE_CLIENT_CERT") {
            debug!("Overriding backend.client_cert from environment");
            config.backend.client_cert = Some(PathBuf::from(cert));
        }

        if let Some(key) = lookup("CONFWEAVE_CLIENT_KEY") {
            debug!("Overriding backend.client_key from environment");
            config.backend.client_key = Some(PathBuf::from(key));
        }

        if let Some(ca) = lookup("CONFWEAVE_CLIENT_CA_KEYS") {
            debug!("Overriding backend.client_ca_keys from environment");
            config.backend.client_ca_keys = Some(PathBuf::from(ca));
        }

        if let Some(keyring) = lookup("CONFWEAVE_KEYRING") {
            debug!("Overriding secret_keyring from environment");
            config.secret_keyring = Some(PathBuf::from(keyring));
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConfweaveError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Finds the configuration file in `start_dir` or its parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfweaveError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

/// Locates the configuration file without an explicit path.
///
/// Checks `CONFWEAVE_CONFIG`, then the current directory and its parents,
/// then the user configuration directory.
pub fn locate_config_file<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }

    if let Some(path) = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_config_file(cwd).ok())
    {
        return Some(path);
    }

    dirs::config_dir()
        .map(|dir| dir.join("confweave").join(DEFAULT_CONFIG_FILES[0]))
        .filter(|path| path.exists())
}
