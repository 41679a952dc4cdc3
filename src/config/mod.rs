//! Configuration module for the confweave agent.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `confweave.yaml`
//! - `.env` loading and `CONFWEAVE_*` environment overrides
//! - Validation of configuration values

mod spec;
mod parser;
mod validator;

pub use spec::{
    AgentConfig, BackendConfig, ScheduleMode, DEFAULT_BACKEND, DEFAULT_CONFDIR, DEFAULT_ETCD_NODE,
};
pub use parser::{
    find_config_file, locate_config_file, ConfigParser, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILES,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult, KNOWN_BACKENDS};
