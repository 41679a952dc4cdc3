//! Resource definition file format.
//!
//! A definition is a TOML or YAML document with a single `template` table:
//!
//! ```toml
//! [template]
//! src = "nginx.conf.tmpl"
//! dest = "/etc/nginx/nginx.conf"
//! prefix = "/app"
//! keys = ["/upstreams", "/server"]
//! mode = "0644"
//! check_cmd = "nginx -t -c {{ src }}"
//! reload_cmd = "systemctl reload nginx"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Sentinel for "use the effective id of the process".
pub const UNSET_ID: i64 = -1;

/// Root of a resource definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceFile {
    /// The resource definition.
    pub template: ResourceDefinition,
}

/// The fields of one resource definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceDefinition {
    /// Template source, relative to the template directory.
    #[serde(default)]
    pub src: String,
    /// Absolute destination path.
    #[serde(default)]
    pub dest: String,
    /// Keys to fetch, relative to the prefix.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Key prefix.
    #[serde(default)]
    pub prefix: String,
    /// Destination file mode, e.g. `"0644"`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner user id.
    #[serde(default = "unset_id")]
    pub uid: i64,
    /// Owner group id.
    #[serde(default = "unset_id")]
    pub gid: i64,
    /// Command validating the stage file.
    #[serde(default)]
    pub check_cmd: Option<String>,
    /// Command run after the destination is replaced.
    #[serde(default)]
    pub reload_cmd: Option<String>,
}

const fn unset_id() -> i64 {
    UNSET_ID
}

impl ResourceFile {
    /// Parses a definition, choosing the format from the file extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a valid definition.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        if is_yaml {
            serde_yaml::from_str(content)
                .map_err(|e| ConfigError::invalid_resource(path, format!("YAML parse error: {e}")))
        } else {
            toml::from_str(content)
                .map_err(|e| ConfigError::invalid_resource(path, format!("TOML parse error: {e}")))
        }
    }
}

/// Parses a mode string with base-prefix detection.
///
/// `0644` and `0o644` are octal, `0x1a4` is hex, `0b110100100` is binary,
/// anything else is decimal.
///
/// # Errors
///
/// Returns an error message if the string is not a number or exceeds
/// `0o7777`.
pub fn parse_mode(mode: &str) -> Result<u32, String> {
    let text = mode.trim();
    let lower = text.to_ascii_lowercase();

    let parsed = if let Some(digits) = lower.strip_prefix("0x") {
        u32::from_str_radix(digits, 16)
    } else if let Some(digits) = lower.strip_prefix("0o") {
        u32::from_str_radix(digits, 8)
    } else if let Some(digits) = lower.strip_prefix("0b") {
        u32::from_str_radix(digits, 2)
    } else if lower.len() > 1 && lower.starts_with('0') {
        u32::from_str_radix(&lower[1..], 8)
    } else {
        lower.parse::<u32>()
    };

    let value = parsed.map_err(|e| format!("invalid mode '{text}': {e}"))?;
    if value > 0o7777 {
        return Err(format!("mode '{text}' is out of range"));
    }
    Ok(value)
}
