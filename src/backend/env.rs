//! Environment variable backend.
//!
//! Key paths map onto variable names by dropping the leading slash,
//! replacing `/` with `_` and upper-casing: `/app/db/host` is read from
//! `APP_DB_HOST`. The environment cannot be watched.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

use super::client::{BackendResult, StoreClient};

/// Backend type name.
const BACKEND: &str = "env";

/// Store backed by environment variables.
#[derive(Debug, Default)]
pub struct EnvStore {
    /// Fixed variable set; `None` reads the process environment on every call.
    vars: Option<BTreeMap<String, String>>,
}

impl EnvStore {
    /// Creates a store reading the live process environment.
    #[must_use]
    pub const fn new() -> Self {
        Self { vars: None }
    }

    /// Creates a store over a fixed set of variables.
    #[must_use]
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Some(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars
            .clone()
            .unwrap_or_else(|| std::env::vars().collect())
    }
}

/// Converts a key path into a variable name.
fn to_var_name(key: &str) -> String {
    key.trim_matches('/').replace('/', "_").to_uppercase()
}

/// Converts a variable name back into a key path.
fn to_key(var: &str) -> String {
    format!("/{}", var.to_lowercase().replace('_', "/"))
}

#[async_trait]
impl StoreClient for EnvStore {
    async fn get_values(&self, keys: &[String]) -> BackendResult<BTreeMap<String, String>> {
        let vars = self.snapshot();
        let mut values = BTreeMap::new();

        for key in keys {
            let name = to_var_name(key);
            let nested = format!("{name}_");
            for (var, value) in &vars {
                if *var == name {
                    values.insert(key.clone(), value.clone());
                } else if var.starts_with(&nested) {
                    values.insert(to_key(var), value.clone());
                }
            }
        }

        Ok(values)
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        _keys: &[String],
        _wait_index: u64,
        _cancel: &CancellationToken,
    ) -> BackendResult<u64> {
        Err(BackendError::unsupported(BACKEND, "watch_prefix"))
    }

    fn supports_watch(&self) -> bool {
        false
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}
