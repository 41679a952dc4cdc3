//! Store client trait definition.
//!
//! This module defines the common interface every key-value backend
//! implements, along with the key path helpers shared by the backends and
//! the sync pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Trait for key-value store backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetches the values stored under each of the given keys.
    ///
    /// A key names a subtree: the key itself and every descendant are
    /// returned. Keys missing from the backend are omitted from the result.
    async fn get_values(&self, keys: &[String]) -> BackendResult<BTreeMap<String, String>>;

    /// Blocks until something under `prefix` changes past `wait_index`.
    ///
    /// Returns the new index. Returns `wait_index` unchanged when `cancel`
    /// fires or the backend's wait bound elapses. A `wait_index` of zero
    /// returns the current index immediately.
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> BackendResult<u64>;

    /// Returns true if `watch_prefix` is implemented.
    fn supports_watch(&self) -> bool {
        true
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Joins a key onto a prefix, producing an absolute key path.
#[must_use]
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');

    let joined = match (prefix.is_empty(), key.is_empty()) {
        (true, true) => String::from("/"),
        (true, false) => format!("/{key}"),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{key}"),
    };

    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// Prepends `prefix` to every key.
#[must_use]
pub fn append_prefix(prefix: &str, keys: &[String]) -> Vec<String> {
    keys.iter().map(|key| join_key(prefix, key)).collect()
}

/// Returns true if `key` is `root` itself or lies below it.
#[must_use]
pub fn is_under(key: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return true;
    }

    key == root
        || key
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}
