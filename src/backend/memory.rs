//! In-memory key-value backend.
//!
//! Every write bumps a global revision and records it on the touched key,
//! so watchers can tell whether anything under their prefix moved past the
//! index they last observed. Used when confweave is embedded as a library
//! and throughout the test suite.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BackendError;

use super::client::{is_under, BackendResult, StoreClient};

/// Backend type name.
const BACKEND: &str = "memory";

/// Default upper bound for a single watch call.
const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 60;

/// A stored key. Deleted keys are kept as tombstones so that deletions
/// advance the revision seen by watchers.
#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    mod_revision: u64,
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    revision: u64,
}

/// In-memory store with revision tracking.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    notifier: watch::Sender<u64>,
    watch_timeout: Duration,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        // Revision 1 is the empty store, so the first write is revision 2
        // and is always newer than the index handed out for a fresh watch.
        let (notifier, _) = watch::channel(1);
        Self {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                revision: 1,
            }),
            notifier,
            watch_timeout: Duration::from_secs(DEFAULT_WATCH_TIMEOUT_SECS),
        }
    }

    /// Sets the upper bound for a single watch call.
    #[must_use]
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Creates a store pre-populated with the given pairs.
    pub async fn with_values<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        for (key, value) in pairs {
            store.set(key, value).await;
        }
        store
    }

    /// Sets a key, returning the new revision.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> u64 {
        self.write(key.into(), Some(value.into())).await
    }

    /// Deletes a key, returning the new revision.
    pub async fn delete(&self, key: impl Into<String>) -> u64 {
        self.write(key.into(), None).await
    }

    /// Returns the current global revision.
    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }

    async fn write(&self, key: String, value: Option<String>) -> u64 {
        let revision = {
            let mut inner = self.inner.write().await;
            inner.revision += 1;
            let revision = inner.revision;
            debug!("memory store: {key} -> revision {revision}");
            inner.entries.insert(
                key,
                Entry {
                    value,
                    mod_revision: revision,
                },
            );
            revision
        };

        self.notifier.send_replace(revision);
        revision
    }

    /// Highest modification revision among the keys below the watched roots.
    async fn revision_under(&self, prefix: &str, keys: &[String]) -> u64 {
        let inner = self.inner.read().await;
        let roots: Vec<&str> = if keys.is_empty() {
            vec![prefix]
        } else {
            keys.iter().map(String::as_str).collect()
        };

        inner
            .entries
            .iter()
            .filter(|(key, _)| roots.iter().any(|root| is_under(key, root)))
            .map(|(_, entry)| entry.mod_revision)
            .max()
            .unwrap_or(1)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get_values(&self, keys: &[String]) -> BackendResult<BTreeMap<String, String>> {
        let inner = self.inner.read().await;

        let values = inner
            .entries
            .iter()
            .filter(|(key, _)| keys.iter().any(|root| is_under(key, root)))
            .filter_map(|(key, entry)| entry.value.clone().map(|value| (key.clone(), value)))
            .collect();

        Ok(values)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> BackendResult<u64> {
        let mut changes = self.notifier.subscribe();

        let current = self.revision_under(prefix, keys).await;
        if wait_index == 0 || current > wait_index {
            return Ok(current);
        }

        let deadline = tokio::time::sleep(self.watch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(wait_index),
                () = &mut deadline => return Ok(wait_index),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(BackendError::protocol(BACKEND, "change notifier closed"));
                    }
                    let current = self.revision_under(prefix, keys).await;
                    if current > wait_index {
                        return Ok(current);
                    }
                }
            }
        }
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_values_returns_subtree_and_omits_missing() {
        let store = MemoryStore::with_values([
            ("/app/db/host", "10.0.0.1"),
            ("/app/db/port", "5432"),
            ("/other/key", "x"),
        ])
        .await;

        let values = store
            .get_values(&[String::from("/app/db"), String::from("/app/missing")])
            .await
            .expect("get_values failed");

        assert_eq!(values.len(), 2);
        assert_eq!(values.get("/app/db/host").map(String::as_str), Some("10.0.0.1"));
        assert!(!values.contains_key("/other/key"));
    }

    #[tokio::test]
    async fn test_deleted_key_is_absent() {
        let store = MemoryStore::with_values([("/app/a", "1")]).await;
        store.delete("/app/a").await;

        let values = store
            .get_values(&[String::from("/app")])
            .await
            .expect("get_values failed");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_watch_with_zero_index_returns_immediately() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();

        let index = store
            .watch_prefix("/app", &[], 0, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn test_watch_wakes_on_change_under_prefix() {
        let store = Arc::new(MemoryStore::with_values([("/app/a", "1")]).await);
        let cancel = CancellationToken::new();
        let start = store.revision().await;

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set("/other/b", "ignored").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set("/app/a", "2").await;
        });

        let index = store
            .watch_prefix("/app", &[String::from("/app/a")], start, &cancel)
            .await
            .expect("watch failed");

        assert!(index > start);
        assert_eq!(index, store.revision().await);
    }

    #[tokio::test]
    async fn test_watch_returns_wait_index_on_cancel() {
        let store = MemoryStore::with_values([("/app/a", "1")]).await;
        let cancel = CancellationToken::new();
        let start = store.revision().await;

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let index = store
            .watch_prefix("/app", &[], start, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, start);
    }

    #[tokio::test]
    async fn test_watch_returns_wait_index_after_bound() {
        let store = MemoryStore::with_values([("/app/a", "1")])
            .await
            .with_watch_timeout(Duration::from_millis(30));
        let cancel = CancellationToken::new();
        let start = store.revision().await;

        let index = store
            .watch_prefix("/app", &[], start, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, start);
    }
}
