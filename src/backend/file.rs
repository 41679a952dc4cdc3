//! File backend.
//!
//! Reads one or more YAML (or JSON) documents and flattens them into key
//! paths: nested mappings become path segments and sequence items are
//! addressed by index, so `{db: {hosts: [a, b]}}` yields `/db/hosts/0` and
//! `/db/hosts/1`. A source may also be a directory, in which case every
//! `*.yaml`, `*.yml` and `*.json` file below it is read.
//!
//! Watching polls the sources and compares a SHA-256 fingerprint of their
//! contents.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BackendError;

use super::client::{is_under, BackendResult, StoreClient};

/// Backend type name.
const BACKEND: &str = "file";

/// Default delay between two fingerprint checks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default upper bound for a single watch call.
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Revision bookkeeping shared by concurrent watchers.
#[derive(Debug)]
struct Tracker {
    revision: u64,
    fingerprint: Option<String>,
}

/// Store backed by YAML or JSON files.
#[derive(Debug)]
pub struct FileStore {
    sources: Vec<PathBuf>,
    poll_interval: Duration,
    watch_timeout: Duration,
    tracker: Mutex<Tracker>,
}

impl FileStore {
    /// Creates a store reading the given files or directories.
    #[must_use]
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            tracker: Mutex::new(Tracker {
                revision: 1,
                fingerprint: None,
            }),
        }
    }

    /// Sets the delay between fingerprint checks.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the upper bound for a single watch call.
    #[must_use]
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Expands the configured sources into a sorted list of files.
    fn source_files(&self) -> BackendResult<Vec<PathBuf>> {
        let mut files = Vec::new();

        for source in &self.sources {
            if source.is_dir() {
                let root = glob::Pattern::escape(&source.to_string_lossy());
                for ext in ["yaml", "yml", "json"] {
                    let pattern = format!("{root}/**/*.{ext}");
                    let entries = glob::glob(&pattern).map_err(|e| {
                        BackendError::protocol(BACKEND, format!("bad source pattern: {e}"))
                    })?;
                    files.extend(entries.filter_map(std::result::Result::ok));
                }
            } else {
                files.push(source.clone());
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Reads every source file, returning `(path, contents)` pairs.
    async fn read_sources(&self) -> BackendResult<Vec<(PathBuf, String)>> {
        let mut contents = Vec::new();
        for path in self.source_files()? {
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                BackendError::connection(BACKEND, format!("cannot read {}: {e}", path.display()))
            })?;
            contents.push((path, text));
        }
        Ok(contents)
    }

    /// Loads and flattens every source into a single key map.
    async fn load(&self) -> BackendResult<BTreeMap<String, String>> {
        let mut flat = BTreeMap::new();

        for (path, text) in self.read_sources().await? {
            let document: Value = serde_yaml::from_str(&text).map_err(|e| {
                BackendError::protocol(BACKEND, format!("cannot parse {}: {e}", path.display()))
            })?;
            flatten(&document, "", &mut flat);
        }

        Ok(flat)
    }

    /// Computes the fingerprint of the current source contents.
    async fn fingerprint(&self) -> BackendResult<String> {
        let mut hasher = Sha256::new();
        for (path, text) in self.read_sources().await? {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(text.as_bytes());
            hasher.update([0]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Records the current fingerprint and returns the matching revision.
    async fn observe(&self) -> BackendResult<u64> {
        let fingerprint = self.fingerprint().await?;
        let mut tracker = self.tracker.lock().await;

        match &tracker.fingerprint {
            Some(previous) if *previous == fingerprint => {}
            Some(_) => {
                tracker.revision += 1;
                debug!("file store: sources changed, revision {}", tracker.revision);
                tracker.fingerprint = Some(fingerprint);
            }
            None => tracker.fingerprint = Some(fingerprint),
        }

        Ok(tracker.revision)
    }
}

/// Flattens a YAML value into `path -> scalar` pairs.
fn flatten(value: &Value, path: &str, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let Some(segment) = scalar_to_string(key) else {
                    continue;
                };
                flatten(child, &format!("{path}/{segment}"), out);
            }
        }
        Value::Sequence(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten(child, &format!("{path}/{index}"), out);
            }
        }
        Value::Tagged(tagged) => flatten(&tagged.value, path, out),
        scalar => {
            let key = if path.is_empty() { "/" } else { path };
            out.insert(key.to_string(), scalar_to_string(scalar).unwrap_or_default());
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => None,
    }
}

#[async_trait]
impl StoreClient for FileStore {
    async fn get_values(&self, keys: &[String]) -> BackendResult<BTreeMap<String, String>> {
        let flat = self.load().await?;

        Ok(flat
            .into_iter()
            .filter(|(key, _)| keys.iter().any(|root| is_under(key, root)))
            .collect())
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        _keys: &[String],
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> BackendResult<u64> {
        let current = self.observe().await?;
        if wait_index == 0 || current > wait_index {
            return Ok(current);
        }

        let deadline = tokio::time::sleep(self.watch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(wait_index),
                () = &mut deadline => return Ok(wait_index),
                () = tokio::time::sleep(self.poll_interval) => {
                    let current = self.observe().await?;
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
