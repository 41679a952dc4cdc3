//! Per-cycle local copy of fetched values.
//!
//! Keys are stored relative to the resource prefix, always with a leading
//! `/`. A snapshot is immutable once built; every sync cycle replaces it
//! wholesale.

use std::collections::{BTreeMap, BTreeSet};

use glob::{MatchOptions, Pattern};
use serde::Serialize;

use crate::backend::is_under;

/// A key and its value, as returned by `get` and `gets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvPair {
    /// Normalized key.
    pub key: String,
    /// Raw value.
    pub value: String,
}

/// Ordered key-value snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, String>,
}

/// `*` and `?` never match across a `/`.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl Snapshot {
    /// Builds a snapshot from fetched values, stripping `prefix` from keys.
    #[must_use]
    pub fn from_values(prefix: &str, values: BTreeMap<String, String>) -> Self {
        let entries = values
            .into_iter()
            .map(|(key, value)| (normalize_key(prefix, &key), value))
            .collect();
        Self { entries }
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the snapshot holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the value stored at `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns every pair whose key matches the glob `pattern`, in key order.
    ///
    /// An invalid pattern matches nothing.
    #[must_use]
    pub fn matching(&self, pattern: &str) -> Vec<KvPair> {
        let Ok(pattern) = Pattern::new(pattern) else {
            return Vec::new();
        };

        self.entries
            .iter()
            .filter(|(key, _)| pattern.matches_with(key, MATCH_OPTIONS))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Returns the names of the direct children of `path`, sorted.
    #[must_use]
    pub fn children(&self, path: &str) -> Vec<String> {
        self.child_names(path, false)
    }

    /// Returns the names of the direct children of `path` that have
    /// children of their own, sorted.
    #[must_use]
    pub fn child_dirs(&self, path: &str) -> Vec<String> {
        self.child_names(path, true)
    }

    fn child_names(&self, path: &str, dirs_only: bool) -> Vec<String> {
        let root = path.trim_end_matches('/');
        let mut names = BTreeSet::new();

        for key in self.entries.keys() {
            if key == root && !dirs_only {
                if let Some(name) = key.rsplit('/').next().filter(|n| !n.is_empty()) {
                    names.insert(name.to_string());
                }
                continue;
            }
            if !is_under(key, root) || key == root {
                continue;
            }

            let rest = key[root.len()..].trim_start_matches('/');
            let mut segments = rest.split('/');
            let Some(first) = segments.next() else {
                continue;
            };
            let is_dir = segments.next().is_some();
            if !dirs_only || is_dir {
                names.insert(first.to_string());
            }
        }

        names.into_iter().collect()
    }
}

/// Strips `prefix` from `key` on a segment boundary and ensures a leading `/`.
#[must_use]
pub fn normalize_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let stripped = if !prefix.is_empty() && is_under(key, prefix) {
        &key[prefix.len()..]
    } else {
        key
    };

    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        let values = BTreeMap::from([
            (String::from("/app/db/host"), String::from("10.0.0.1")),
            (String::from("/app/db/port"), String::from("5432")),
            (String::from("/app/upstream/a/addr"), String::from("10.0.1.1")),
            (String::from("/app/upstream/b/addr"), String::from("10.0.1.2")),
            (String::from("/app/name"), String::from("web")),
        ]);
        Snapshot::from_values("/app", values)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("/app", "/app/db/host"), "/db/host");
        assert_eq!(normalize_key("/", "/app/db/host"), "/app/db/host");
        assert_eq!(normalize_key("/app", "/app"), "/");
        assert_eq!(normalize_key("/app", "/application/x"), "/application/x");
    }

    #[test]
    fn test_lookup() {
        let snap = snapshot();
        assert_eq!(snap.len(), 5);
        assert!(snap.exists("/db/host"));
        assert_eq!(snap.value("/db/port"), Some("5432"));
        assert_eq!(snap.value("/app/db/port"), None);
    }

    #[test]
    fn test_matching_does_not_cross_separator() {
        let snap = snapshot();

        let db: Vec<String> = snap.matching("/db/*").into_iter().map(|p| p.key).collect();
        assert_eq!(db, vec!["/db/host", "/db/port"]);

        assert!(snap.matching("/upstream/*").is_empty());
        assert_eq!(snap.matching("/upstream/*/addr").len(), 2);
    }

    #[test]
    fn test_children_and_dirs() {
        let snap = snapshot();

        assert_eq!(snap.children("/"), vec!["db", "name", "upstream"]);
        assert_eq!(snap.child_dirs("/"), vec!["db", "upstream"]);
        assert_eq!(snap.children("/upstream"), vec!["a", "b"]);
        assert_eq!(snap.children("/db/host"), vec!["host"]);
        assert!(snap.child_dirs("/db").is_empty());
    }
}
