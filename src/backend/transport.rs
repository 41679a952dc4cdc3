//! HTTP transport shared by the etcd clients.
//!
//! Builds the `reqwest` client (timeouts, optional client certificate and
//! CA bundle) and sends requests to a pool of nodes, starting from the last
//! one that answered and failing over to the next on transport errors.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Certificate, Client, Identity, RequestBuilder, Response};
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::error::BackendError;

use super::client::BackendResult;

/// Timeout for establishing a connection to a node.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS material presented to and trusted from the nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM client certificate.
    pub cert: Option<PathBuf>,
    /// PEM private key for `cert`.
    pub key: Option<PathBuf>,
    /// PEM CA bundle.
    pub ca: Option<PathBuf>,
}

impl TlsFiles {
    /// Reads the TLS paths of a backend configuration.
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            cert: config.client_cert.clone(),
            key: config.client_key.clone(),
            ca: config.client_ca_keys.clone(),
        }
    }
}

fn read_pem(backend: &'static str, path: &Path) -> BackendResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        BackendError::connection(backend, format!("Failed to read {}: {e}", path.display()))
    })
}

/// Builds the HTTP client for `backend`.
///
/// # Errors
///
/// Returns an error if a TLS file cannot be read or parsed, or if only one
/// of the client certificate and key is given.
pub fn http_client(backend: &'static str, tls: &TlsFiles) -> BackendResult<Client> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);

    match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            let mut pem = read_pem(backend, cert)?;
            pem.push(b'\n');
            pem.extend(read_pem(backend, key)?);
            let identity = Identity::from_pem(&pem).map_err(|e| {
                BackendError::connection(backend, format!("Invalid client certificate: {e}"))
            })?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(BackendError::connection(
                backend,
                "client certificate and key must be given together",
            ));
        }
    }

    if let Some(ca) = &tls.ca {
        let certificate = Certificate::from_pem(&read_pem(backend, ca)?).map_err(|e| {
            BackendError::connection(backend, format!("Invalid CA certificate: {e}"))
        })?;
        builder = builder.add_root_certificate(certificate);
    }

    builder.build().map_err(|e| {
        BackendError::connection(backend, format!("Failed to create HTTP client: {e}"))
    })
}

/// A set of equivalent nodes tried in order.
#[derive(Debug)]
pub struct NodePool {
    backend: &'static str,
    nodes: Vec<String>,
    /// Index into `nodes` of the last node that answered.
    active: AtomicUsize,
}

impl NodePool {
    /// Creates a pool over the given node URLs.
    ///
    /// # Errors
    ///
    /// Returns an error if no node is given.
    pub fn new(backend: &'static str, nodes: Vec<String>) -> BackendResult<Self> {
        if nodes.is_empty() {
            return Err(BackendError::connection(backend, "no nodes configured"));
        }

        Ok(Self {
            backend,
            nodes: nodes
                .into_iter()
                .map(|n| n.trim_end_matches('/').to_string())
                .collect(),
            active: AtomicUsize::new(0),
        })
    }

    /// Returns the index of the node used for the next request.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Sends the request built by `build` for a node base URL to the first
    /// node that answers.
    ///
    /// # Errors
    ///
    /// Returns a connection error if every node fails.
    pub async fn send<F>(&self, build: F) -> BackendResult<Response>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let start = self.active();
        let mut last_error = String::new();

        for offset in 0..self.nodes.len() {
            let slot = (start + offset) % self.nodes.len();
            let node = &self.nodes[slot];

            match build(node).send().await {
                Ok(response) => {
                    if slot != start {
                        debug!("{}: switched to node {node}", self.backend);
                        self.active.store(slot, Ordering::Relaxed);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    warn!("{}: node {node} unavailable: {e}", self.backend);
                    last_error = e.to_string();
                }
            }
        }

        Err(BackendError::connection(
            self.backend,
            format!("all nodes failed, last error: {last_error}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_client_builds() {
        assert!(http_client("etcdv3", &TlsFiles::default()).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let tls = TlsFiles {
            ca: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsFiles::default()
        };

        let err = http_client("etcdv3", &tls).expect_err("missing CA should fail");
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_garbage_identity_is_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client.key");
        std::fs::write(&cert, "not a certificate").expect("Failed to write cert");
        std::fs::write(&key, "not a key").expect("Failed to write key");

        let tls = TlsFiles {
            cert: Some(cert),
            key: Some(key),
            ca: None,
        };
        assert!(http_client("etcdv3", &tls).is_err());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let tls = TlsFiles {
            cert: Some(PathBuf::from("/etc/ssl/client.pem")),
            ..TlsFiles::default()
        };
        assert!(http_client("etcdv3", &tls).is_err());
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(NodePool::new("etcdv3", Vec::new()).is_err());
    }
}
