//! etcd v2 backend.
//!
//! Talks to the etcd v2 keys HTTP API, for clusters that still serve it.
//! Requests go through a [`NodePool`] so that an unavailable node fails
//! over to the next one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::BackendError;

use super::client::{is_under, BackendResult, StoreClient};
use super::transport::{http_client, NodePool, TlsFiles};

/// Backend type name.
const BACKEND: &str = "etcd";

/// Timeout for plain (non-waiting) requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound for a single watch call.
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Header carrying the cluster-wide index.
const INDEX_HEADER: &str = "X-Etcd-Index";

/// etcd error code: key not found.
const ERROR_KEY_NOT_FOUND: u64 = 100;

/// etcd error code: the requested event index has been cleared.
const ERROR_EVENT_INDEX_CLEARED: u64 = 401;

/// Basic auth credentials.
#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: Option<String>,
}

/// etcd v2 client.
#[derive(Debug)]
pub struct EtcdStore {
    client: Client,
    pool: NodePool,
    credentials: Option<Credentials>,
    watch_timeout: Duration,
}

/// Successful keys API response.
#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Option<Node>,
}

/// A node in the etcd key tree.
#[derive(Debug, Deserialize)]
struct Node {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

/// Error body returned by the keys API.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    index: u64,
}

/// Raw answer from one node.
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    index: Option<u64>,
    body: String,
}

/// Decoded answer.
#[derive(Debug)]
enum Answer {
    Found { index: Option<u64>, node: Option<Node> },
    Failed(ErrorBody),
}

impl EtcdStore {
    /// Creates a client for the given node URLs.
    ///
    /// # Errors
    ///
    /// Returns an error if no node is given or the HTTP client cannot be
    /// created.
    pub fn new(nodes: Vec<String>) -> BackendResult<Self> {
        Self::with_tls(nodes, &TlsFiles::default())
    }

    /// Creates a client that presents and trusts the given TLS material.
    ///
    /// # Errors
    ///
    /// Returns an error if no node is given or a TLS file is unusable.
    pub fn with_tls(nodes: Vec<String>, tls: &TlsFiles) -> BackendResult<Self> {
        Ok(Self {
            pool: NodePool::new(BACKEND, nodes)?,
            client: http_client(BACKEND, tls)?,
            credentials: None,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
        })
    }

    /// Sets basic auth credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password,
        });
        self
    }

    /// Sets the upper bound for a single watch call.
    #[must_use]
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Sends a GET for `key` to the first node that answers.
    async fn send(
        &self,
        key: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> BackendResult<Reply> {
        let response = self
            .pool
            .send(|node| {
                let url = format!("{node}/v2/keys{key}");
                trace!("etcd GET {url} {query:?}");

                let mut request = self.client.get(url).query(query);
                if let Some(timeout) = timeout {
                    request = request.timeout(timeout);
                }
                if let Some(creds) = &self.credentials {
                    request = request.basic_auth(&creds.username, creds.password.as_deref());
                }
                request
            })
            .await?;

        let status = response.status();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let body = response.text().await.map_err(|e| {
            BackendError::connection(BACKEND, format!("Failed to read response: {e}"))
        })?;

        Ok(Reply {
            status,
            index,
            body,
        })
    }

    /// Sends a request and decodes the answer.
    async fn query(
        &self,
        key: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> BackendResult<Answer> {
        let reply = self.send(key, query, timeout).await?;

        if reply.status.is_success() {
            let decoded: KeysResponse = serde_json::from_str(&reply.body).map_err(|e| {
                BackendError::protocol(BACKEND, format!("Failed to parse response: {e}"))
            })?;
            return Ok(Answer::Found {
                index: reply.index,
                node: decoded.node,
            });
        }

        match serde_json::from_str::<ErrorBody>(&reply.body) {
            Ok(error) => Ok(Answer::Failed(error)),
            Err(_) => Err(BackendError::protocol(
                BACKEND,
                format!("HTTP {}: {}", reply.status.as_u16(), reply.body),
            )),
        }
    }

    /// Waits for one event past `wait_index` under `prefix`.
    async fn wait_once(&self, prefix: &str, keys: &[String], wait_index: u64) -> BackendResult<u64> {
        let mut after = wait_index;

        loop {
            let query = [
                ("wait", String::from("true")),
                ("recursive", String::from("true")),
                ("waitIndex", (after + 1).to_string()),
            ];

            match self.query(prefix, &query, None).await? {
                Answer::Found { index, node } => {
                    let Some(node) = node else {
                        return Ok(index.unwrap_or(after + 1).max(after + 1));
                    };
                    let modified = if node.modified_index > 0 {
                        node.modified_index
                    } else {
                        index.unwrap_or(after + 1)
                    };

                    if keys.is_empty() || keys.iter().any(|root| is_under(&node.key, root)) {
                        return Ok(modified);
                    }
                    trace!("etcd: ignoring change to {}", node.key);
                    after = modified.max(after + 1);
                }
                Answer::Failed(error) if error.error_code == ERROR_EVENT_INDEX_CLEARED => {
                    debug!("etcd: event index cleared, resyncing at {}", error.index);
                    return Ok(error.index.max(after + 1));
                }
                Answer::Failed(error) => {
                    return Err(BackendError::protocol(
                        BACKEND,
                        format!("watch failed ({}): {}", error.error_code, error.message),
                    ));
                }
            }
        }
    }
}

/// Collects every leaf value of `node` into `out`.
fn collect_leaves(node: Node, out: &mut BTreeMap<String, String>) {
    if node.dir {
        for child in node.nodes {
            collect_leaves(child, out);
        }
    } else if let Some(value) = node.value {
        out.insert(node.key, value);
    }
}

#[async_trait]
impl StoreClient for EtcdStore {
    async fn get_values(&self, keys: &[String]) -> BackendResult<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        let query = [("recursive", String::from("true"))];

        for key in keys {
            match self.query(key, &query, Some(REQUEST_TIMEOUT)).await? {
                Answer::Found { node, .. } => {
                    if let Some(node) = node {
                        collect_leaves(node, &mut values);
                    }
                }
                Answer::Failed(error) if error.error_code == ERROR_KEY_NOT_FOUND => {
                    trace!("etcd: {key} not found");
                }
                Answer::Failed(error) => {
                    return Err(BackendError::protocol(
                        BACKEND,
                        format!("get {key} failed ({}): {}", error.error_code, error.message),
                    ));
                }
            }
        }

        Ok(values)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> BackendResult<u64> {
        if wait_index == 0 {
            let index = match self.query(prefix, &[], Some(REQUEST_TIMEOUT)).await? {
                Answer::Found { index, .. } => index.unwrap_or(1),
                Answer::Failed(error) if error.error_code == ERROR_KEY_NOT_FOUND => error.index,
                Answer::Failed(error) => {
                    return Err(BackendError::protocol(
                        BACKEND,
                        format!("watch {prefix} failed ({}): {}", error.error_code, error.message),
                    ));
                }
            };
            return Ok(index.max(1));
        }

        tokio::select! {
            () = cancel.cancelled() => Ok(wait_index),
            () = tokio::time::sleep(self.watch_timeout) => Ok(wait_index),
            result = self.wait_once(prefix, keys, wait_index) => result,
        }
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tree() -> serde_json::Value {
        json!({
            "action": "get",
            "node": {
                "key": "/app",
                "dir": true,
                "nodes": [
                    {
                        "key": "/app/db",
                        "dir": true,
                        "nodes": [
                            {"key": "/app/db/host", "value": "10.0.0.1", "modifiedIndex": 5},
                            {"key": "/app/db/port", "value": "5432", "modifiedIndex": 6}
                        ]
                    }
                ]
            }
        })
    }

    #[tokio::test]
    async fn test_get_values_flattens_tree() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .and(query_param("recursive", "true"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INDEX_HEADER, "7")
                    .set_body_json(tree()),
            )
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let values = store
            .get_values(&[String::from("/app")])
            .await
            .expect("get_values failed");

        assert_eq!(values.len(), 2);
        assert_eq!(values.get("/app/db/host").map(String::as_str), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_missing_key_is_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errorCode": 100,
                "message": "Key not found",
                "cause": "/missing",
                "index": 7
            })))
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let values = store
            .get_values(&[String::from("/missing")])
            .await
            .expect("get_values failed");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_fails_over_to_next_node() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tree()))
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![String::from("http://127.0.0.1:1"), server.uri()])
            .expect("Failed to create store");
        let values = store
            .get_values(&[String::from("/app")])
            .await
            .expect("get_values failed");

        assert_eq!(values.len(), 2);
        assert_eq!(store.pool.active(), 1);
    }

    #[tokio::test]
    async fn test_all_nodes_down_is_connection_error() {
        let store = EtcdStore::new(vec![String::from("http://127.0.0.1:1")])
            .expect("Failed to create store");

        let err = store
            .get_values(&[String::from("/app")])
            .await
            .expect_err("unreachable node should fail");
        assert!(matches!(err, BackendError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_zero_index_watch_returns_cluster_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INDEX_HEADER, "42")
                    .set_body_json(tree()),
            )
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let cancel = CancellationToken::new();
        let index = store
            .watch_prefix("/app", &[], 0, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, 42);
    }

    #[tokio::test]
    async fn test_zero_index_watch_on_missing_prefix_returns_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errorCode": 100,
                "message": "Key not found",
                "index": 12
            })))
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let index = store
            .watch_prefix("/app", &[], 0, &CancellationToken::new())
            .await
            .expect("watch failed");
        assert_eq!(index, 12);
    }

    #[tokio::test]
    async fn test_zero_index_watch_rejected_credentials_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "errorCode": 110,
                "message": "The request requires user authentication",
                "cause": "Insufficient credentials",
                "index": 0
            })))
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()])
            .expect("Failed to create store")
            .with_credentials("agent", Some(String::from("wrong")));
        let err = store
            .watch_prefix("/app", &[String::from("/app")], 0, &CancellationToken::new())
            .await
            .expect_err("rejected credentials should fail");

        assert!(matches!(err, BackendError::Protocol { .. }));
        assert!(err.to_string().contains("110"));
    }

    #[tokio::test]
    async fn test_watch_returns_modified_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .and(query_param("wait", "true"))
            .and(query_param("waitIndex", "8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "set",
                "node": {"key": "/app/db/host", "value": "10.0.0.2", "modifiedIndex": 9}
            })))
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let cancel = CancellationToken::new();
        let index = store
            .watch_prefix("/app", &[String::from("/app/db")], 7, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, 9);
    }

    #[tokio::test]
    async fn test_cleared_event_index_forces_resync() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .and(query_param("wait", "true"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errorCode": 401,
                "message": "The event in requested index is outdated and cleared",
                "index": 2000
            })))
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let cancel = CancellationToken::new();
        let index = store
            .watch_prefix("/app", &[], 3, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, 2000);
    }

    #[tokio::test]
    async fn test_watch_returns_wait_index_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/app"))
            .and(query_param("wait", "true"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(10))
                    .set_body_json(tree()),
            )
            .mount(&server)
            .await;

        let store = EtcdStore::new(vec![server.uri()]).expect("Failed to create store");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let index = store
            .watch_prefix("/app", &[], 5, &cancel)
            .await
            .expect("watch failed");
        assert_eq!(index, 5);
    }
}
