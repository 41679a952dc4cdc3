//! etcd v3 backend.
//!
//! Talks to the JSON gateway of etcd v3 (`/v3/kv/range`, `/v3/watch`).
//! Keys and values travel base64 encoded and revisions are int64 values
//! that the gateway renders as strings. With a username set, the client
//! authenticates once and sends the token with every request.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::BackendError;

use super::client::{is_under, BackendResult, StoreClient};
use super::transport::{http_client, NodePool, TlsFiles};

/// Backend type name.
const BACKEND: &str = "etcdv3";

/// Timeout for plain (non-streaming) requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound for a single watch call.
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Username and password exchanged for an auth token.
#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
}

/// etcd v3 gateway client.
#[derive(Debug)]
pub struct EtcdV3Store {
    client: Client,
    pool: NodePool,
    credentials: Option<Credentials>,
    token: Mutex<Option<String>>,
    watch_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    count_only: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default, deserialize_with = "revision")]
    revision: u64,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "revision")]
    mod_revision: u64,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreate,
}

#[derive(Debug, Serialize)]
struct WatchCreate {
    key: String,
    range_end: String,
    start_revision: u64,
}

#[derive(Debug, Deserialize)]
struct WatchMessage {
    #[serde(default)]
    result: Option<WatchResult>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    canceled: bool,
    #[serde(default, deserialize_with = "revision")]
    compact_revision: u64,
    #[serde(default)]
    cancel_reason: String,
}

#[derive(Debug, Deserialize)]
struct Event {
    kv: KeyValue,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    http_code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

/// Reads an int64 the gateway may render as a string or a number.
fn revision<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&STANDARD, bytes)
}

fn decode(field: &str, text: &str) -> BackendResult<String> {
    let bytes = base64::Engine::decode(&STANDARD, text).map_err(|e| {
        BackendError::protocol(BACKEND, format!("Invalid base64 in {field}: {e}"))
    })?;
    String::from_utf8(bytes)
        .map_err(|e| BackendError::protocol(BACKEND, format!("Non UTF-8 {field}: {e}")))
}

/// Returns the end of the key range covering every key starting with `key`.
fn prefix_end(key: &str) -> Vec<u8> {
    let mut end = key.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

impl EtcdV3Store {
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
            token: Mutex::new(None),
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
        })
    }

    /// Sets the credentials exchanged for an auth token.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.unwrap_or_default(),
        });
        self
    }

    /// Sets the upper bound for a single watch call.
    #[must_use]
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Returns the auth token, authenticating first if needed.
    async fn token(&self) -> BackendResult<Option<String>> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };

        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(Some(token.clone()));
        }

        debug!("etcdv3: authenticating as {}", credentials.username);
        let body = AuthRequest {
            name: &credentials.username,
            password: &credentials.password,
        };
        let response = self
            .pool
            .send(|node| {
                self.client
                    .post(format!("{node}/v3/auth/authenticate"))
                    .timeout(REQUEST_TIMEOUT)
                    .json(&body)
            })
            .await?;
        let auth: AuthResponse = Self::decode_response(response, "authenticate").await?;

        *token = Some(auth.token.clone());
        Ok(Some(auth.token))
    }

    /// Posts `body` to `path` on the first node that answers.
    async fn post<T>(&self, path: &str, body: &T, timeout: Option<Duration>) -> BackendResult<Response>
    where
        T: Serialize + Sync,
    {
        let token = self.token().await?;

        let response = self
            .pool
            .send(|node| {
                let url = format!("{node}{path}");
                trace!("etcdv3 POST {url}");

                let mut request = self.client.post(url).json(body);
                if let Some(timeout) = timeout {
                    request = request.timeout(timeout);
                }
                if let Some(token) = &token {
                    request = request.header(reqwest::header::AUTHORIZATION, token);
                }
                request
            })
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // Expired or revoked tokens are replaced on the next request.
            *self.token.lock().await = None;
        }
        Ok(response)
    }

    /// Decodes a successful JSON response, or turns a gateway error into a
    /// protocol error.
    async fn decode_response<R>(response: Response, operation: &str) -> BackendResult<R>
    where
        R: DeserializeOwned,
    {
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            BackendError::connection(BACKEND, format!("Failed to read response: {e}"))
        })?;

        if !status.is_success() {
            let error: GatewayError = serde_json::from_str(&body).unwrap_or_default();
            let message = if error.message.is_empty() {
                if error.error.is_empty() { body } else { error.error }
            } else {
                error.message
            };
            return Err(BackendError::protocol(
                BACKEND,
                format!("{operation} failed (HTTP {}): {message}", status.as_u16()),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            BackendError::protocol(BACKEND, format!("Failed to parse {operation} response: {e}"))
        })
    }

    /// Reads every key starting with `key`.
    async fn range(&self, key: &str, count_only: bool) -> BackendResult<RangeResponse> {
        let request = RangeRequest {
            key: encode(key.as_bytes()),
            range_end: encode(&prefix_end(key)),
            count_only,
        };
        let response = self
            .post("/v3/kv/range", &request, Some(REQUEST_TIMEOUT))
            .await?;
        Self::decode_response(response, "range").await
    }

    /// Streams watch results under `prefix` until one touches `keys`.
    async fn wait_once(&self, prefix: &str, keys: &[String], wait_index: u64) -> BackendResult<u64> {
        let request = WatchRequest {
            create_request: WatchCreate {
                key: encode(prefix.as_bytes()),
                range_end: encode(&prefix_end(prefix)),
                start_revision: wait_index + 1,
            },
        };
        let mut response = self.post("/v3/watch", &request, None).await?;
        if !response.status().is_success() {
            return Self::decode_response::<WatchMessage>(response, "watch")
                .await
                .map(|_| wait_index);
        }

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                BackendError::connection(BACKEND, format!("Watch stream failed: {e}"))
            })?;
            let Some(chunk) = chunk else {
                return Err(BackendError::connection(BACKEND, "watch stream closed"));
            };
            buffer.extend_from_slice(&chunk);

            let consumed = {
                let mut messages =
                    serde_json::Deserializer::from_slice(&buffer).into_iter::<WatchMessage>();
                let mut consumed = 0;
                loop {
                    match messages.next() {
                        Some(Ok(message)) => {
                            consumed = messages.byte_offset();
                            if let Some(index) = Self::accept(message, keys, wait_index)? {
                                return Ok(index);
                            }
                        }
                        Some(Err(e)) if e.is_eof() => break,
                        Some(Err(e)) => {
                            return Err(BackendError::protocol(
                                BACKEND,
                                format!("Invalid watch message: {e}"),
                            ));
                        }
                        None => break,
                    }
                }
                consumed
            };
            buffer = buffer.split_off(consumed);
        }
    }

    /// Returns the index to report for one watch message, if it warrants a
    /// sync.
    fn accept(message: WatchMessage, keys: &[String], wait_index: u64) -> BackendResult<Option<u64>> {
        if let Some(error) = message.error {
            return Err(BackendError::protocol(
                BACKEND,
                format!("watch failed (HTTP {}): {}", error.http_code, error.message),
            ));
        }
        let Some(result) = message.result else {
            return Ok(None);
        };

        if result.canceled {
            if result.compact_revision > 0 {
                debug!(
                    "etcdv3: revision {} compacted, resyncing",
                    result.compact_revision
                );
                return Ok(Some(result.header.revision.max(wait_index + 1)));
            }
            return Err(BackendError::protocol(
                BACKEND,
                format!("watch canceled: {}", result.cancel_reason),
            ));
        }

        for event in result.events {
            let key = decode("key", &event.kv.key)?;
            if keys.is_empty() || keys.iter().any(|root| is_under(&key, root)) {
                let index = if event.kv.mod_revision > 0 {
                    event.kv.mod_revision
                } else {
                    result.header.revision
                };
                return Ok(Some(index.max(wait_index + 1)));
            }
            trace!("etcdv3: ignoring change to {key}");
        }

        Ok(None)
    }
}

#[async_trait]
impl StoreClient for EtcdV3Store {
    async fn get_values(&self, keys: &[String]) -> BackendResult<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();

        for key in keys {
            let response = self.range(key, false).await?;
            if response.kvs.is_empty() {
                trace!("etcdv3: {key} not found");
            }

            for kv in response.kvs {
                let name = decode("key", &kv.key)?;
                // Range ends cover siblings sharing the prefix, like /apple for /app.
                if is_under(&name, key) {
                    values.insert(name, decode("value", &kv.value)?);
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
            let response = self.range(prefix, true).await?;
            return Ok(response.header.revision.max(1));
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
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn b64(text: &str) -> String {
        encode(text.as_bytes())
    }

    fn kv(key: &str, value: &str, revision: u64) -> serde_json::Value {
        json!({
            "key": b64(key),
            "value": b64(value),
            "create_revision": revision.to_string(),
            "mod_revision": revision.to_string(),
            "version": "1"
        })
    }

    fn watch_message(revision: u64, events: &[serde_json::Value]) -> String {
        let events: Vec<serde_json::Value> = events.iter().map(|kv| json!({"kv": kv})).collect();
        json!({"result": {"header": {"revision": revision.to_string()}, "events": events}})
            .to_string()
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end("/app"), b"/apq".to_vec());
        assert_eq!(prefix_end("a\u{7f}"), b"a\x80".to_vec());
        assert_eq!(prefix_end(""), vec![0]);
    }

    #[tokio::test]
    async fn test_get_values_decodes_subtree() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .and(body_partial_json(json!({"key": b64("/app"), "range_end": b64("/apq")})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "header": {"revision": "7"},
                "kvs": [
                    kv("/app/db/host", "10.0.0.1", 5),
                    kv("/app/db/port", "5432", 6),
                    kv("/apple", "fruit", 7)
                ],
                "count": "3"
            })))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
        let values = store
            .get_values(&[String::from("/app")])
            .await
            .expect("get_values failed");

        assert_eq!(values.len(), 2);
        assert_eq!(values.get("/app/db/host").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(values.get("/app/db/port").map(String::as_str), Some("5432"));
    }

    #[tokio::test]
    async fn test_missing_key_is_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"header": {"revision": "7"}})),
            )
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
        let values = store
            .get_values(&[String::from("/missing")])
            .await
            .expect("get_values failed");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_authenticates_and_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/auth/authenticate"))
            .and(body_partial_json(json!({"name": "agent", "password": "s3cret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "header": {"revision": "7"},
                "token": "tok.42"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .and(header("authorization", "tok.42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "header": {"revision": "7"},
                "kvs": [kv("/app/name", "web", 3)]
            })))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()])
            .expect("Failed to create store")
            .with_credentials("agent", Some(String::from("s3cret")));
        for _ in 0..2 {
            let values = store
                .get_values(&[String::from("/app")])
                .await
                .expect("get_values failed");
            assert_eq!(values.get("/app/name").map(String::as_str), Some("web"));
        }
    }

    #[tokio::test]
    async fn test_rejected_request_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "etcdserver: user name is empty",
                "code": 16,
                "message": "etcdserver: user name is empty"
            })))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");

        let err = store
            .get_values(&[String::from("/app")])
            .await
            .expect_err("rejected range should fail");
        assert!(matches!(err, BackendError::Protocol { .. }));
        assert!(err.to_string().contains("user name is empty"));

        let err = store
            .watch_prefix("/app", &[], 0, &CancellationToken::new())
            .await
            .expect_err("rejected zero index watch should fail");
        assert!(matches!(err, BackendError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_zero_index_watch_returns_revision() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .and(body_partial_json(json!({"count_only": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "header": {"revision": "42"},
                "count": "2"
            })))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
        let index = store
            .watch_prefix("/app", &[], 0, &CancellationToken::new())
            .await
            .expect("watch failed");
        assert_eq!(index, 42);
    }

    #[tokio::test]
    async fn test_watch_skips_unrelated_events() {
        let created = json!({"result": {"header": {"revision": "7"}, "created": true}});
        let stream = format!(
            "{created}\n{}\n{}\n",
            watch_message(8, &[kv("/app/cache/size", "64", 8)]),
            watch_message(9, &[kv("/app/db/host", "10.0.0.2", 9)]),
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/watch"))
            .and(body_partial_json(json!({"create_request": {"start_revision": 8}})))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
        let index = store
            .watch_prefix("/app", &[String::from("/app/db")], 7, &CancellationToken::new())
            .await
            .expect("watch failed");
        assert_eq!(index, 9);
    }

    #[tokio::test]
    async fn test_compacted_revision_forces_resync() {
        let stream = json!({"result": {
            "header": {"revision": "2000"},
            "canceled": true,
            "compact_revision": "1500"
        }})
        .to_string();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
        let index = store
            .watch_prefix("/app", &[], 3, &CancellationToken::new())
            .await
            .expect("watch failed");
        assert_eq!(index, 2000);
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                json!({"result": {"header": {"revision": "7"}, "created": true}}).to_string(),
            ))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
        let err = store
            .watch_prefix("/app", &[], 7, &CancellationToken::new())
            .await
            .expect_err("closed stream should fail");
        assert!(matches!(err, BackendError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_watch_returns_wait_index_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/watch"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(10))
                    .set_body_string(watch_message(9, &[kv("/app/db/host", "x", 9)])),
            )
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![server.uri()]).expect("Failed to create store");
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

    #[tokio::test]
    async fn test_fails_over_to_next_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "header": {"revision": "7"},
                "kvs": [kv("/app/name", "web", 3)]
            })))
            .mount(&server)
            .await;

        let store = EtcdV3Store::new(vec![String::from("http://127.0.0.1:1"), server.uri()])
            .expect("Failed to create store");
        let values = store
            .get_values(&[String::from("/app")])
            .await
            .expect("get_values failed");

        assert_eq!(values.len(), 1);
        assert_eq!(store.pool.active(), 1);
    }
}
