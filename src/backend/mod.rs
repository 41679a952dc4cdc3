//! Key-value backends.
//!
//! This module provides the backends resource values are read from:
//! - etcd v3 (JSON gateway), the default
//! - etcd v2 (keys HTTP API)
//! - YAML/JSON files
//! - Process environment
//! - In-memory, for embedding and tests

// The generated mock types carry no docs.
#[cfg_attr(test, allow(missing_docs))]
mod client;
mod env;
mod etcd;
mod etcdv3;
mod file;
mod memory;
mod transport;

use std::sync::Arc;

use tracing::info;

use crate::config::BackendConfig;
use crate::error::{ConfigError, Result};

pub use client::{append_prefix, is_under, join_key, BackendResult, StoreClient};
#[cfg(test)]
pub use client::MockStoreClient;
pub use env::EnvStore;
pub use etcd::EtcdStore;
pub use etcdv3::EtcdV3Store;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use transport::TlsFiles;

/// Creates the store client named by the configuration.
///
/// # Errors
///
/// Returns an error if the backend name is unknown or the client cannot be
/// created.
pub fn new_store_client(config: &BackendConfig) -> Result<Arc<dyn StoreClient>> {
    let client: Arc<dyn StoreClient> = match config.name.as_str() {
        "etcdv3" => {
            info!("Backend: etcdv3, nodes {}", config.nodes.join(", "));
            let tls = TlsFiles::from_config(config);
            let mut store = EtcdV3Store::with_tls(config.nodes.clone(), &tls)?
                .with_watch_timeout(config.watch_timeout());
            if let Some(username) = &config.username {
                store = store.with_credentials(username.clone(), config.password.clone());
            }
            Arc::new(store)
        }
        "etcd" => {
            info!("Backend: etcd, nodes {}", config.nodes.join(", "));
            let tls = TlsFiles::from_config(config);
            let mut store = EtcdStore::with_tls(config.nodes.clone(), &tls)?
                .with_watch_timeout(config.watch_timeout());
            if let Some(username) = &config.username {
                store = store.with_credentials(username.clone(), config.password.clone());
            }
            Arc::new(store)
        }
        "file" => {
            info!("Backend: file, {} source(s)", config.files.len());
            Arc::new(
                FileStore::new(config.files.clone())
                    .with_poll_interval(config.poll_interval())
                    .with_watch_timeout(config.watch_timeout()),
            )
        }
        "env" => {
            info!("Backend: env");
            Arc::new(EnvStore::new())
        }
        other => {
            return Err(ConfigError::UnknownBackend {
                name: other.to_string(),
            }
            .into());
        }
    };

    Ok(client)
}
