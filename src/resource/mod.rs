//! Template resources.
//!
//! This module provides:
//! - The resource definition format and its loader
//! - The in-memory resource record each sync operates on
//! - Per-cycle value snapshots and the template function environment
//! - Secret value decryption

mod crypt;
mod functions;
mod loader;
mod snapshot;
mod spec;
mod types;

pub use crypt::Decryptor;
pub use functions::{FunctionContext, FunctionSet, TemplateFunction};
pub use loader::{LoadReport, ResourceLoader};
pub use snapshot::{normalize_key, KvPair, Snapshot};
pub use spec::{parse_mode, ResourceDefinition, ResourceFile, UNSET_ID};
pub use types::{normalize_prefix, Resource, ResourceSummary, SyncFlags};
