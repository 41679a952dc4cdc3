//! Template rendering.

use std::sync::Arc;

use minijinja::{context, Environment, UndefinedBehavior};
use tracing::debug;

use crate::error::SyncError;
use crate::resource::{Resource, Snapshot};

/// Renders the resource's template source against `snapshot`.
///
/// # Errors
///
/// Returns an error if the source cannot be read or evaluation fails.
pub async fn render(resource: &Resource, snapshot: &Arc<Snapshot>) -> Result<String, SyncError> {
    let source = tokio::fs::read_to_string(&resource.src)
        .await
        .map_err(|e| SyncError::Template {
            resource: resource.id(),
            path: resource.src.clone(),
            source: e,
        })?;

    let name = resource.src.display().to_string();
    debug!("Rendering {name} with {} value(s)", snapshot.len());

    render_source(resource, snapshot, &name, &source)
}

/// Renders an already loaded template source.
///
/// # Errors
///
/// Returns an error if evaluation fails.
pub fn render_source(
    resource: &Resource,
    snapshot: &Arc<Snapshot>,
    name: &str,
    source: &str,
) -> Result<String, SyncError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    resource.functions.install(&mut env, snapshot);

    env.render_named_str(name, source, context! {})
        .map_err(|e| SyncError::Render {
            resource: resource.id(),
            message: e.to_string(),
        })
}
