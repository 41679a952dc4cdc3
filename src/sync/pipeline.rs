//! The sync pipeline.
//!
//! One execution takes a resource from fetched values to an applied (and
//! optionally reloaded) destination file. Steps run in a fixed order and
//! the first failing step ends the execution; nothing after a failed step
//! touches the destination.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::StoreClient;
use crate::error::SyncError;
use crate::resource::{Resource, Snapshot};

use super::command::{render_command, run_command};
use super::render::render;
use super::stage::StageFile;

/// Mode used when neither the resource nor an existing destination gives one.
pub const DEFAULT_MODE: u32 = 0o644;

/// Result of one successful pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    /// The destination already matched the rendered output.
    Unchanged,
    /// The destination differs, but no-op mode left it alone.
    DryRun,
    /// The destination was replaced.
    Applied {
        /// Whether the reload command ran.
        reloaded: bool,
    },
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::DryRun => write!(f, "dry-run"),
            Self::Applied { reloaded: true } => write!(f, "applied, reloaded"),
            Self::Applied { reloaded: false } => write!(f, "applied"),
        }
    }
}

/// Runs the sync pipeline against a store client.
#[derive(Clone)]
pub struct SyncPipeline {
    client: Arc<dyn StoreClient>,
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("backend", &self.client.backend_type())
            .finish()
    }
}

impl SyncPipeline {
    /// Creates a pipeline reading from `client`.
    #[must_use]
    pub fn new(client: Arc<dyn StoreClient>) -> Self {
        Self { client }
    }

    /// Returns the store client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn StoreClient> {
        &self.client
    }

    /// Executes the pipeline once for `resource`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that fails.
    pub async fn run(&self, resource: &mut Resource) -> Result<SyncOutcome, SyncError> {
        let id = resource.id();
        debug!("Syncing {id}");

        let mode = resolve_mode(resource).await.map_err(|e| SyncError::Mode {
            resource: id.clone(),
            message: e.to_string(),
        })?;

        let keys = resource.prefixed_keys();
        let values = self
            .client
            .get_values(&keys)
            .await
            .map_err(|source| SyncError::Fetch {
                resource: id.clone(),
                source,
            })?;
        debug!("{id}: fetched {} value(s) for {} key(s)", values.len(), keys.len());
        let snapshot = resource.replace_snapshot(Snapshot::from_values(&resource.prefix, values));

        let rendered = render(resource, &snapshot).await?;

        let stage = StageFile::create(
            &resource.dest,
            rendered.as_bytes(),
            mode,
            resource.uid,
            resource.gid,
        )
        .await
        .map_err(|source| SyncError::Stage {
            resource: id.clone(),
            path: resource.dest.clone(),
            source,
        })?;

        let unchanged = stage
            .matches(&resource.dest)
            .await
            .map_err(|source| SyncError::Apply {
                resource: id.clone(),
                dest: resource.dest.clone(),
                source,
            })?;

        if unchanged {
            debug!("Target config {} in sync", resource.dest.display());
            if resource.flags.keep_stage_file {
                let kept = stage.keep();
                info!("Keeping staged file: {}", kept.display());
            } else {
                discard(stage).await;
            }
            return Ok(SyncOutcome::Unchanged);
        }

        info!("Target config {} out of sync", resource.dest.display());

        if resource.flags.noop {
            warn!("Noop mode enabled, {} will not be modified", resource.dest.display());
            discard(stage).await;
            return Ok(SyncOutcome::DryRun);
        }

        if let Some(check) = &resource.check_cmd {
            if let Err(e) = check_stage(&id, check, stage.path(), &resource.dest).await {
                discard(stage).await;
                return Err(e);
            }
        }

        debug!("Overwriting target config {}", resource.dest.display());
        stage
            .persist(&resource.dest)
            .await
            .map_err(|source| SyncError::Apply {
                resource: id.clone(),
                dest: resource.dest.clone(),
                source,
            })?;
        info!("Target config {} has been updated", resource.dest.display());

        if resource.flags.sync_only {
            return Ok(SyncOutcome::Applied { reloaded: false });
        }

        let Some(reload) = &resource.reload_cmd else {
            return Ok(SyncOutcome::Applied { reloaded: false });
        };
        reload_service(&id, reload, &resource.src, &resource.dest).await?;
        Ok(SyncOutcome::Applied { reloaded: true })
    }
}

/// Resolves the destination mode: explicit, else inherited, else `0644`.
async fn resolve_mode(resource: &Resource) -> io::Result<u32> {
    if let Some(mode) = resource.mode {
        return Ok(mode);
    }

    match tokio::fs::metadata(&resource.dest).await {
        Ok(meta) => Ok(meta.mode() & 0o7777),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DEFAULT_MODE),
        Err(e) => Err(e),
    }
}

async fn discard(stage: StageFile) {
    let path = stage.path().to_path_buf();
    if let Err(e) = stage.discard().await {
        warn!("Cannot remove stage file {}: {e}", path.display());
    }
}

async fn check_stage(id: &str, template: &str, stage: &Path, dest: &Path) -> Result<(), SyncError> {
    let command = render_command(template, stage, dest).map_err(|e| SyncError::Validation {
        resource: id.to_string(),
        command: template.to_string(),
        message: format!("cannot expand command: {e}"),
    })?;

    debug!("Running check command {command:?}");
    let result = run_command(&command).await.map_err(|e| SyncError::Validation {
        resource: id.to_string(),
        command: command.clone(),
        message: format!("cannot spawn: {e}"),
    })?;

    if result.success {
        Ok(())
    } else {
        Err(SyncError::Validation {
            resource: id.to_string(),
            command,
            message: result.describe(),
        })
    }
}

async fn reload_service(id: &str, template: &str, src: &Path, dest: &Path) -> Result<(), SyncError> {
    let command = render_command(template, src, dest).map_err(|e| SyncError::Reload {
        resource: id.to_string(),
        command: template.to_string(),
        message: format!("cannot expand command: {e}"),
    })?;

    debug!("Running reload command {command:?}");
    let result = run_command(&command).await.map_err(|e| SyncError::Reload {
        resource: id.to_string(),
        command: command.clone(),
        message: format!("cannot spawn: {e}"),
    })?;

    if !result.success {
        return Err(SyncError::Reload {
            resource: id.to_string(),
            command,
            message: result.describe(),
        });
    }

    info!("Reloaded {id}");
    Ok(())
}
