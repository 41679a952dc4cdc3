//! Resource definition discovery and loading.
//!
//! The resource directory is scanned recursively for `*.toml`, `*.yaml`
//! and `*.yml` files. A definition that cannot be turned into a resource
//! is skipped with a warning; the rest still load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{ConfigError, Result};

use super::crypt::Decryptor;
use super::functions::FunctionSet;
use super::spec::{parse_mode, ResourceDefinition, ResourceFile, UNSET_ID};
use super::types::{Resource, SyncFlags};

/// Extensions recognized as resource definitions.
const DEFINITION_EXTENSIONS: &[&str] = &["toml", "yaml", "yml"];

/// Outcome of loading the resource directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Every resource that loaded.
    pub resources: Vec<Resource>,
    /// Number of definitions that were skipped.
    pub skipped: usize,
    /// The last definition error encountered.
    pub last_error: Option<ConfigError>,
}

/// Loads resources using the agent-wide defaults.
#[derive(Debug)]
pub struct ResourceLoader {
    resource_dir: PathBuf,
    template_dir: PathBuf,
    prefix: Option<String>,
    flags: SyncFlags,
    decryptor: Option<Arc<Decryptor>>,
}

impl ResourceLoader {
    /// Creates a loader from the agent configuration, loading the keyring
    /// if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring cannot be loaded.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let decryptor = match &config.secret_keyring {
            Some(path) => {
                info!("Loading secret keyring from: {}", path.display());
                Some(Arc::new(Decryptor::from_keyring(path)?))
            }
            None => None,
        };

        Ok(Self {
            resource_dir: config.resource_dir(),
            template_dir: config.template_dir(),
            prefix: config.prefix.clone().filter(|p| !p.is_empty()),
            flags: SyncFlags {
                noop: config.noop,
                sync_only: config.sync_only,
                keep_stage_file: config.keep_stage_file,
            },
            decryptor,
        })
    }

    /// Returns the directory scanned for definitions.
    #[must_use]
    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    /// Returns the decryptor, if a keyring is configured.
    #[must_use]
    pub fn decryptor(&self) -> Option<&Arc<Decryptor>> {
        self.decryptor.as_ref()
    }

    /// Loads every definition in the resource directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource directory is missing or unreadable.
    /// Individual bad definitions are reported in the [`LoadReport`].
    pub fn load(&self) -> Result<LoadReport> {
        let paths = self.discover()?;
        info!(
            "Found {} resource definition(s) in {}",
            paths.len(),
            self.resource_dir.display()
        );

        let mut report = LoadReport::default();
        for path in paths {
            match self.load_file(&path) {
                Ok(resource) => {
                    debug!(
                        "Loaded resource {} (decrypting functions: {})",
                        resource.id(),
                        resource.functions.has_decryptor()
                    );
                    report.resources.push(resource);
                }
                Err(e) => {
                    warn!("Skipping resource definition: {e}");
                    report.skipped += 1;
                    report.last_error = Some(e);
                }
            }
        }

        Ok(report)
    }

    /// Lists definition files, sorted.
    fn discover(&self) -> Result<Vec<PathBuf>> {
        let unreadable = |message: String| ConfigError::ResourceDirUnreadable {
            path: self.resource_dir.clone(),
            message,
        };

        std::fs::read_dir(&self.resource_dir).map_err(|e| unreadable(e.to_string()))?;

        let root = glob::Pattern::escape(&self.resource_dir.to_string_lossy());
        let mut paths = Vec::new();
        for ext in DEFINITION_EXTENSIONS {
            let pattern = format!("{root}/**/*.{ext}");
            let entries = glob::glob(&pattern).map_err(|e| unreadable(e.to_string()))?;
            for entry in entries {
                match entry {
                    Ok(path) if path.is_file() => paths.push(path),
                    Ok(_) => {}
                    Err(e) => warn!("Cannot read resource directory entry: {e}"),
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// Loads one definition file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or describes an invalid
    /// resource.
    pub fn load_file(&self, path: &Path) -> std::result::Result<Resource, ConfigError> {
        debug!("Loading template resource from {}", path.display());

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::invalid_resource(path, format!("cannot read file: {e}")))?;
        let file = ResourceFile::parse(path, &content)?;

        self.build(path, file.template)
    }

    fn build(
        &self,
        path: &Path,
        def: ResourceDefinition,
    ) -> std::result::Result<Resource, ConfigError> {
        let invalid = |message: String| ConfigError::invalid_resource(path, message);

        if def.src.is_empty() {
            return Err(invalid(String::from("empty src template")));
        }

        let dest = PathBuf::from(&def.dest);
        if !dest.is_absolute() {
            return Err(invalid(format!("dest '{}' is not an absolute path", def.dest)));
        }
        if dest.file_name().is_none() {
            return Err(invalid(format!("dest '{}' does not name a file", def.dest)));
        }

        let mode = def.mode.as_deref().map(parse_mode).transpose().map_err(invalid)?;
        let uid = resolve_id(def.uid, nix::unistd::geteuid().as_raw())
            .ok_or_else(|| invalid(format!("invalid uid {}", def.uid)))?;
        let gid = resolve_id(def.gid, nix::unistd::getegid().as_raw())
            .ok_or_else(|| invalid(format!("invalid gid {}", def.gid)))?;

        let prefix = self.prefix.as_deref().unwrap_or(&def.prefix);

        let mut resource = Resource::new(self.template_dir.join(&def.src), dest, prefix, def.keys)
            .with_owner(uid, gid)
            .with_flags(self.flags)
            .with_functions(FunctionSet::resolve(self.decryptor.clone()));
        resource.mode = mode;
        resource.check_cmd = def.check_cmd.filter(|c| !c.trim().is_empty());
        resource.reload_cmd = def.reload_cmd.filter(|c| !c.trim().is_empty());
        resource.origin = Some(path.to_path_buf());

        Ok(resource)
    }
}

/// Resolves the sentinel id to `effective`, rejecting anything out of range.
fn resolve_id(id: i64, effective: u32) -> Option<u32> {
    if id == UNSET_ID {
        Some(effective)
    } else {
        u32::try_from(id).ok()
    }
}
