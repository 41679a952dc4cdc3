//! In-memory resource records.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::append_prefix;

use super::functions::FunctionSet;
use super::snapshot::Snapshot;

/// Behavior flags applied to every sync of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncFlags {
    /// Render and diff, but never replace the destination.
    pub noop: bool,
    /// Replace the destination, but never run the reload command.
    pub sync_only: bool,
    /// Keep the stage file when the destination is unchanged.
    pub keep_stage_file: bool,
}

/// One template source bound to one destination file.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Template source path.
    pub src: PathBuf,
    /// Absolute destination path.
    pub dest: PathBuf,
    /// Key prefix, always starting with `/`.
    pub prefix: String,
    /// Keys relative to the prefix.
    pub keys: Vec<String>,
    /// Explicit destination mode, if configured.
    pub mode: Option<u32>,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Command validating the stage file.
    pub check_cmd: Option<String>,
    /// Command run after the destination is replaced.
    pub reload_cmd: Option<String>,
    /// Behavior flags.
    pub flags: SyncFlags,
    /// Functions available to the template.
    pub functions: FunctionSet,
    /// Path of the definition this resource was loaded from.
    pub origin: Option<PathBuf>,
    cursor: u64,
    snapshot: Arc<Snapshot>,
}

impl Resource {
    /// Creates a resource with no explicit mode or commands.
    ///
    /// The prefix is normalized to start with `/`.
    #[must_use]
    pub fn new(
        src: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        prefix: &str,
        keys: Vec<String>,
    ) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            prefix: normalize_prefix(prefix),
            keys,
            mode: None,
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            check_cmd: None,
            reload_cmd: None,
            flags: SyncFlags::default(),
            functions: FunctionSet::default(),
            origin: None,
            cursor: 0,
            snapshot: Arc::new(Snapshot::default()),
        }
    }

    /// Sets an explicit destination mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the owner ids.
    #[must_use]
    pub const fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Sets the check command.
    #[must_use]
    pub fn with_check_cmd(mut self, command: impl Into<String>) -> Self {
        self.check_cmd = Some(command.into());
        self
    }

    /// Sets the reload command.
    #[must_use]
    pub fn with_reload_cmd(mut self, command: impl Into<String>) -> Self {
        self.reload_cmd = Some(command.into());
        self
    }

    /// Sets the behavior flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: SyncFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the function set.
    #[must_use]
    pub fn with_functions(mut self, functions: FunctionSet) -> Self {
        self.functions = functions;
        self
    }

    /// Returns the identity used in logs and error reports.
    #[must_use]
    pub fn id(&self) -> String {
        let src = self
            .src
            .file_name()
            .map_or_else(|| self.src.display().to_string(), |n| n.to_string_lossy().into_owned());
        format!("{src} => {}", self.dest.display())
    }

    /// Returns the keys with the prefix applied.
    #[must_use]
    pub fn prefixed_keys(&self) -> Vec<String> {
        append_prefix(&self.prefix, &self.keys)
    }

    /// Returns the last observed watch index.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Moves the watch cursor forward. Returns false, and leaves the cursor
    /// untouched, if `index` is not newer than the current cursor.
    pub fn advance_cursor(&mut self, index: u64) -> bool {
        if index > self.cursor {
            self.cursor = index;
            true
        } else {
            false
        }
    }

    /// Returns the snapshot of the last fetch.
    #[must_use]
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Replaces the snapshot.
    pub fn replace_snapshot(&mut self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.snapshot = Arc::new(snapshot);
        Arc::clone(&self.snapshot)
    }
}

/// Summary of a resource, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    /// Resource identity.
    pub id: String,
    /// Template source path.
    pub src: PathBuf,
    /// Destination path.
    pub dest: PathBuf,
    /// Key prefix.
    pub prefix: String,
    /// Keys with the prefix applied.
    pub keys: Vec<String>,
    /// Explicit mode, formatted in octal.
    pub mode: Option<String>,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Check command.
    pub check_cmd: Option<String>,
    /// Reload command.
    pub reload_cmd: Option<String>,
    /// Definition file the resource was loaded from.
    pub definition: Option<PathBuf>,
}

impl From<&Resource> for ResourceSummary {
    fn from(resource: &Resource) -> Self {
        Self {
            id: resource.id(),
            src: resource.src.clone(),
            dest: resource.dest.clone(),
            prefix: resource.prefix.clone(),
            keys: resource.prefixed_keys(),
            mode: resource.mode.map(|m| format!("{m:04o}")),
            uid: resource.uid,
            gid: resource.gid,
            check_cmd: resource.check_cmd.clone(),
            reload_cmd: resource.reload_cmd.clone(),
            definition: resource.origin.clone(),
        }
    }
}

/// Ensures a prefix starts with `/`.
#[must_use]
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_resource_normalizes_prefix() {
        let resource = Resource::new("t.tmpl", "/etc/t.conf", "app", vec![String::from("db")]);
        assert_eq!(resource.prefix, "/app");
        assert_eq!(resource.prefixed_keys(), vec!["/app/db"]);
        assert_eq!(resource.uid, nix::unistd::geteuid().as_raw());
    }

    #[test]
    fn test_id_names_source_file_and_dest() {
        let resource = Resource::new("/srv/templates/t.tmpl", "/etc/t.conf", "/", Vec::new());
        assert_eq!(resource.id(), "t.tmpl => /etc/t.conf");
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut resource = Resource::new("t", "/t", "/", Vec::new());

        assert!(resource.advance_cursor(5));
        assert!(!resource.advance_cursor(5));
        assert!(!resource.advance_cursor(3));
        assert_eq!(resource.cursor(), 5);
    }

    #[test]
    fn test_summary_formats_mode() {
        let resource = Resource::new("t", "/t", "/", Vec::new()).with_mode(0o640);
        let summary = ResourceSummary::from(&resource);
        assert_eq!(summary.mode.as_deref(), Some("0640"));
    }
}
