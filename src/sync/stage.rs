//! Stage files.
//!
//! Rendered output is written next to its destination as
//! `.<dest-name>.<uuid>`, flushed to disk and given its final mode and
//! owner before it is compared or renamed over the destination. A stage
//! file is removed when dropped unless it was kept or persisted.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// A rendered file waiting to replace its destination.
#[derive(Debug)]
pub struct StageFile {
    path: PathBuf,
    armed: bool,
}

impl StageFile {
    /// Writes `contents` to a new stage file for `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or its permissions
    /// or owner cannot be set.
    pub async fn create(
        dest: &Path,
        contents: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> io::Result<Self> {
        let dir = dest.parent().unwrap_or_else(|| Path::new("/"));
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = dir.join(format!(".{name}.{}", Uuid::new_v4().simple()));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .await?;

        // From here on the guard owns the path.
        let stage = Self { path, armed: true };

        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::set_permissions(&stage.path, Permissions::from_mode(mode)).await?;

        let meta = fs::metadata(&stage.path).await?;
        if meta.uid() != uid || meta.gid() != gid {
            std::os::unix::fs::chown(&stage.path, Some(uid), Some(gid))?;
        }

        debug!("Staged {} for {}", stage.path.display(), dest.display());
        Ok(stage)
    }

    /// Returns the stage file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaves the stage file on disk and returns its path.
    #[must_use]
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Removes the stage file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub async fn discard(mut self) -> io::Result<()> {
        self.armed = false;
        fs::remove_file(&self.path).await
    }

    /// Atomically renames the stage file over `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails; the stage file is then removed.
    pub async fn persist(mut self, dest: &Path) -> io::Result<()> {
        fs::rename(&self.path, dest).await?;
        self.armed = false;
        Ok(())
    }

    /// Returns true if the stage file matches `dest` in contents,
    /// permission bits and owner.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read.
    pub async fn matches(&self, dest: &Path) -> io::Result<bool> {
        let dest_meta = match fs::metadata(dest).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if !dest_meta.is_file() {
            return Ok(false);
        }

        let stage_meta = fs::metadata(&self.path).await?;
        if stage_meta.mode() & 0o7777 != dest_meta.mode() & 0o7777 {
            debug!("{} has mode {:o}", dest.display(), dest_meta.mode() & 0o7777);
            return Ok(false);
        }
        if stage_meta.uid() != dest_meta.uid() || stage_meta.gid() != dest_meta.gid() {
            debug!("{} has owner {}:{}", dest.display(), dest_meta.uid(), dest_meta.gid());
            return Ok(false);
        }
        if stage_meta.len() != dest_meta.len() {
            return Ok(false);
        }

        let staged = fs::read(&self.path).await?;
        let current = fs::read(dest).await?;
        Ok(staged == current)
    }
}

impl Drop for StageFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Cannot remove stage file {}: {e}", self.path.display());
                }
            }
        }
    }
}
