//! File system utils.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;
use fs2::FileExt;

pub struct FsHandler;

impl FsHandler {
    /// Create the parent directory of `path` if it doesn't exist.
    pub fn create_parent_dir(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(())
    }

    /// Write `content` to `path` so that readers only ever see the old or the new file.
    pub fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
        Self::create_parent_dir(path)?;

        let tmp = Self::sibling(path, "tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| {
            format!("Failed to move {} to {}", tmp.display(), path.display())
        })?;

        tracing::debug!(path = %path.display(), bytes = content.len(), "File written");
        Ok(())
    }

    /// Take an exclusive lock guarding `path`, held until the returned guard is dropped.
    ///
    /// Fails immediately if another process holds the lock.
    pub fn lock_exclusive(path: &Path) -> anyhow::Result<FileLock> {
        Self::create_parent_dir(path)?;

        let lock_path = Self::sibling(path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "{} is locked, is another deployment running against it?",
                path.display()
            )
        })?;

        tracing::debug!(path = %lock_path.display(), "Lock acquired");
        Ok(FileLock {
            file,
            path: lock_path,
        })
    }

    fn sibling(path: &Path, extension: &str) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(extension);
        path.with_file_name(name)
    }
}

/// Guard returned by [`FsHandler::lock_exclusive`].
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), err = %e, "Failed to release lock");
        }
    }
}
