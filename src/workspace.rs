//! Request-scoped temporary directories.
//!
//! A [`Workspace`] is created per download request and deleted exactly once: either
//! explicitly through [`Workspace::release`] or, failing that, when it is dropped.
//! Dropping covers every exit path, including a response body that the transport
//! discards mid-stream because the client went away.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// Output template handed to the extraction engine, relative to the workspace.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    prefix: String,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, uniquely named directory under the root.
    ///
    /// Directory creation is a single `mkdir` with a random suffix, so a failure leaves
    /// nothing behind.
    pub fn acquire(&self) -> Result<Workspace> {
        let dir = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.root)
            .map_err(Error::ResourceAllocation)?;
        let path = dir.path().to_path_buf();
        log::debug!("[WORKSPACE] Acquired {}", path.display());
        Ok(Workspace {
            dir: Some(dir),
            path,
            retry: false,
        })
    }
}

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    // Set when a removal attempt failed; the next release retries by path.
    retry: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path template the engine writes its artifact to.
    pub fn output_template(&self) -> PathBuf {
        self.path.join(OUTPUT_TEMPLATE)
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none() && !self.retry
    }

    /// Recursively delete the directory. Safe to call repeatedly; a directory that is
    /// already gone is not an error. After a failed attempt the next call (or drop)
    /// tries again.
    pub fn release(&mut self) -> io::Result<()> {
        let result = match self.dir.take() {
            Some(dir) => dir.close(),
            None if self.retry => std::fs::remove_dir_all(&self.path),
            None => return Ok(()),
        };
        match result {
            Ok(()) => {
                self.retry = false;
                log::debug!("[WORKSPACE] Released {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.retry = false;
                Ok(())
            }
            Err(e) => {
                self.retry = true;
                Err(e)
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("[WORKSPACE] Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn acquire_creates_unique_directories() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), "bili-download-");
        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert!(b.path().is_dir());
        assert!(a
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("bili-download-"));
        assert_eq!(
            a.output_template(),
            a.path().join("%(title)s.%(ext)s")
        );
    }

    #[test]
    fn release_removes_populated_directory() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), "ws-");
        let mut ws = manager.acquire().unwrap();
        std::fs::create_dir(ws.path().join("nested")).unwrap();
        std::fs::write(ws.path().join("nested").join("a.mp4"), b"data").unwrap();
        std::fs::write(ws.path().join("b.part"), b"data").unwrap();

        let path = ws.path().to_path_buf();
        ws.release().unwrap();
        assert!(!path.exists());
        assert!(ws.is_released());
    }

    #[test]
    fn release_twice_is_fine() {
        let root = tempdir().unwrap();
        let mut ws = WorkspaceManager::new(root.path(), "ws-").acquire().unwrap();
        ws.release().unwrap();
        ws.release().unwrap();
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn release_tolerates_directory_removed_elsewhere() {
        let root = tempdir().unwrap();
        let mut ws = WorkspaceManager::new(root.path(), "ws-").acquire().unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();
        ws.release().unwrap();
    }

    #[test]
    fn drop_releases() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), "ws-");
        {
            let ws = manager.acquire().unwrap();
            std::fs::write(ws.path().join("x"), b"1").unwrap();
            assert_eq!(entries(root.path()), 1);
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn acquire_fails_without_a_root() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("does-not-exist"), "ws-");
        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, Error::ResourceAllocation(_)));
        assert!(!root.path().join("does-not-exist").exists());
    }

    #[test]
    fn failed_release_is_retried() {
        let root = tempdir().unwrap();
        let mut ws = WorkspaceManager::new(root.path(), "ws-").acquire().unwrap();
        let path = ws.path().to_path_buf();

        // A plain file where the directory should be makes removal fail.
        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, b"in the way").unwrap();
        assert!(ws.release().is_err());
        assert!(!ws.is_released());

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("left.mp4"), b"data").unwrap();
        ws.release().unwrap();
        assert!(ws.is_released());
        assert!(!path.exists());
    }

    #[test]
    fn drop_retries_failed_release() {
        let root = tempdir().unwrap();
        let path;
        {
            let mut ws = WorkspaceManager::new(root.path(), "ws-").acquire().unwrap();
            path = ws.path().to_path_buf();
            std::fs::remove_dir_all(&path).unwrap();
            std::fs::write(&path, b"in the way").unwrap();
            assert!(ws.release().is_err());

            std::fs::remove_file(&path).unwrap();
            std::fs::create_dir(&path).unwrap();
        }
        assert!(!path.exists());
    }
}
