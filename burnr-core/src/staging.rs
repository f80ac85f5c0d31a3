//! The per-run staging directory.
use anyhow::{Context, Result, bail};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File written into every staging directory so a later run can tell its own
/// leftovers apart from a directory it must not touch.
const MARKER_FILE: &str = ".burnr-staging";

/// Owns the directory holding the downloaded image for one run.
///
/// The directory is created fresh by [`StagingArea::create`] and removed
/// recursively when the value is dropped, so every exit path of a run
/// (success, failure, or a panic unwinding through the worker) releases it.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
    removed: bool,
}

impl StagingArea {
    /// Creates the staging directory at `path`.
    ///
    /// An existing directory is only reused if it carries the staging marker,
    /// which means an earlier run crashed before removing it; it is cleared
    /// first. Any other existing path is refused and left untouched.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            if !path.join(MARKER_FILE).is_file() {
                bail!(
                    "{} already exists and is not a burnr staging directory",
                    path.display()
                );
            }
            tracing::warn!(path = %path.display(), "removing stale staging directory");
            remove_dir_if_present(path)
                .with_context(|| format!("removing stale {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::create_dir(path).with_context(|| format!("creating {}", path.display()))?;
        let staging = Self {
            path: path.to_path_buf(),
            removed: false,
        };
        fs::write(path.join(MARKER_FILE), b"")
            .with_context(|| format!("marking {}", path.display()))?;
        tracing::debug!(path = %path.display(), "staging directory created");
        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory now and reports whether that worked.
    pub fn teardown(mut self) -> Result<()> {
        self.removed = true;
        remove_dir_if_present(&self.path)
            .with_context(|| format!("removing {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "staging directory removed");
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_dir_if_present(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

/// Recursively removes `path`. An already-absent directory is not an error.
fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("staging");
        {
            let staging = StagingArea::create(&path).unwrap();
            fs::write(staging.path().join("image.img"), b"data").unwrap();
            assert!(path.is_dir());
        }
        assert!(!path.exists());
    }

    #[test]
    fn create_clears_a_leftover_staging_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("staging");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(MARKER_FILE), b"").unwrap();
        fs::write(path.join("leftover.img"), b"old").unwrap();

        let staging = StagingArea::create(&path).unwrap();
        assert!(!staging.path().join("leftover.img").exists());
        assert!(staging.path().join(MARKER_FILE).is_file());
    }

    #[test]
    fn create_refuses_an_unrelated_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("Downloads");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("thesis.pdf"), b"keep me").unwrap();

        let err = StagingArea::create(&path).unwrap_err();
        assert!(err.to_string().contains("not a burnr staging directory"));
        assert_eq!(fs::read(path.join("thesis.pdf")).unwrap(), b"keep me");
    }

    #[test]
    fn create_refuses_an_existing_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("staging");
        fs::write(&path, b"data").unwrap();

        assert!(StagingArea::create(&path).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn teardown_is_idempotent_when_already_gone() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("staging");
        let staging = StagingArea::create(&path).unwrap();
        fs::remove_dir_all(&path).unwrap();
        staging.teardown().unwrap();
    }

    #[test]
    fn create_fails_when_parent_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        fs::write(&blocker, b"").unwrap();
        assert!(StagingArea::create(&blocker.join("staging")).is_err());
    }
}
