//! Filesystem redirects (directory junctions and symbolic links)
//!
//! Everything that touches raw reparse data lives below this module; callers only
//! see [`RedirectManager`] with its create / remove / inspect surface.

pub mod reparse;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win32;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use win32 as sys;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Kind of filesystem redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectKind {
    /// NTFS directory junction (mount-point reparse tag)
    Junction,
    /// Symbolic link to a file or directory
    SymbolicLink,
}

impl RedirectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Junction => "junction",
            Self::SymbolicLink => "symlink",
        }
    }
}

impl std::fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RedirectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "junction" => Ok(Self::Junction),
            "symlink" | "symbolic-link" => Ok(Self::SymbolicLink),
            _ => Err(format!("unknown redirect kind: {} (expected junction or symlink)", s)),
        }
    }
}

/// Snapshot of a redirect as found on disk. Computed on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectInfo {
    pub link_path: PathBuf,
    pub target_path: PathBuf,
    pub kind: RedirectKind,
    pub target_exists: bool,
}

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("redirect target does not exist: {0}")]
    TargetMissing(PathBuf),

    #[error("link path already exists: {0}")]
    LinkAlreadyExists(PathBuf),

    #[error("file system does not support junctions: {0}")]
    UnsupportedFileSystem(PathBuf),

    #[error("creating symbolic links requires administrator rights or developer mode")]
    InsufficientPrivilege,

    #[error("malformed reparse data: {0}")]
    InvalidReparseData(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type RedirectResult<T> = std::result::Result<T, RedirectError>;

/// Creates, removes and inspects redirects. Stateless; cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectManager;

impl RedirectManager {
    pub fn new() -> Self {
        Self
    }

    /// Whether the volume holding `path` can carry directory junctions.
    pub fn supports_junction(&self, path: &Path) -> bool {
        sys::supports_junction(path)
    }

    /// Whether this process may create symbolic links.
    pub fn supports_symbolic_link(&self) -> bool {
        sys::supports_symbolic_link()
    }

    /// Junction when the volume allows one, otherwise a symbolic link.
    pub fn preferred_kind(&self, link_path: &Path) -> RedirectKind {
        if self.supports_junction(link_path) {
            RedirectKind::Junction
        } else {
            RedirectKind::SymbolicLink
        }
    }

    pub fn create(
        &self,
        kind: RedirectKind,
        link_path: &Path,
        target_path: &Path,
    ) -> RedirectResult<RedirectInfo> {
        match kind {
            RedirectKind::Junction => self.create_junction(link_path, target_path),
            RedirectKind::SymbolicLink => self.create_symbolic_link(link_path, target_path),
        }
    }

    /// Create a directory junction at `link_path` pointing to `target_path`.
    ///
    /// The junction is built as a placeholder directory plus a mount-point reparse
    /// buffer. If attaching the buffer fails the placeholder is removed again, so a
    /// failed call never leaves an empty directory behind.
    pub fn create_junction(
        &self,
        link_path: &Path,
        target_path: &Path,
    ) -> RedirectResult<RedirectInfo> {
        check_arguments(link_path, target_path)?;
        if !target_path.is_dir() {
            return Err(RedirectError::TargetMissing(target_path.to_path_buf()));
        }
        check_link_free(link_path)?;
        if !self.supports_junction(link_path) {
            return Err(RedirectError::UnsupportedFileSystem(link_path.to_path_buf()));
        }

        let target = fs::canonicalize(target_path)?;
        sys::create_junction(link_path, &target)?;
        info!(link = %link_path.display(), target = %target.display(), "created junction");

        Ok(RedirectInfo {
            link_path: link_path.to_path_buf(),
            target_path: reparse::strip_verbatim(&target),
            kind: RedirectKind::Junction,
            target_exists: true,
        })
    }

    /// Create a symbolic link at `link_path`, as a directory or file link depending
    /// on what `target_path` is.
    pub fn create_symbolic_link(
        &self,
        link_path: &Path,
        target_path: &Path,
    ) -> RedirectResult<RedirectInfo> {
        check_arguments(link_path, target_path)?;
        if !target_path.exists() {
            return Err(RedirectError::TargetMissing(target_path.to_path_buf()));
        }
        check_link_free(link_path)?;
        if !self.supports_symbolic_link() {
            return Err(RedirectError::InsufficientPrivilege);
        }

        let target = fs::canonicalize(target_path)?;
        let is_dir = target.is_dir();
        if let Err(err) = sys::create_symbolic_link(link_path, &target, is_dir) {
            // Some platforms leave a partially created entry on failure.
            if fs::symlink_metadata(link_path).is_ok() {
                let _ = sys::remove_link(link_path);
            }
            return Err(err);
        }
        info!(link = %link_path.display(), target = %target.display(), is_dir, "created symbolic link");

        Ok(RedirectInfo {
            link_path: link_path.to_path_buf(),
            target_path: reparse::strip_verbatim(&target),
            kind: RedirectKind::SymbolicLink,
            target_exists: true,
        })
    }

    /// Detach and delete the redirect at `link_path`.
    ///
    /// Returns false when `link_path` is not a redirect (including when it does not
    /// exist). The redirect target is never touched.
    pub fn remove_link(&self, link_path: &Path) -> bool {
        match self.try_remove_link(link_path) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(link = %link_path.display(), error = %err, "failed to remove redirect");
                false
            }
        }
    }

    /// Like [`remove_link`](Self::remove_link) but surfaces the failure when a
    /// redirect exists and could not be removed.
    pub fn try_remove_link(&self, link_path: &Path) -> RedirectResult<bool> {
        if link_path.as_os_str().is_empty() {
            return Ok(false);
        }
        let removed = sys::remove_link(link_path)?;
        if removed {
            info!(link = %link_path.display(), "removed redirect");
        }
        Ok(removed)
    }

    /// Describe the redirect at `path`, or `None` if it is not one.
    pub fn inspect(&self, path: &Path) -> Option<RedirectInfo> {
        match sys::inspect(path) {
            Ok(info) => info,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "inspect failed");
                None
            }
        }
    }
}

fn check_arguments(link_path: &Path, target_path: &Path) -> RedirectResult<()> {
    if link_path.as_os_str().is_empty() {
        return Err(RedirectError::InvalidArgument("link path is empty".into()));
    }
    if target_path.as_os_str().is_empty() {
        return Err(RedirectError::InvalidArgument("target path is empty".into()));
    }
    Ok(())
}

fn check_link_free(link_path: &Path) -> RedirectResult<()> {
    // symlink_metadata so that a dangling redirect also counts as occupied
    if fs::symlink_metadata(link_path).is_ok() {
        return Err(RedirectError::LinkAlreadyExists(link_path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_paths_are_rejected() {
        let manager = RedirectManager::new();
        let err = manager
            .create_symbolic_link(Path::new(""), Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, RedirectError::InvalidArgument(_)));

        let err = manager
            .create_junction(Path::new("/tmp/x"), Path::new(""))
            .unwrap_err();
        assert!(matches!(err, RedirectError::InvalidArgument(_)));
    }

    #[test]
    fn missing_target_is_reported() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let manager = RedirectManager::new();
        let err = manager
            .create_symbolic_link(&temp.path().join("link"), &temp.path().join("nowhere"))
            .unwrap_err();
        assert!(matches!(err, RedirectError::TargetMissing(_)));
        assert!(!temp.path().join("link").exists());
        Ok(())
    }

    #[test]
    fn occupied_link_path_is_reported() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("target");
        let link = temp.path().join("link");
        fs::create_dir(&target)?;
        fs::create_dir(&link)?;

        let manager = RedirectManager::new();
        let err = manager.create_symbolic_link(&link, &target).unwrap_err();
        assert!(matches!(err, RedirectError::LinkAlreadyExists(_)));
        Ok(())
    }

    #[test]
    fn plain_directory_is_not_a_redirect() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let manager = RedirectManager::new();
        assert!(manager.inspect(temp.path()).is_none());
        assert!(!manager.remove_link(temp.path()));
        assert!(temp.path().exists());
        Ok(())
    }

    #[test]
    fn redirect_kind_parses_config_spellings() {
        assert_eq!("junction".parse::<RedirectKind>(), Ok(RedirectKind::Junction));
        assert_eq!("Symlink".parse::<RedirectKind>(), Ok(RedirectKind::SymbolicLink));
        assert!("hardlink".parse::<RedirectKind>().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_create_inspect_remove_twice() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("target");
        let link = temp.path().join("link");
        fs::create_dir(&target)?;
        fs::write(target.join("app.exe"), b"binary")?;

        let manager = RedirectManager::new();
        let created = manager.create_symbolic_link(&link, &target).unwrap();
        assert_eq!(created.kind, RedirectKind::SymbolicLink);
        assert_eq!(fs::read(link.join("app.exe"))?, b"binary");

        let info = manager.inspect(&link).unwrap();
        assert_eq!(info.kind, RedirectKind::SymbolicLink);
        assert_eq!(info.target_path, fs::canonicalize(&target)?);
        assert!(info.target_exists);

        assert!(manager.remove_link(&link));
        assert!(!manager.remove_link(&link));
        assert!(target.join("app.exe").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn inspect_reports_dangling_link() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("target");
        let link = temp.path().join("link");
        fs::create_dir(&target)?;

        let manager = RedirectManager::new();
        manager.create_symbolic_link(&link, &target).unwrap();
        fs::remove_dir(&target)?;

        let info = manager.inspect(&link).unwrap();
        assert!(!info.target_exists);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn junction_on_unix_fails_without_placeholder() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("target");
        let link = temp.path().join("link");
        fs::create_dir(&target)?;

        let manager = RedirectManager::new();
        assert!(!manager.supports_junction(temp.path()));
        let err = manager.create_junction(&link, &target).unwrap_err();
        assert!(matches!(err, RedirectError::UnsupportedFileSystem(_)));
        assert!(fs::symlink_metadata(&link).is_err());
        assert_eq!(manager.preferred_kind(&link), RedirectKind::SymbolicLink);
        Ok(())
    }

    #[cfg(windows)]
    #[test]
    fn junction_round_trip() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let target = temp.path().join("target");
        let link = temp.path().join("link");
        fs::create_dir(&target)?;
        fs::write(target.join("app.exe"), b"binary")?;

        let manager = RedirectManager::new();
        if !manager.supports_junction(temp.path()) {
            return Ok(());
        }
        manager.create_junction(&link, &target).unwrap();
        assert_eq!(fs::read(link.join("app.exe"))?, b"binary");

        let info = manager.inspect(&link).unwrap();
        assert_eq!(info.kind, RedirectKind::Junction);
        assert!(info.target_exists);

        assert!(manager.remove_link(&link));
        assert!(!manager.remove_link(&link));
        assert!(target.join("app.exe").exists());
        Ok(())
    }
}
