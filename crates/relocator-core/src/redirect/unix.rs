use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use super::{RedirectError, RedirectInfo, RedirectKind, RedirectResult};

// Junctions are an NTFS construct.
pub(super) fn supports_junction(_path: &Path) -> bool {
    false
}

pub(super) fn supports_symbolic_link() -> bool {
    true
}

pub(super) fn create_junction(link: &Path, _target: &Path) -> RedirectResult<()> {
    Err(RedirectError::UnsupportedFileSystem(link.to_path_buf()))
}

pub(super) fn create_symbolic_link(link: &Path, target: &Path, _is_dir: bool) -> RedirectResult<()> {
    symlink(target, link)?;
    Ok(())
}

pub(super) fn remove_link(link: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(link) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_symlink() {
        return Ok(false);
    }
    fs::remove_file(link)?;
    Ok(true)
}

pub(super) fn inspect(path: &Path) -> io::Result<Option<RedirectInfo>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_symlink() {
        return Ok(None);
    }

    let raw = fs::read_link(path)?;
    let target_path = if raw.is_absolute() {
        raw
    } else {
        path.parent().map(|p| p.join(&raw)).unwrap_or(raw)
    };

    Ok(Some(RedirectInfo {
        link_path: path.to_path_buf(),
        target_exists: fs::metadata(path).is_ok(),
        target_path,
        kind: RedirectKind::SymbolicLink,
    }))
}
