//! Probe whether another process holds a file exclusively.

use std::path::Path;

#[cfg(unix)]
pub fn is_locked(path: &Path) -> bool {
    use fs2::FileExt;

    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(e) => e.raw_os_error() == fs2::lock_contended_error().raw_os_error(),
    }
}

#[cfg(windows)]
pub fn is_locked(path: &Path) -> bool {
    use std::os::windows::fs::OpenOptionsExt;

    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;

    // No sharing: fails if anyone else has the file open in a conflicting way.
    match std::fs::OpenOptions::new().read(true).share_mode(0).open(path) {
        Ok(_) => false,
        Err(e) => matches!(
            e.raw_os_error(),
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION)
        ),
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_locked(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn unlocked_and_missing_files_are_not_locked() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("free.txt");
        fs::write(&path, b"x")?;

        assert!(!is_locked(&path));
        assert!(!is_locked(&temp.path().join("missing.txt")));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn held_lock_is_detected() -> std::io::Result<()> {
        use fs2::FileExt;
        use std::fs::File;

        let temp = TempDir::new()?;
        let path = temp.path().join("held.txt");
        fs::write(&path, b"x")?;

        let holder = File::open(&path)?;
        holder.lock_exclusive()?;
        assert!(is_locked(&path));

        holder.unlock()?;
        assert!(!is_locked(&path));
        Ok(())
    }
}
