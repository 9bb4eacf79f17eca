use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hash a file without loading it into memory; installations routinely carry
/// multi-gigabyte assets.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut reader = BufReader::with_capacity(1 << 20, File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// True when both files exist and hash identically.
pub fn files_match(a: &Path, b: &Path) -> Result<bool> {
    if !a.is_file() || !b.is_file() {
        return Ok(false);
    }
    if a.metadata()?.len() != b.metadata()?.len() {
        return Ok(false);
    }
    Ok(compute_file_hash(a)? == compute_file_hash(b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn compute_hash(content: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(content)))
    }

    #[test]
    fn file_hash_matches_in_memory_hash() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.bin");
        fs::write(&path, b"relocate me")?;

        assert_eq!(compute_file_hash(&path)?, compute_hash(b"relocate me"));
        Ok(())
    }

    #[test]
    fn single_byte_change_breaks_match() -> Result<()> {
        let temp = TempDir::new()?;
        let a = temp.path().join("a.bin");
        let b = temp.path().join("b.bin");
        fs::write(&a, b"0123456789")?;
        fs::write(&b, b"0123456789")?;
        assert!(files_match(&a, &b)?);

        fs::write(&b, b"0123456780")?;
        assert!(!files_match(&a, &b)?);
        Ok(())
    }

    #[test]
    fn missing_file_never_matches() -> Result<()> {
        let temp = TempDir::new()?;
        let a = temp.path().join("a.bin");
        fs::write(&a, b"x")?;
        assert!(!files_match(&a, &temp.path().join("missing"))?);
        Ok(())
    }
}
