use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::RegistryReference;
use crate::error::{RelocatorError, Result};

pub const BACKUP_DIR: &str = "registry-backups";

/// Snapshot of registry values taken before they are rewritten
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryBackup {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<RegistryReference>,
}

/// One JSON file per backup. Files are created once and never rewritten.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            dir: base_dir.join(BACKUP_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn write(&self, entries: &[RegistryReference]) -> Result<RegistryBackup> {
        fs::create_dir_all(&self.dir)?;
        let backup = RegistryBackup {
            id: format!("rb-{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
            entries: entries.to_vec(),
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(&backup.id))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &backup)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        debug!(backup = %backup.id, entries = backup.entries.len(), "registry backup written");
        Ok(backup)
    }

    pub fn load(&self, id: &str) -> Result<RegistryBackup> {
        if !is_valid_id(id) {
            return Err(RelocatorError::BackupNotFound { id: id.to_string() });
        }
        let path = self.path(id);
        if !path.exists() {
            return Err(RelocatorError::BackupNotFound { id: id.to_string() });
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Backup ids, oldest first.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let modified = path.metadata().and_then(|m| m.modified()).ok();
                found.push((modified, stem.to_string()));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }
}

// Ids become file names; keep them to a safe alphabet.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
