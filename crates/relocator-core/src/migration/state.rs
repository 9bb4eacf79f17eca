use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::progress::MigrationPhase;
use crate::error::Result;
use crate::oplog::OperationId;
use crate::redirect::RedirectKind;

pub const STATE_DIR: &str = "migration-state";

/// Transaction record of one migration; everything rollback needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    pub operation_id: OperationId,
    pub phase: MigrationPhase,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    /// Files written into the target tree, in copy order
    pub copied_files: Vec<PathBuf>,
    /// Copied target path -> original source path
    pub original_files: BTreeMap<PathBuf, PathBuf>,
    pub deleted_originals: bool,
    /// Where skipped files were parked so the redirect could take the source path
    pub leftover_dir: Option<PathBuf>,
    pub redirect_created: bool,
    pub redirect_path: Option<PathBuf>,
    pub redirect_kind: Option<RedirectKind>,
    pub registry_backup_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(operation_id: OperationId, source_path: &Path, target_path: &Path) -> Self {
        Self {
            operation_id,
            phase: MigrationPhase::Planned,
            source_path: source_path.to_path_buf(),
            target_path: target_path.to_path_buf(),
            copied_files: Vec::new(),
            original_files: BTreeMap::new(),
            deleted_originals: false,
            leftover_dir: None,
            redirect_created: false,
            redirect_path: None,
            redirect_kind: None,
            registry_backup_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn record_copy(&mut self, target: &Path, source: &Path) {
        self.copied_files.push(target.to_path_buf());
        self.original_files
            .insert(target.to_path_buf(), source.to_path_buf());
    }

    pub fn original_of(&self, target: &Path) -> Option<&Path> {
        self.original_files.get(target).map(PathBuf::as_path)
    }
}

/// Snapshots of [`MigrationState`] under `<base>/migration-state/`
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            dir: base_dir.join(STATE_DIR),
        }
    }

    pub fn path(&self, id: &OperationId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write via a temp file and rename so a crash never leaves half a snapshot.
    pub fn save(&self, state: &mut MigrationState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        state.updated_at = Utc::now();

        let path = self.path(&state.operation_id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(state)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(operation = %state.operation_id, phase = %state.phase, "state snapshot saved");
        Ok(())
    }

    pub fn load(&self, id: &OperationId) -> Result<Option<MigrationState>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn remove(&self, id: &OperationId) -> Result<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Operation ids with a stored snapshot
    pub fn list(&self) -> Result<Vec<OperationId>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(OperationId::from_string(stem));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// Drop snapshots not touched within `retention_days`.
    pub fn purge_older_than(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut removed = 0;
        for id in self.list()? {
            match self.load(&id) {
                Ok(Some(state)) if state.updated_at < cutoff => {
                    self.remove(&id)?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(operation = %id, error = %e, "unreadable state snapshot"),
            }
        }
        Ok(removed)
    }
}
