//! Registry Reference Updater
//!
//! Finds registry values that embed a path, backs them up, rewrites them and
//! restores them from a backup.

pub mod backup;
pub mod store;
pub mod value;
#[cfg(windows)]
mod win32;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RelocatorError, Result};

pub use backup::{BackupStore, RegistryBackup};
pub use store::{MemoryRegistry, RegistryStore};
pub use value::{Hive, RegistryKeyPath, RegistryValue, RegistryValueType};
#[cfg(windows)]
pub use win32::WindowsRegistry;

pub const REPORT_DIR: &str = "registry-reports";
pub const DEFAULT_MAX_DEPTH: usize = 6;

/// The host's registry, when it has one.
pub fn system_store() -> Option<Arc<dyn RegistryStore>> {
    #[cfg(windows)]
    {
        Some(Arc::new(WindowsRegistry))
    }
    #[cfg(not(windows))]
    {
        None
    }
}

/// A value whose textual form contains a searched path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryReference {
    pub key: RegistryKeyPath,
    pub value_name: String,
    pub value: RegistryValue,
}

impl RegistryReference {
    pub fn value_type(&self) -> RegistryValueType {
        self.value.value_type()
    }
}

/// Outcome of rewriting one reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceOutcome {
    pub key: RegistryKeyPath,
    pub value_name: String,
    pub success: bool,
    pub old_value: RegistryValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<RegistryValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryUpdateResult {
    /// Empty when there was nothing to back up
    pub backup_id: String,
    pub outcomes: Vec<ReferenceOutcome>,
}

impl RegistryUpdateResult {
    pub fn updated_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Audit record of one `update_references` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryUpdateReport {
    pub operation_id: String,
    pub old_path: String,
    pub new_path: String,
    pub generated_at: DateTime<Utc>,
    pub result: RegistryUpdateResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub restored: usize,
    /// `key\value` of entries that could not be written back
    pub failed: Vec<String>,
}

pub struct RegistryUpdater {
    store: Arc<dyn RegistryStore>,
    backups: BackupStore,
    reports_dir: PathBuf,
    roots: Vec<RegistryKeyPath>,
    max_depth: usize,
    reports: Mutex<HashMap<String, RegistryUpdateReport>>,
}

impl RegistryUpdater {
    /// Backups and reports are kept under `base_dir`.
    pub fn new(store: Arc<dyn RegistryStore>, base_dir: &Path) -> Self {
        Self {
            store,
            backups: BackupStore::new(base_dir),
            reports_dir: base_dir.join(REPORT_DIR),
            roots: Self::default_roots(),
            max_depth: DEFAULT_MAX_DEPTH,
            reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_roots(mut self, roots: Vec<RegistryKeyPath>) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Uninstall metadata, App Paths, environment and application classes,
    /// machine-wide and per-user.
    pub fn default_roots() -> Vec<RegistryKeyPath> {
        const HKLM: Hive = Hive::HkeyLocalMachine;
        const HKCU: Hive = Hive::HkeyCurrentUser;
        const UNINSTALL: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";
        const APP_PATHS: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\App Paths";
        const CLASSES: &str = r"SOFTWARE\Classes\Applications";
        vec![
            RegistryKeyPath::new(HKLM, UNINSTALL),
            RegistryKeyPath::new(
                HKLM,
                r"SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
            ),
            RegistryKeyPath::new(HKCU, UNINSTALL),
            RegistryKeyPath::new(HKLM, APP_PATHS),
            RegistryKeyPath::new(HKCU, APP_PATHS),
            RegistryKeyPath::new(
                HKLM,
                r"SYSTEM\CurrentControlSet\Control\Session Manager\Environment",
            ),
            RegistryKeyPath::new(HKCU, "Environment"),
            RegistryKeyPath::new(HKLM, CLASSES),
            RegistryKeyPath::new(HKCU, CLASSES),
        ]
    }

    /// Values under the known roots whose text contains `old_path`, ignoring case.
    /// Keys that cannot be opened are skipped.
    pub fn find_references(&self, old_path: &str) -> Vec<RegistryReference> {
        let mut found = Vec::new();
        if old_path.is_empty() {
            return found;
        }
        for root in &self.roots {
            self.walk(root, old_path, 0, &mut found);
        }
        debug!(path = old_path, count = found.len(), "registry scan finished");
        found
    }

    fn walk(
        &self,
        key: &RegistryKeyPath,
        needle: &str,
        depth: usize,
        found: &mut Vec<RegistryReference>,
    ) {
        match self.store.values(key) {
            Ok(values) => {
                for (name, value) in values {
                    if value.contains_ignore_case(needle) {
                        found.push(RegistryReference {
                            key: key.clone(),
                            value_name: name,
                            value,
                        });
                    }
                }
            }
            Err(e) => {
                debug!(key = %key, error = %e, "skipping unreadable key");
                return;
            }
        }

        if depth >= self.max_depth {
            return;
        }
        let children = match self.store.subkeys(key) {
            Ok(children) => children,
            Err(e) => {
                debug!(key = %key, error = %e, "skipping unreadable subkeys");
                return;
            }
        };
        for child in children {
            self.walk(&key.join(&child), needle, depth + 1, found);
        }
    }

    /// Persist `references` as a new backup; empty id when there is nothing to save.
    pub fn create_backup(&self, references: &[RegistryReference]) -> Result<String> {
        if references.is_empty() {
            return Ok(String::new());
        }
        let backup = self.backups.write(references)?;
        info!(backup = %backup.id, entries = references.len(), "registry backup created");
        Ok(backup.id)
    }

    /// Back up then rewrite every reference. Each value is written whole in a
    /// single call; a failed write leaves that value as it was.
    ///
    /// Errors only when the backup cannot be written, in which case nothing
    /// has been touched.
    pub fn update_references(
        &self,
        operation_id: &str,
        references: &[RegistryReference],
        old_path: &str,
        new_path: &str,
    ) -> Result<RegistryUpdateResult> {
        if old_path.is_empty() {
            return Err(RelocatorError::InvalidArgument(
                "old path must not be empty".into(),
            ));
        }
        let backup_id = self.create_backup(references)?;

        let mut outcomes = Vec::with_capacity(references.len());
        for reference in references {
            outcomes.push(self.update_one(reference, old_path, new_path));
        }

        let result = RegistryUpdateResult {
            backup_id,
            outcomes,
        };
        info!(
            operation = operation_id,
            updated = result.updated_count(),
            failed = result.failed_count(),
            "registry references updated"
        );

        let report = RegistryUpdateReport {
            operation_id: operation_id.to_string(),
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
            generated_at: Utc::now(),
            result: result.clone(),
        };
        if let Err(e) = self.persist_report(&report) {
            warn!(operation = operation_id, error = %e, "failed to persist registry report");
        }
        self.reports.lock().insert(operation_id.to_string(), report);

        Ok(result)
    }

    fn update_one(
        &self,
        reference: &RegistryReference,
        old_path: &str,
        new_path: &str,
    ) -> ReferenceOutcome {
        let mut outcome = ReferenceOutcome {
            key: reference.key.clone(),
            value_name: reference.value_name.clone(),
            success: false,
            old_value: reference.value.clone(),
            new_value: None,
            error: None,
        };

        let Some(updated) = reference.value.replace_ignore_case(old_path, new_path) else {
            outcome.error = Some(
                RelocatorError::RegistryUpdateFailed {
                    key: reference.key.to_string(),
                    message: format!("{:?} value carries no text", reference.value_type()),
                }
                .to_string(),
            );
            return outcome;
        };

        match self
            .store
            .set_value(&reference.key, &reference.value_name, &updated)
        {
            Ok(()) => {
                debug!(key = %reference.key, value = %reference.value_name, "registry value rewritten");
                outcome.success = true;
                outcome.new_value = Some(updated);
            }
            Err(e) => {
                let err = RelocatorError::RegistryUpdateFailed {
                    key: reference.key.to_string(),
                    message: e.to_string(),
                };
                warn!(value = %reference.value_name, "{}", err);
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }

    /// Write every backed-up value back verbatim. Entries that fail are
    /// reported and the rest continue. The backup file is left untouched.
    pub fn restore_backup(&self, backup_id: &str) -> Result<RestoreSummary> {
        let backup = self.backups.load(backup_id)?;
        let mut summary = RestoreSummary {
            backup_id: backup.id.clone(),
            ..Default::default()
        };

        for entry in &backup.entries {
            match self
                .store
                .set_value(&entry.key, &entry.value_name, &entry.value)
            {
                Ok(()) => summary.restored += 1,
                Err(e) => {
                    let name = format!("{}\\{}", entry.key, entry.value_name);
                    warn!(value = %name, error = %e, "failed to restore registry value");
                    summary.failed.push(name);
                }
            }
        }

        info!(
            backup = backup_id,
            restored = summary.restored,
            failed = summary.failed.len(),
            "registry backup restored"
        );
        Ok(summary)
    }

    /// Outcomes recorded for a prior `update_references` call.
    pub fn generate_report(&self, operation_id: &str) -> Result<RegistryUpdateReport> {
        if let Some(report) = self.reports.lock().get(operation_id) {
            return Ok(report.clone());
        }
        let path = self.report_path(operation_id);
        if !path.exists() {
            return Err(RelocatorError::OperationNotFound {
                id: operation_id.to_string(),
            });
        }
        let report: RegistryUpdateReport = serde_json::from_str(&fs::read_to_string(&path)?)?;
        self.reports
            .lock()
            .insert(operation_id.to_string(), report.clone());
        Ok(report)
    }

    fn report_path(&self, operation_id: &str) -> PathBuf {
        let safe: String = operation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.reports_dir.join(format!("{}.json", safe))
    }

    fn persist_report(&self, report: &RegistryUpdateReport) -> Result<()> {
        fs::create_dir_all(&self.reports_dir)?;
        fs::write(
            self.report_path(&report.operation_id),
            serde_json::to_string_pretty(report)?,
        )?;
        Ok(())
    }
}
