use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::state::MigrationState;
use crate::oplog::{ActionKind, OperationAction, OperationId, OperationLog};
use crate::redirect::RedirectManager;
use crate::registry::RegistryUpdater;

/// Result of one rollback sub-step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Nothing to do for this step
    Skipped,
    /// Failed, but the remaining steps are still safe
    Recoverable(String),
    /// Failed in a way that makes the remaining steps unsafe
    Fatal(String),
}

/// What a rollback managed to put back
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackReport {
    pub operation_id: String,
    /// Sources copied back from the target tree
    pub restored: Vec<PathBuf>,
    /// Sources that are still absent
    pub missing: Vec<PathBuf>,
    /// Target copies deleted
    pub removed_copies: usize,
    pub redirect_removed: bool,
    pub registry_restored: bool,
    pub leftovers_returned: bool,
    /// Set when a fatal step stopped the rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub warnings: Vec<String>,
}

impl RollbackReport {
    /// Every source is back and no step was fatal.
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.missing.is_empty()
    }
}

pub(crate) struct Rollback<'a> {
    pub redirects: &'a RedirectManager,
    pub registry: Option<&'a RegistryUpdater>,
    pub log: &'a OperationLog,
    /// Operation the rollback actions are logged under
    pub log_id: &'a OperationId,
}

impl Rollback<'_> {
    pub fn run(&self, state: &MigrationState) -> RollbackReport {
        let mut report = RollbackReport {
            operation_id: state.operation_id.to_string(),
            ..Default::default()
        };
        info!(operation = %state.operation_id, phase = %state.phase, "rolling back");

        match self.restore_registry(state) {
            StepOutcome::Done => report.registry_restored = true,
            outcome => self.note(&mut report, outcome),
        }

        match self.remove_redirect(state) {
            StepOutcome::Done => report.redirect_removed = true,
            StepOutcome::Fatal(message) => {
                // The old path is still occupied; restoring into it would write
                // through the redirect into the target tree.
                warn!(operation = %state.operation_id, "rollback aborted: {}", message);
                report.aborted = Some(message);
                report.missing = missing_sources(state);
                return report;
            }
            outcome => self.note(&mut report, outcome),
        }

        match self.return_leftovers(state) {
            StepOutcome::Done => report.leftovers_returned = true,
            StepOutcome::Fatal(message) => {
                report.aborted = Some(message);
                report.missing = missing_sources(state);
                return report;
            }
            outcome => self.note(&mut report, outcome),
        }

        for (target, source) in &state.original_files {
            match self.restore_file(target, source) {
                StepOutcome::Done => report.restored.push(source.clone()),
                outcome => self.note(&mut report, outcome),
            }
        }

        for target in &state.copied_files {
            match self.remove_copy(state, target) {
                StepOutcome::Done => report.removed_copies += 1,
                outcome => self.note(&mut report, outcome),
            }
        }
        remove_empty_dirs(&state.target_path);

        report.missing = missing_sources(state);
        info!(
            operation = %state.operation_id,
            restored = report.restored.len(),
            missing = report.missing.len(),
            "rollback finished"
        );
        report
    }

    fn note(&self, report: &mut RollbackReport, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Recoverable(message) | StepOutcome::Fatal(message) => {
                warn!("{}", message);
                report.warnings.push(message);
            }
            StepOutcome::Done | StepOutcome::Skipped => {}
        }
    }

    fn record(&self, action: OperationAction) {
        if let Err(e) = self.log.log_action(self.log_id, action) {
            warn!(operation = %self.log_id, error = %e, "failed to log rollback action");
        }
    }

    fn restore_registry(&self, state: &MigrationState) -> StepOutcome {
        let Some(backup_id) = state.registry_backup_id.as_deref().filter(|id| !id.is_empty())
        else {
            return StepOutcome::Skipped;
        };
        let Some(registry) = self.registry else {
            return StepOutcome::Recoverable(format!(
                "registry backup {} cannot be restored: no registry available",
                backup_id
            ));
        };
        match registry.restore_backup(backup_id) {
            Ok(summary) if summary.failed.is_empty() => {
                self.record(
                    OperationAction::new(ActionKind::RestoreRegistry, "restored registry backup")
                        .with_before(backup_id),
                );
                StepOutcome::Done
            }
            Ok(summary) => StepOutcome::Recoverable(format!(
                "registry backup {} partially restored; failed: {}",
                backup_id,
                summary.failed.join(", ")
            )),
            Err(e) => StepOutcome::Recoverable(format!(
                "registry backup {} not restored: {}",
                backup_id, e
            )),
        }
    }

    fn remove_redirect(&self, state: &MigrationState) -> StepOutcome {
        if !state.redirect_created {
            return StepOutcome::Skipped;
        }
        let link = state
            .redirect_path
            .clone()
            .unwrap_or_else(|| state.source_path.clone());
        match self.redirects.try_remove_link(&link) {
            Ok(true) => {
                self.record(
                    OperationAction::new(ActionKind::RemoveRedirect, "removed redirect")
                        .with_before(link.display().to_string()),
                );
                StepOutcome::Done
            }
            Ok(false) if fs::symlink_metadata(&link).is_err() => StepOutcome::Done,
            Ok(false) => StepOutcome::Fatal(format!(
                "{} is no longer a redirect; refusing to restore over it",
                link.display()
            )),
            Err(e) => StepOutcome::Fatal(format!(
                "failed to remove redirect {}: {}",
                link.display(),
                e
            )),
        }
    }

    fn return_leftovers(&self, state: &MigrationState) -> StepOutcome {
        let Some(leftover) = &state.leftover_dir else {
            return StepOutcome::Skipped;
        };
        if !leftover.exists() {
            return StepOutcome::Recoverable(format!(
                "leftover directory {} has disappeared",
                leftover.display()
            ));
        }
        if fs::symlink_metadata(&state.source_path).is_ok() {
            return StepOutcome::Fatal(format!(
                "{} is occupied; leftovers remain at {}",
                state.source_path.display(),
                leftover.display()
            ));
        }
        match fs::rename(leftover, &state.source_path) {
            Ok(()) => {
                self.record(
                    OperationAction::new(ActionKind::MoveLeftovers, "returned skipped files")
                        .with_before(leftover.display().to_string())
                        .with_after(state.source_path.display().to_string()),
                );
                StepOutcome::Done
            }
            Err(e) => StepOutcome::Fatal(format!(
                "failed to move {} back: {}",
                leftover.display(),
                e
            )),
        }
    }

    fn restore_file(&self, target: &Path, source: &Path) -> StepOutcome {
        if source.exists() {
            return StepOutcome::Skipped;
        }
        if !target.is_file() {
            return StepOutcome::Recoverable(format!(
                "cannot restore {}: copy {} is gone",
                source.display(),
                target.display()
            ));
        }
        let copied = source
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::copy(target, source));
        match copied {
            Ok(_) => {
                self.record(
                    OperationAction::new(ActionKind::RestoreFile, "restored original")
                        .with_before(target.display().to_string())
                        .with_after(source.display().to_string()),
                );
                StepOutcome::Done
            }
            Err(e) => {
                // Do not leave a truncated original behind.
                let _ = fs::remove_file(source);
                StepOutcome::Recoverable(format!("failed to restore {}: {}", source.display(), e))
            }
        }
    }

    fn remove_copy(&self, state: &MigrationState, target: &Path) -> StepOutcome {
        if !target.exists() {
            return StepOutcome::Skipped;
        }
        // Keep the only remaining copy of a file whose original could not be restored.
        if let Some(source) = state.original_of(target) {
            if !source.exists() {
                return StepOutcome::Recoverable(format!(
                    "kept {}: original {} is missing",
                    target.display(),
                    source.display()
                ));
            }
        }
        match fs::remove_file(target) {
            Ok(()) => {
                self.record(
                    OperationAction::new(ActionKind::RemoveCopy, "removed copy")
                        .with_before(target.display().to_string()),
                );
                StepOutcome::Done
            }
            Err(e) => {
                StepOutcome::Recoverable(format!("failed to remove {}: {}", target.display(), e))
            }
        }
    }
}

fn missing_sources(state: &MigrationState) -> Vec<PathBuf> {
    state
        .original_files
        .values()
        .filter(|source| !source.exists())
        .cloned()
        .collect()
}

/// Remove empty directories under `root` bottom-up, then `root` itself if empty.
pub(crate) fn remove_empty_dirs(root: &Path) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            // Fails harmlessly when the directory still has content.
            let _ = fs::remove_dir(entry.path());
        }
    }
}
