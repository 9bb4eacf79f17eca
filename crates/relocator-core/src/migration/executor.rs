use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::lock;
use super::policy::{ConflictPolicy, LockedFilePolicy, MigrationOptions};
use super::progress::{CancellationToken, MigrationPhase, ProgressEvent};
use super::rollback::{remove_empty_dirs, Rollback, RollbackReport};
use super::state::{MigrationState, StateStore};
use crate::error::{RelocatorError, Result};
use crate::hash;
use crate::oplog::{ActionKind, OperationAction, OperationId, OperationKind, OperationLog};
use crate::planner::MigrationPlan;
use crate::redirect::{reparse, RedirectInfo, RedirectKind, RedirectManager};
use crate::registry::{RegistryUpdateResult, RegistryUpdater};

/// A file that reached the target tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedFile {
    pub source: PathBuf,
    /// Where it was written; differs from the plan when renamed on conflict
    pub target: PathBuf,
    pub size: u64,
}

/// A file that was skipped or failed, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssue {
    pub path: PathBuf,
    pub reason: String,
}

/// Why a run stopped and rolled back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    FileLocked(PathBuf),
    RedirectFailed(String),
    Unexpected(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "{}", RelocatorError::OperationCancelled),
            Self::FileLocked(path) => {
                write!(f, "{}", RelocatorError::FileLocked { path: path.clone() })
            }
            Self::RedirectFailed(message) | Self::Unexpected(message) => write!(f, "{}", message),
        }
    }
}

impl From<RelocatorError> for AbortReason {
    fn from(err: RelocatorError) -> Self {
        Self::Unexpected(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub operation_id: OperationId,
    pub success: bool,
    /// Phase the run ended in
    pub phase: MigrationPhase,
    pub migrated_files: Vec<MigratedFile>,
    pub skipped_files: Vec<FileIssue>,
    pub failed_files: Vec<FileIssue>,
    pub redirect: Option<RedirectInfo>,
    pub registry: Option<RegistryUpdateResult>,
    /// Registry phase error; never fatal to the migration
    pub registry_error: Option<String>,
    pub leftover_dir: Option<PathBuf>,
    pub rolled_back: Option<RollbackReport>,
    pub abort: Option<AbortReason>,
}

/// What `execute` would run into, computed without side effects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPreview {
    pub plan_id: String,
    pub file_count: usize,
    pub total_size: u64,
    pub available_space: u64,
    pub sufficient_space: bool,
    /// Planned targets that already exist
    pub conflicts: Vec<PathBuf>,
    pub conflict_policy: ConflictPolicy,
    /// Sources currently held by another process
    pub locked_files: Vec<PathBuf>,
    pub locked_file_policy: LockedFilePolicy,
    pub redirect_kind: RedirectKind,
    pub redirect_supported: bool,
    /// Registry values that would be rewritten, when registry updates are on
    pub registry_references: Option<usize>,
}

/// A migration running on a worker thread
pub struct MigrationHandle {
    operation_progress: Receiver<ProgressEvent>,
    cancel: CancellationToken,
    worker: JoinHandle<Result<MigrationResult>>,
}

impl MigrationHandle {
    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.operation_progress
    }

    /// Request cancellation; honored between files.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn wait(self) -> Result<MigrationResult> {
        self.worker.join().unwrap_or_else(|_| {
            Err(RelocatorError::Io(std::io::Error::other(
                "migration worker panicked",
            )))
        })
    }
}

/// Per-run bookkeeping
struct Run<'a> {
    plan: &'a MigrationPlan,
    state: MigrationState,
    migrated: Vec<MigratedFile>,
    skipped: Vec<FileIssue>,
    failed: Vec<FileIssue>,
    redirect: Option<RedirectInfo>,
    registry: Option<RegistryUpdateResult>,
    registry_error: Option<String>,
}

pub struct MigrationExecutor {
    options: MigrationOptions,
    redirects: RedirectManager,
    log: Arc<OperationLog>,
    registry: Option<Arc<RegistryUpdater>>,
    states: StateStore,
    /// Transaction records kept in memory, keyed by operation
    transactions: Mutex<HashMap<OperationId, MigrationState>>,
}

impl MigrationExecutor {
    /// State snapshots are kept under `base_dir`.
    pub fn new(log: Arc<OperationLog>, base_dir: &Path, options: MigrationOptions) -> Self {
        Self {
            options,
            redirects: RedirectManager::new(),
            log,
            registry: None,
            states: StateStore::new(base_dir),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<RegistryUpdater>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Transaction record for `id`: memory first, then the persisted snapshot.
    pub fn state(&self, id: &OperationId) -> Result<Option<MigrationState>> {
        if let Some(state) = self.transactions.lock().get(id) {
            return Ok(Some(state.clone()));
        }
        self.states.load(id)
    }

    /// Drop snapshots older than the history retention window.
    pub fn purge_expired_states(&self) -> Result<usize> {
        self.states.purge_older_than(self.log.retention_days())
    }

    pub fn preview(&self, plan: &MigrationPlan) -> PlanPreview {
        let conflicts = plan
            .files
            .iter()
            .filter(|f| fs::symlink_metadata(&f.target).is_ok())
            .map(|f| f.target.clone())
            .collect();
        let locked_files = plan
            .files
            .iter()
            .filter(|f| lock::is_locked(&f.source))
            .map(|f| f.source.clone())
            .collect();
        let redirect_kind = self.options.redirect.resolve(&self.redirects, &plan.source_path);
        let redirect_supported = match redirect_kind {
            RedirectKind::Junction => self.redirects.supports_junction(&plan.source_path),
            RedirectKind::SymbolicLink => self.redirects.supports_symbolic_link(),
        };
        let registry_references = match (&self.registry, self.options.update_registry) {
            (Some(registry), true) => {
                Some(registry.find_references(&display_path(&plan.source_path)).len())
            }
            _ => None,
        };

        PlanPreview {
            plan_id: plan.id.clone(),
            file_count: plan.files.len(),
            total_size: plan.total_size,
            available_space: plan.available_space,
            sufficient_space: plan.has_sufficient_space(),
            conflicts,
            conflict_policy: self.options.conflict_policy,
            locked_files,
            locked_file_policy: self.options.locked_file_policy,
            redirect_kind,
            redirect_supported,
            registry_references,
        }
    }

    /// Run `plan` on a worker thread.
    pub fn spawn(self: &Arc<Self>, plan: MigrationPlan) -> Result<MigrationHandle> {
        let (tx, rx) = unbounded();
        let cancel = CancellationToken::new();
        let executor = Arc::clone(self);
        let token = cancel.clone();

        let worker = thread::Builder::new()
            .name("relocator-migration".into())
            .spawn(move || {
                executor.execute(plan, &token, &mut |event: &ProgressEvent| {
                    // Receiver may be gone; progress is advisory.
                    let _ = tx.send(event.clone());
                })
            })?;

        Ok(MigrationHandle {
            operation_progress: rx,
            cancel,
            worker,
        })
    }

    /// Run `plan` to completion on the calling thread.
    ///
    /// Fails without side effects on invalid plans and insufficient space.
    /// Everything after that is reported through [`MigrationResult`].
    pub fn execute(
        &self,
        plan: MigrationPlan,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<MigrationResult> {
        validate(&plan)?;
        if plan.total_size > plan.available_space {
            return Err(RelocatorError::InsufficientSpace {
                required: plan.total_size,
                available: plan.available_space,
            });
        }

        let op_id = self.log.begin_operation(
            OperationKind::Migration,
            format!(
                "Migrate {} from {} to {}",
                plan.software.name,
                plan.source_path.display(),
                plan.target_path.display()
            ),
        )?;
        info!(operation = %op_id, plan = %plan.id, files = plan.files.len(), "migration started");

        let mut run = Run {
            plan: &plan,
            state: MigrationState::new(op_id.clone(), &plan.source_path, &plan.target_path),
            migrated: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            redirect: None,
            registry: None,
            registry_error: None,
        };

        match self.run_phases(&mut run, cancel, progress) {
            Ok(()) => self.finish(run),
            Err(reason) => self.abort(run, reason, progress),
        }
    }

    fn run_phases(
        &self,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&ProgressEvent),
    ) -> std::result::Result<(), AbortReason> {
        self.enter(run, MigrationPhase::CopyingFiles, cancel, progress)?;
        self.copy_files(run, cancel, progress)?;

        if self.options.verify_integrity {
            self.enter(run, MigrationPhase::VerifyingIntegrity, cancel, progress)?;
            self.verify(run, progress);
        }

        if !run.failed.is_empty() || run.migrated.is_empty() {
            // Copies stay in place and the snapshot is kept for an explicit undo.
            info!(
                operation = %run.state.operation_id,
                migrated = run.migrated.len(),
                failed = run.failed.len(),
                "originals kept; no redirect created"
            );
            return Ok(());
        }

        self.enter(run, MigrationPhase::DeletingOriginals, cancel, progress)?;
        self.delete_originals(run);
        self.park_leftovers(run)?;
        self.save(run)?;

        self.enter(run, MigrationPhase::CreatingRedirect, cancel, progress)?;
        self.create_redirect(run)?;

        if self.options.update_registry {
            if let Some(registry) = self.registry.clone() {
                self.enter(run, MigrationPhase::UpdatingRegistry, cancel, progress)?;
                self.update_registry(run, &registry);
            }
        }
        Ok(())
    }

    /// Phase transition: cancellation check, snapshot, log, progress.
    fn enter(
        &self,
        run: &mut Run<'_>,
        phase: MigrationPhase,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&ProgressEvent),
    ) -> std::result::Result<(), AbortReason> {
        if cancel.is_cancelled() {
            return Err(AbortReason::Cancelled);
        }
        run.state.phase = phase;
        self.save(run)?;
        self.record(
            &run.state.operation_id,
            OperationAction::new(ActionKind::PhaseChange, phase.as_str()),
        );
        debug!(operation = %run.state.operation_id, %phase, "phase");
        progress(&ProgressEvent::phase(
            phase,
            run.plan.files.len(),
            run.plan.total_size,
        ));
        Ok(())
    }

    fn save(&self, run: &mut Run<'_>) -> Result<()> {
        self.states.save(&mut run.state)?;
        self.transactions
            .lock()
            .insert(run.state.operation_id.clone(), run.state.clone());
        Ok(())
    }

    fn record(&self, id: &OperationId, action: OperationAction) {
        if let Err(e) = self.log.log_action(id, action) {
            warn!(operation = %id, error = %e, "failed to log action");
        }
    }

    fn copy_files(
        &self,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&ProgressEvent),
    ) -> std::result::Result<(), AbortReason> {
        let plan = run.plan;
        let mut bytes_done = 0u64;

        for (index, file) in plan.files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AbortReason::Cancelled);
            }

            if lock::is_locked(&file.source) {
                match self.options.locked_file_policy {
                    LockedFilePolicy::Abort => {
                        return Err(AbortReason::FileLocked(file.source.clone()));
                    }
                    LockedFilePolicy::Skip | LockedFilePolicy::AskDeferredToSkip => {
                        let reason = RelocatorError::FileLocked {
                            path: file.source.clone(),
                        };
                        self.skip(run, &file.source, &reason.to_string());
                        bytes_done += file.size;
                        continue;
                    }
                }
            }

            let mut target = file.target.clone();
            if fs::symlink_metadata(&target).is_ok() {
                let conflict = RelocatorError::FileConflict {
                    path: target.clone(),
                };
                match self.options.conflict_policy {
                    ConflictPolicy::Skip => {
                        self.skip(run, &file.source, &conflict.to_string());
                        bytes_done += file.size;
                        continue;
                    }
                    ConflictPolicy::AskDeferredToSkip => {
                        let reason = format!("{} (decision deferred)", conflict);
                        self.skip(run, &file.source, &reason);
                        bytes_done += file.size;
                        continue;
                    }
                    ConflictPolicy::Overwrite => {
                        debug!(target = %target.display(), "overwriting existing target");
                    }
                    ConflictPolicy::Rename => {
                        target = renamed_target(&target);
                        debug!(target = %target.display(), "conflict; writing renamed copy");
                    }
                }
            }

            match copy_one(&file.source, &target) {
                Ok(()) => {
                    run.state.record_copy(&target, &file.source);
                    self.save(run)?;
                    self.record(
                        &run.state.operation_id,
                        OperationAction::new(ActionKind::CopyFile, "copied file")
                            .with_before(file.source.display().to_string())
                            .with_after(target.display().to_string())
                            .reversible(),
                    );
                    run.migrated.push(MigratedFile {
                        source: file.source.clone(),
                        target: target.clone(),
                        size: file.size,
                    });
                }
                Err(e) => {
                    warn!(source = %file.source.display(), error = %e, "copy failed");
                    run.failed.push(FileIssue {
                        path: file.source.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            bytes_done += file.size;

            let fraction = if plan.total_size > 0 {
                bytes_done as f64 / plan.total_size as f64
            } else {
                (index + 1) as f64 / plan.files.len() as f64
            };
            let mut event =
                ProgressEvent::phase(MigrationPhase::CopyingFiles, plan.files.len(), plan.total_size)
                    .at(fraction);
            event.current_file = Some(file.source.clone());
            event.files_done = index + 1;
            event.bytes_transferred = bytes_done;
            progress(&event);
        }
        Ok(())
    }

    fn skip(&self, run: &mut Run<'_>, source: &Path, reason: &str) {
        info!(source = %source.display(), reason, "skipping file");
        self.record(
            &run.state.operation_id,
            OperationAction::new(ActionKind::SkipFile, reason)
                .with_before(source.display().to_string()),
        );
        run.skipped.push(FileIssue {
            path: source.to_path_buf(),
            reason: reason.to_string(),
        });
    }

    fn verify(&self, run: &mut Run<'_>, progress: &mut dyn FnMut(&ProgressEvent)) {
        let count = run.migrated.len();
        let mut verified = Vec::with_capacity(count);

        for (index, file) in std::mem::take(&mut run.migrated).into_iter().enumerate() {
            match hash::files_match(&file.source, &file.target) {
                Ok(true) => verified.push(file),
                outcome => {
                    let err = RelocatorError::IntegrityMismatch {
                        path: file.source.clone(),
                    };
                    let reason = match outcome {
                        Err(e) => format!("{}: {}", err, e),
                        _ => err.to_string(),
                    };
                    warn!("{}", reason);
                    self.record(
                        &run.state.operation_id,
                        OperationAction::new(ActionKind::VerifyFailed, reason.clone())
                            .with_before(file.source.display().to_string())
                            .with_after(file.target.display().to_string()),
                    );
                    run.failed.push(FileIssue {
                        path: file.source,
                        reason,
                    });
                }
            }

            let mut event = ProgressEvent::phase(
                MigrationPhase::VerifyingIntegrity,
                run.plan.files.len(),
                run.plan.total_size,
            )
            .at((index + 1) as f64 / count.max(1) as f64);
            event.files_done = index + 1;
            progress(&event);
        }
        run.migrated = verified;
    }

    // Best-effort: skipped files legitimately keep their directories alive.
    fn delete_originals(&self, run: &mut Run<'_>) {
        for file in &run.migrated {
            match fs::remove_file(&file.source) {
                Ok(()) => self.record(
                    &run.state.operation_id,
                    OperationAction::new(ActionKind::DeleteFile, "deleted original")
                        .with_before(file.source.display().to_string())
                        .reversible(),
                ),
                Err(e) => {
                    warn!(source = %file.source.display(), error = %e, "could not delete original")
                }
            }
        }
        remove_empty_dirs(&run.plan.source_path);
        run.state.deleted_originals = true;
    }

    /// Move whatever is left at the source aside so the redirect can take its place.
    fn park_leftovers(&self, run: &mut Run<'_>) -> std::result::Result<(), AbortReason> {
        let source = &run.plan.source_path;
        if fs::symlink_metadata(source).is_err() {
            return Ok(());
        }

        let leftover = leftover_path(source, &run.state.operation_id);
        fs::rename(source, &leftover).map_err(|e| {
            AbortReason::RedirectFailed(format!(
                "cannot move remaining files out of {}: {}",
                source.display(),
                e
            ))
        })?;
        info!(leftover = %leftover.display(), "remaining files moved aside");
        self.record(
            &run.state.operation_id,
            OperationAction::new(ActionKind::MoveLeftovers, "moved skipped files aside")
                .with_before(source.display().to_string())
                .with_after(leftover.display().to_string())
                .reversible(),
        );
        run.state.leftover_dir = Some(leftover);
        Ok(())
    }

    fn create_redirect(&self, run: &mut Run<'_>) -> std::result::Result<(), AbortReason> {
        let link = run.plan.source_path.clone();
        let kind = self.options.redirect.resolve(&self.redirects, &link);

        let info = self
            .redirects
            .create(kind, &link, &run.plan.target_path)
            .map_err(|source| {
                AbortReason::RedirectFailed(
                    RelocatorError::RedirectCreationFailed {
                        path: link.clone(),
                        source,
                    }
                    .to_string(),
                )
            })?;

        run.state.redirect_created = true;
        run.state.redirect_path = Some(link.clone());
        run.state.redirect_kind = Some(kind);
        self.save(run)?;
        self.record(
            &run.state.operation_id,
            OperationAction::new(ActionKind::CreateRedirect, format!("created {}", kind))
                .with_before(link.display().to_string())
                .with_after(info.target_path.display().to_string())
                .reversible(),
        );
        run.redirect = Some(info);
        Ok(())
    }

    // Never fatal: the redirect already keeps the old path resolvable.
    fn update_registry(&self, run: &mut Run<'_>, registry: &RegistryUpdater) {
        let old = display_path(&run.plan.source_path);
        let new = display_path(&run.plan.target_path);
        let references = registry.find_references(&old);
        if references.is_empty() {
            debug!(path = %old, "no registry references");
            return;
        }

        match registry.update_references(run.state.operation_id.as_str(), &references, &old, &new)
        {
            Ok(result) => {
                if !result.backup_id.is_empty() {
                    run.state.registry_backup_id = Some(result.backup_id.clone());
                    if let Err(e) = self.save(run) {
                        warn!(error = %e, "failed to snapshot registry backup id");
                    }
                    self.record(
                        &run.state.operation_id,
                        OperationAction::new(ActionKind::BackupRegistry, "registry backup")
                            .with_after(result.backup_id.clone())
                            .reversible(),
                    );
                }
                self.record(
                    &run.state.operation_id,
                    OperationAction::new(
                        ActionKind::UpdateRegistry,
                        format!(
                            "{} updated, {} failed",
                            result.updated_count(),
                            result.failed_count()
                        ),
                    )
                    .with_before(old)
                    .with_after(new)
                    .reversible(),
                );
                run.registry = Some(result);
            }
            Err(e) => {
                warn!(error = %e, "registry update failed");
                run.registry_error = Some(e.to_string());
            }
        }
    }

    fn finish(&self, mut run: Run<'_>) -> Result<MigrationResult> {
        let success = run.failed.is_empty();
        run.state.phase = MigrationPhase::Completed;
        // Phases are done; a failed final snapshot is only logged.
        if let Err(e) = self.save(&mut run) {
            warn!(operation = %run.state.operation_id, error = %e, "failed to snapshot completion");
        }
        self.log
            .complete_operation(&run.state.operation_id, success)?;
        info!(
            operation = %run.state.operation_id,
            success,
            migrated = run.migrated.len(),
            skipped = run.skipped.len(),
            failed = run.failed.len(),
            "migration finished"
        );

        Ok(MigrationResult {
            operation_id: run.state.operation_id.clone(),
            success,
            phase: MigrationPhase::Completed,
            leftover_dir: run.state.leftover_dir.clone(),
            migrated_files: run.migrated,
            skipped_files: run.skipped,
            failed_files: run.failed,
            redirect: run.redirect,
            registry: run.registry,
            registry_error: run.registry_error,
            rolled_back: None,
            abort: None,
        })
    }

    fn abort(
        &self,
        mut run: Run<'_>,
        reason: AbortReason,
        progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<MigrationResult> {
        let op_id = run.state.operation_id.clone();
        warn!(operation = %op_id, reason = %reason, "migration aborted");

        run.state.phase = MigrationPhase::RollingBack;
        if let Err(e) = self.save(&mut run) {
            warn!(operation = %op_id, error = %e, "failed to snapshot rollback start");
        }
        progress(&ProgressEvent::phase(
            MigrationPhase::RollingBack,
            run.plan.files.len(),
            run.plan.total_size,
        ));

        let report = self.rollback_state(&run.state, &op_id);
        self.settle(&op_id, &report);
        progress(&ProgressEvent::phase(
            MigrationPhase::RolledBack,
            run.plan.files.len(),
            run.plan.total_size,
        ));
        self.log.complete_operation(&op_id, false)?;

        Ok(MigrationResult {
            operation_id: op_id,
            success: false,
            phase: MigrationPhase::RolledBack,
            migrated_files: Vec::new(),
            skipped_files: run.skipped,
            failed_files: run.failed,
            redirect: None,
            registry: None,
            registry_error: run.registry_error,
            leftover_dir: None,
            rolled_back: Some(report),
            abort: Some(reason),
        })
    }

    fn rollback_state(&self, state: &MigrationState, log_id: &OperationId) -> RollbackReport {
        Rollback {
            redirects: &self.redirects,
            registry: self.registry.as_deref(),
            log: &self.log,
            log_id,
        }
        .run(state)
    }

    // A rollback that was stopped keeps its state so it can be retried.
    fn settle(&self, id: &OperationId, report: &RollbackReport) {
        if report.aborted.is_some() {
            return;
        }
        self.transactions.lock().remove(id);
        if let Err(e) = self.states.remove(id) {
            warn!(operation = %id, error = %e, "failed to remove state snapshot");
        }
    }

    /// Undo a previous migration from its transaction record.
    ///
    /// Fails with `StateUnavailable` when neither memory nor a snapshot holds
    /// the record, for example after it was already rolled back.
    pub fn rollback_operation(&self, id: &OperationId) -> Result<RollbackReport> {
        let state = self
            .state(id)?
            .ok_or_else(|| RelocatorError::StateUnavailable {
                operation_id: id.to_string(),
            })?;

        let undo_id = self
            .log
            .begin_operation(OperationKind::Rollback, format!("Undo {}", id))?;
        let report = self.rollback_state(&state, &undo_id);
        self.settle(id, &report);
        self.log.complete_operation(&undo_id, report.is_complete())?;
        Ok(report)
    }
}

fn validate(plan: &MigrationPlan) -> Result<()> {
    if plan.source_path.as_os_str().is_empty() || plan.target_path.as_os_str().is_empty() {
        return Err(RelocatorError::InvalidArgument(
            "plan source and target must not be empty".into(),
        ));
    }
    if plan.target_path.starts_with(&plan.source_path) {
        return Err(RelocatorError::InvalidArgument(format!(
            "target {} lies inside source {}",
            plan.target_path.display(),
            plan.source_path.display()
        )));
    }
    for file in &plan.files {
        let escapes = match file.target.strip_prefix(&plan.target_path) {
            Ok(rel) => !rel.components().all(|c| matches!(c, Component::Normal(_))),
            Err(_) => true,
        };
        if escapes {
            return Err(RelocatorError::InvalidArgument(format!(
                "{} escapes the target directory",
                file.target.display()
            )));
        }
    }
    Ok(())
}

fn copy_one(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let existed = target.exists();
    if let Err(e) = fs::copy(source, target) {
        if !existed {
            let _ = fs::remove_file(target);
        }
        return Err(e);
    }
    Ok(())
}

/// `name.ext` -> `name_1.ext`, `name_2.ext`, ... until free.
fn renamed_target(target: &Path) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new(""));
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, n, ext));
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

fn leftover_path(source: &Path, id: &OperationId) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "install".to_string());
    let suffix: String = id
        .as_str()
        .trim_start_matches("op-")
        .chars()
        .take(8)
        .collect();
    source.with_file_name(format!("{}.relocator-leftover-{}", name, suffix))
}

fn display_path(path: &Path) -> String {
    reparse::strip_verbatim(path).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renamed_target_finds_first_free_suffix() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let target = temp.path().join("cfg.ini");
        fs::write(&target, b"existing")?;
        assert_eq!(renamed_target(&target), temp.path().join("cfg_1.ini"));

        fs::write(temp.path().join("cfg_1.ini"), b"also existing")?;
        assert_eq!(renamed_target(&target), temp.path().join("cfg_2.ini"));

        let bare = temp.path().join("README");
        fs::write(&bare, b"x")?;
        assert_eq!(renamed_target(&bare), temp.path().join("README_1"));
        Ok(())
    }

    #[test]
    fn leftover_path_is_a_sibling() {
        let id = OperationId::from_string("op-0123456789abcdef");
        assert_eq!(
            leftover_path(Path::new("/apps/Tool"), &id),
            PathBuf::from("/apps/Tool.relocator-leftover-01234567")
        );
    }

    #[test]
    fn abort_reason_messages() {
        assert_eq!(AbortReason::Cancelled.to_string(), "Operation cancelled");
        assert!(AbortReason::FileLocked(PathBuf::from("x.dll"))
            .to_string()
            .contains("x.dll"));
    }
}
