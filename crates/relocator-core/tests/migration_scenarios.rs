use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relocator_core::registry::{Hive, MemoryRegistry, RegistryKeyPath, RegistryValue};
use relocator_core::{
    AbortReason, ActionKind, CancellationToken, ConflictPolicy, LockedFilePolicy,
    MigrationExecutor, MigrationOptions, MigrationPhase, MigrationPlan, MigrationPlanner,
    OperationLog, OperationStatus, ProgressEvent, RedirectManager, RedirectPreference,
    RegistryUpdater, RelocatorError, Result, SoftwareEntry, TemplateRenderer,
};
use tempfile::TempDir;

struct Env {
    _temp: TempDir,
    base: PathBuf,
    source: PathBuf,
    target_base: PathBuf,
    log: Arc<OperationLog>,
}

fn setup() -> Result<Env> {
    let temp = TempDir::new()?;
    let base = temp.path().join("state");
    let source = temp.path().join("C").join("App");
    let target_base = temp.path().join("D").join("Apps");

    fs::create_dir_all(source.join("data"))?;
    fs::write(source.join("a.txt"), vec![b'a'; 10])?;
    fs::write(source.join("data").join("b.bin"), vec![b'b'; 20])?;
    fs::write(source.join("data").join("c.bin"), vec![b'c'; 30])?;
    fs::create_dir_all(&target_base)?;

    let log = Arc::new(OperationLog::open(&base)?);
    Ok(Env {
        _temp: temp,
        base,
        source,
        target_base,
        log,
    })
}

impl Env {
    fn plan(&self) -> Result<MigrationPlan> {
        MigrationPlanner::new().create_plan(
            &SoftwareEntry::new("App", &self.source),
            &self.target_base,
            &TemplateRenderer::default(),
        )
    }

    fn executor(&self, options: MigrationOptions) -> MigrationExecutor {
        MigrationExecutor::new(Arc::clone(&self.log), &self.base, options)
    }
}

fn run(executor: &MigrationExecutor, plan: MigrationPlan) -> Result<relocator_core::MigrationResult> {
    executor.execute(plan, &CancellationToken::new(), &mut |_: &ProgressEvent| {})
}

/// Relative path -> content of every file under `root`
fn tree(root: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| RelocatorError::Io(e.into()))?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
            files.insert(rel, fs::read(entry.path())?);
        }
    }
    Ok(files)
}

fn assert_redirect(link: &Path, target: &Path) {
    let info = RedirectManager::new()
        .inspect(link)
        .expect("redirect at the old location");
    assert_eq!(
        fs::canonicalize(&info.target_path).unwrap(),
        fs::canonicalize(target).unwrap()
    );
    assert!(info.target_exists);
}

#[test]
fn space_gate_rejects_without_side_effects() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let mut plan = env.plan()?;
    plan.available_space = plan.total_size - 1;
    let target = plan.target_path.clone();

    let err = run(&env.executor(MigrationOptions::default()), plan).unwrap_err();

    assert!(matches!(
        err,
        RelocatorError::InsufficientSpace {
            required: 60,
            available: 59
        }
    ));
    assert_eq!(tree(&env.source)?, before);
    assert!(!target.exists());
    assert!(env.log.get_history(None, None)?.is_empty());
    Ok(())
}

#[test]
fn clean_migration_moves_everything_behind_a_redirect() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    assert_eq!(target, env.target_base.join("App"));

    let result = run(&env.executor(MigrationOptions::default()), plan)?;

    assert!(result.success);
    assert_eq!(result.phase, MigrationPhase::Completed);
    assert_eq!(result.migrated_files.len(), 3);
    assert!(result.failed_files.is_empty());
    assert!(result.skipped_files.is_empty());
    assert!(result.leftover_dir.is_none());
    assert!(result.redirect.is_some());
    assert_redirect(&env.source, &target);

    // Old path still resolves to the same content.
    assert_eq!(tree(&target)?, before);
    assert_eq!(fs::read(env.source.join("a.txt"))?, vec![b'a'; 10]);

    let record = env.log.get_operation(&result.operation_id)?.unwrap();
    assert_eq!(record.status(), OperationStatus::Succeeded);
    assert!(record
        .actions
        .iter()
        .any(|a| a.kind == ActionKind::CreateRedirect && a.rollback_capable));
    Ok(())
}

#[test]
fn rollback_after_success_restores_the_original_tree() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    let executor = env.executor(MigrationOptions::default());

    let result = run(&executor, plan)?;
    assert!(result.success);

    let report = executor.rollback_operation(&result.operation_id)?;

    assert!(report.is_complete());
    assert!(report.redirect_removed);
    assert_eq!(report.restored.len(), 3);
    assert!(RedirectManager::new().inspect(&env.source).is_none());
    assert_eq!(tree(&env.source)?, before);
    assert!(!target.exists());
    Ok(())
}

#[test]
fn undo_works_from_a_snapshot_after_restart() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let op = {
        let executor = env.executor(MigrationOptions::default());
        run(&executor, env.plan()?)?.operation_id
    };

    // Fresh log and executor over the same base directory
    let log = Arc::new(OperationLog::open(&env.base)?);
    let executor = MigrationExecutor::new(log, &env.base, MigrationOptions::default());
    let report = executor.rollback_operation(&op)?;
    assert!(report.is_complete());
    assert_eq!(tree(&env.source)?, before);

    // The record is consumed by the rollback.
    assert!(matches!(
        executor.rollback_operation(&op),
        Err(RelocatorError::StateUnavailable { .. })
    ));
    Ok(())
}

#[test]
fn unknown_operation_has_no_state() -> Result<()> {
    let env = setup()?;
    let executor = env.executor(MigrationOptions::default());
    let err = executor
        .rollback_operation(&relocator_core::OperationId::from_string("op-unknown"))
        .unwrap_err();
    assert!(matches!(err, RelocatorError::StateUnavailable { .. }));
    assert_eq!(err.exit_code(), 5);
    Ok(())
}

#[test]
fn tampered_copy_fails_verification_and_keeps_originals() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    let tampered = plan.target_path.join("a.txt");

    let result = env.executor(MigrationOptions::default()).execute(
        plan,
        &CancellationToken::new(),
        &mut |event: &ProgressEvent| {
            if event.phase == MigrationPhase::VerifyingIntegrity && event.files_done == 0 {
                let mut bytes = fs::read(&tampered).unwrap();
                bytes[0] ^= 0xFF;
                fs::write(&tampered, bytes).unwrap();
            }
        },
    )?;

    assert!(!result.success);
    assert_eq!(result.failed_files.len(), 1);
    assert_eq!(result.failed_files[0].path, env.source.join("a.txt"));
    assert_eq!(result.migrated_files.len(), 2);
    assert!(result.redirect.is_none());
    assert_eq!(tree(&env.source)?, before);
    assert!(RedirectManager::new().inspect(&env.source).is_none());
    Ok(())
}

#[test]
fn conflict_with_rename_policy_writes_suffixed_copy() -> Result<()> {
    let env = setup()?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    fs::create_dir_all(&target)?;
    fs::write(target.join("a.txt"), b"already here")?;

    let options = MigrationOptions {
        conflict_policy: ConflictPolicy::Rename,
        ..Default::default()
    };
    let result = run(&env.executor(options), plan)?;

    assert!(result.success);
    assert_eq!(fs::read(target.join("a.txt"))?, b"already here");
    assert_eq!(fs::read(target.join("a_1.txt"))?, vec![b'a'; 10]);
    assert!(result
        .migrated_files
        .iter()
        .any(|f| f.target == target.join("a_1.txt")));
    Ok(())
}

#[test]
fn conflict_with_skip_policy_leaves_source_file_behind() -> Result<()> {
    let env = setup()?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    fs::create_dir_all(&target)?;
    fs::write(target.join("a.txt"), b"already here")?;

    let options = MigrationOptions {
        conflict_policy: ConflictPolicy::Skip,
        ..Default::default()
    };
    let result = run(&env.executor(options), plan)?;

    assert!(result.success);
    assert_eq!(result.skipped_files.len(), 1);
    let leftover = result.leftover_dir.clone().expect("leftovers parked");
    assert_eq!(fs::read(leftover.join("a.txt"))?, vec![b'a'; 10]);
    assert_redirect(&env.source, &target);
    Ok(())
}

#[test]
fn cancellation_mid_copy_rolls_back() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    let token = CancellationToken::new();
    let canceller = token.clone();

    let result = env.executor(MigrationOptions::default()).execute(
        plan,
        &token,
        &mut |event: &ProgressEvent| {
            if event.phase == MigrationPhase::CopyingFiles && event.files_done == 1 {
                canceller.cancel();
            }
        },
    )?;

    assert!(!result.success);
    assert_eq!(result.abort, Some(AbortReason::Cancelled));
    assert_eq!(result.phase, MigrationPhase::RolledBack);
    let report = result.rolled_back.expect("rollback report");
    assert!(report.missing.is_empty());
    assert!(tree(&target)?.is_empty());
    assert_eq!(tree(&env.source)?, before);
    assert!(RedirectManager::new().inspect(&env.source).is_none());

    let record = env.log.get_operation(&result.operation_id)?.unwrap();
    assert_eq!(record.status(), OperationStatus::Failed);
    Ok(())
}

#[cfg(unix)]
#[test]
fn locked_file_is_skipped_and_redirect_still_created() -> Result<()> {
    use fs2::FileExt;

    let env = setup()?;
    let locked = env.source.join("data").join("b.bin");
    let holder = fs::File::open(&locked)?;
    holder.lock_exclusive()?;

    let plan = env.plan()?;
    let target = plan.target_path.clone();
    let result = run(&env.executor(MigrationOptions::default()), plan)?;

    assert!(result.success);
    assert_eq!(result.migrated_files.len(), 2);
    assert_eq!(result.skipped_files.len(), 1);
    assert_eq!(result.skipped_files[0].path, locked);
    assert_redirect(&env.source, &target);

    let leftover = result.leftover_dir.expect("locked file parked");
    assert!(leftover.join("data").join("b.bin").exists());
    holder.unlock()?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn locked_file_with_abort_policy_rolls_back() -> Result<()> {
    use fs2::FileExt;

    let env = setup()?;
    let before = tree(&env.source)?;
    let locked = env.source.join("data").join("c.bin");
    let holder = fs::File::open(&locked)?;
    holder.lock_exclusive()?;

    let options = MigrationOptions {
        locked_file_policy: LockedFilePolicy::Abort,
        ..Default::default()
    };
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    let result = run(&env.executor(options), plan)?;

    assert_eq!(result.abort, Some(AbortReason::FileLocked(locked)));
    assert!(tree(&target)?.is_empty());
    assert_eq!(tree(&env.source)?, before);
    holder.unlock()?;
    Ok(())
}

#[test]
fn registry_references_follow_the_move_and_come_back_on_undo() -> Result<()> {
    let env = setup()?;
    let plan = env.plan()?;
    let old = env.source.to_string_lossy().into_owned();
    let new = plan.target_path.to_string_lossy().into_owned();

    let key = RegistryKeyPath::new(
        Hive::HkeyCurrentUser,
        r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\App",
    );
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert(&key, "InstallLocation", RegistryValue::String(old.clone()));
    registry.insert(&key, "EstimatedSize", RegistryValue::DWord(60));
    let updater = Arc::new(RegistryUpdater::new(registry.clone(), &env.base));

    let executor = env
        .executor(MigrationOptions::default())
        .with_registry(updater.clone());
    let result = run(&executor, plan)?;

    let update = result.registry.expect("registry phase ran");
    assert_eq!(update.updated_count(), 1);
    assert_eq!(
        registry.get(&key, "InstallLocation"),
        Some(RegistryValue::String(new))
    );
    assert_eq!(
        updater.generate_report(result.operation_id.as_str())?.result.updated_count(),
        1
    );

    let report = executor.rollback_operation(&result.operation_id)?;
    assert!(report.registry_restored);
    assert_eq!(
        registry.get(&key, "InstallLocation"),
        Some(RegistryValue::String(old))
    );
    Ok(())
}

#[test]
fn preview_reports_without_mutating() -> Result<()> {
    let env = setup()?;
    let plan = env.plan()?;
    fs::create_dir_all(&plan.target_path)?;
    fs::write(plan.target_path.join("a.txt"), b"x")?;
    let before = tree(&env.source)?;

    let preview = env.executor(MigrationOptions::default()).preview(&plan);

    assert!(preview.sufficient_space);
    assert_eq!(preview.file_count, 3);
    assert_eq!(preview.conflicts, vec![plan.target_path.join("a.txt")]);
    assert!(preview.locked_files.is_empty());
    assert_eq!(tree(&env.source)?, before);
    assert_eq!(tree(&plan.target_path)?.len(), 1);
    Ok(())
}

#[test]
fn spawned_migration_streams_progress() -> Result<()> {
    let env = setup()?;
    let executor = Arc::new(env.executor(MigrationOptions::default()));

    let handle = executor.spawn(env.plan()?)?;
    let progress = handle.progress().clone();
    let result = handle.wait()?;
    let events: Vec<ProgressEvent> = progress.try_iter().collect();

    assert!(result.success);
    let phases: Vec<MigrationPhase> = events.iter().map(|e| e.phase).collect();
    assert!(phases.contains(&MigrationPhase::CopyingFiles));
    assert!(phases.contains(&MigrationPhase::CreatingRedirect));
    let copied = events
        .iter()
        .filter(|e| e.phase == MigrationPhase::CopyingFiles)
        .map(|e| e.bytes_transferred)
        .max();
    assert_eq!(copied, Some(60));
    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
    Ok(())
}

fn seed_target(target: &Path, files: &[&str]) -> Result<()> {
    for rel in files {
        let path = target.join(rel);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, b"already here")?;
    }
    Ok(())
}

#[test]
fn all_skipped_run_succeeds_without_redirect() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    seed_target(&plan.target_path, &["a.txt", "data/b.bin", "data/c.bin"])?;

    let options = MigrationOptions {
        conflict_policy: ConflictPolicy::Skip,
        ..Default::default()
    };
    let result = run(&env.executor(options), plan)?;

    assert!(result.success);
    assert!(result.migrated_files.is_empty());
    assert!(result.failed_files.is_empty());
    assert_eq!(result.skipped_files.len(), 3);
    assert!(result.skipped_files[0].reason.contains("already exists"));
    assert!(result.redirect.is_none());
    assert!(result.leftover_dir.is_none());
    assert!(RedirectManager::new().inspect(&env.source).is_none());
    assert_eq!(tree(&env.source)?, before);

    let record = env.log.get_operation(&result.operation_id)?.unwrap();
    assert_eq!(record.status(), OperationStatus::Succeeded);
    Ok(())
}

#[test]
fn lost_final_snapshot_still_completes_the_operation() -> Result<()> {
    let env = setup()?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    let state_dir = env.base.join(relocator_core::migration::STATE_DIR);

    // Empty registry so the run has a last phase before completion.
    let updater = Arc::new(RegistryUpdater::new(
        Arc::new(MemoryRegistry::new()),
        &env.base,
    ));
    let executor = env
        .executor(MigrationOptions::default())
        .with_registry(updater);

    let result = executor.execute(
        plan,
        &CancellationToken::new(),
        &mut |event: &ProgressEvent| {
            if event.phase == MigrationPhase::UpdatingRegistry {
                // A plain file where the snapshot directory should be
                fs::remove_dir_all(&state_dir).unwrap();
                fs::write(&state_dir, b"not a directory").unwrap();
            }
        },
    )?;

    assert!(result.success);
    assert_eq!(result.migrated_files.len(), 3);
    assert_redirect(&env.source, &target);

    let record = env.log.get_operation(&result.operation_id)?.unwrap();
    assert_eq!(record.status(), OperationStatus::Succeeded);
    assert!(record.ended_at.is_some());

    // The in-memory record still supports an undo.
    let report = executor.rollback_operation(&result.operation_id)?;
    assert!(report.is_complete());
    Ok(())
}

#[cfg(unix)]
#[test]
fn redirect_failure_rolls_back_every_phase() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();

    // Junctions do not exist on this platform.
    let options = MigrationOptions {
        redirect: RedirectPreference::Junction,
        ..Default::default()
    };
    let result = run(&env.executor(options), plan)?;

    assert!(!result.success);
    assert!(matches!(result.abort, Some(AbortReason::RedirectFailed(_))));
    assert_eq!(result.phase, MigrationPhase::RolledBack);
    assert!(result.rolled_back.expect("rollback report").is_complete());
    assert_eq!(tree(&env.source)?, before);
    assert!(!target.exists());
    assert!(RedirectManager::new().inspect(&env.source).is_none());

    let record = env.log.get_operation(&result.operation_id)?.unwrap();
    assert_eq!(record.status(), OperationStatus::Failed);
    Ok(())
}

#[test]
fn overwrite_policy_replaces_target_and_undo_removes_it() -> Result<()> {
    let env = setup()?;
    let before = tree(&env.source)?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    seed_target(&target, &["a.txt"])?;

    let options = MigrationOptions {
        conflict_policy: ConflictPolicy::Overwrite,
        ..Default::default()
    };
    let executor = env.executor(options);
    let result = run(&executor, plan)?;

    assert!(result.success);
    assert!(result.skipped_files.is_empty());
    assert_eq!(fs::read(target.join("a.txt"))?, vec![b'a'; 10]);
    assert!(!target.join("a_1.txt").exists());

    let report = executor.rollback_operation(&result.operation_id)?;
    assert!(report.is_complete());
    assert_eq!(tree(&env.source)?, before);
    assert!(!target.join("a.txt").exists());
    Ok(())
}

#[test]
fn deferred_conflict_decision_skips_the_file() -> Result<()> {
    let env = setup()?;
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    seed_target(&target, &["a.txt"])?;

    let options = MigrationOptions {
        conflict_policy: ConflictPolicy::AskDeferredToSkip,
        ..Default::default()
    };
    let result = run(&env.executor(options), plan)?;

    assert!(result.success);
    assert_eq!(result.migrated_files.len(), 2);
    assert_eq!(result.skipped_files.len(), 1);
    assert_eq!(result.skipped_files[0].path, env.source.join("a.txt"));
    assert!(result.skipped_files[0].reason.contains("deferred"));
    assert_eq!(fs::read(target.join("a.txt"))?, b"already here");

    let leftover = result.leftover_dir.expect("skipped file parked");
    assert_eq!(fs::read(leftover.join("a.txt"))?, vec![b'a'; 10]);
    assert_redirect(&env.source, &target);
    Ok(())
}

#[cfg(unix)]
#[test]
fn deferred_locked_file_decision_skips_the_file() -> Result<()> {
    use fs2::FileExt;

    let env = setup()?;
    let locked = env.source.join("a.txt");
    let holder = fs::File::open(&locked)?;
    holder.lock_exclusive()?;

    let options = MigrationOptions {
        locked_file_policy: LockedFilePolicy::AskDeferredToSkip,
        ..Default::default()
    };
    let plan = env.plan()?;
    let target = plan.target_path.clone();
    let result = run(&env.executor(options), plan)?;

    assert!(result.success);
    assert!(result.abort.is_none());
    assert_eq!(result.skipped_files.len(), 1);
    assert_eq!(result.skipped_files[0].path, locked);
    assert!(result.skipped_files[0].reason.contains("locked"));
    assert_eq!(result.migrated_files.len(), 2);
    assert_redirect(&env.source, &target);
    holder.unlock()?;
    Ok(())
}
