use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Duration, Local, Utc};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use relocator_core::config::Config;
use relocator_core::registry::system_store;
use relocator_core::{
    AbortReason, ActionKind, ConflictPolicy, LockedFilePolicy, MemoryRegistry, MigrationExecutor,
    MigrationOptions, MigrationPhase, MigrationPlan, MigrationPlanner, MigrationResult,
    OperationAction, OperationId, OperationKind, OperationLog, OperationRecord, OperationStatus,
    RedirectManager, RedirectPreference, RegistryUpdater, RelocatorError, Result,
    RollbackReport, SoftwareEntry, TemplateRenderer,
};

mod args;
use args::{Cli, Commands, ConfigAction, LinkAction, PlanArgs, RegistryAction, Shell};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let base_dir = resolve_base_dir(cli.base_dir);
    debug!(base = %base_dir.display(), "base directory");

    let result = match cli.command {
        Some(command) => dispatch(command, &base_dir),
        None => {
            Cli::command().print_help().ok();
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn dispatch(command: Commands, base_dir: &Path) -> Result<ExitCode> {
    match command {
        Commands::Plan { plan, json } => handle_plan(base_dir, &plan, json)?,
        Commands::Migrate {
            plan,
            conflict,
            locked,
            redirect,
            no_verify,
            no_registry,
            json,
        } => {
            let overrides = Overrides {
                conflict,
                locked,
                redirect,
                no_verify,
                no_registry,
            };
            return handle_migrate(base_dir, &plan, overrides, json);
        }
        Commands::Undo { operation_id } => return handle_undo(base_dir, &operation_id),
        Commands::History { days, limit, json } => handle_history(base_dir, days, limit, json)?,
        Commands::Show { operation_id, json } => handle_show(base_dir, &operation_id, json)?,
        Commands::Purge => handle_purge(base_dir)?,
        Commands::Link { action } => handle_link(action, base_dir)?,
        Commands::Registry { action } => handle_registry(action, base_dir)?,
        Commands::Config { action } => handle_config(action, base_dir)?,
        Commands::Completions { shell } => handle_completions(shell),
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_env("RELOCATOR_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let shell = match shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::PowerShell => clap_complete::Shell::PowerShell,
        Shell::Elvish => clap_complete::Shell::Elvish,
    };
    generate(shell, &mut cmd, "relocator", &mut io::stdout());
}

fn resolve_base_dir(cli_base: Option<PathBuf>) -> PathBuf {
    if let Some(base) = cli_base {
        return base;
    }

    if let Ok(base) = std::env::var("RELOCATOR_BASE") {
        return PathBuf::from(base);
    }

    dirs::home_dir()
        .map(|h| h.join(".relocator"))
        .unwrap_or_else(|| PathBuf::from(".relocator"))
}

// =============================================================================
// Shared setup
// =============================================================================

struct Overrides {
    conflict: Option<ConflictPolicy>,
    locked: Option<LockedFilePolicy>,
    redirect: Option<RedirectPreference>,
    no_verify: bool,
    no_registry: bool,
}

impl Overrides {
    fn apply(self, options: &mut MigrationOptions) {
        if let Some(policy) = self.conflict {
            options.conflict_policy = policy;
        }
        if let Some(policy) = self.locked {
            options.locked_file_policy = policy;
        }
        if let Some(redirect) = self.redirect {
            options.redirect = redirect;
        }
        if self.no_verify {
            options.verify_integrity = false;
        }
        if self.no_registry {
            options.update_registry = false;
        }
    }
}

fn open_log(base_dir: &Path, config: &Config) -> Result<Arc<OperationLog>> {
    Ok(Arc::new(OperationLog::open_with_retention(
        base_dir,
        config.history.retention_days,
    )?))
}

fn build_executor(
    base_dir: &Path,
    config: &Config,
    options: MigrationOptions,
) -> Result<MigrationExecutor> {
    let executor = MigrationExecutor::new(open_log(base_dir, config)?, base_dir, options);
    Ok(match system_store() {
        Some(store) => executor.with_registry(Arc::new(RegistryUpdater::new(store, base_dir))),
        None => {
            debug!("no system registry; registry references are left alone");
            executor
        }
    })
}

/// Updater for reading backups and reports; falls back to an empty store off Windows.
fn offline_updater(base_dir: &Path) -> RegistryUpdater {
    let store = system_store().unwrap_or_else(|| Arc::new(MemoryRegistry::new()));
    RegistryUpdater::new(store, base_dir)
}

fn build_plan(config: &Config, args: &PlanArgs) -> Result<MigrationPlan> {
    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RelocatorError::InvalidArgument(format!(
                    "cannot derive a name from {}; pass --name",
                    args.source.display()
                ))
            })?,
    };

    let mut entry = SoftwareEntry::new(name, &args.source);
    if let Some(vendor) = &args.vendor {
        entry = entry.with_vendor(vendor.clone());
    }
    if let Some(version) = &args.app_version {
        entry = entry.with_version(version.clone());
    }

    let template = args
        .template
        .clone()
        .unwrap_or_else(|| config.naming.template.clone());
    MigrationPlanner::new().create_plan(&entry, &args.target, &TemplateRenderer::new(template))
}

// =============================================================================
// plan / migrate / undo
// =============================================================================

fn handle_plan(base_dir: &Path, args: &PlanArgs, json: bool) -> Result<()> {
    let config = Config::load(base_dir)?;
    let plan = build_plan(&config, args)?;
    let executor = build_executor(base_dir, &config, config.to_migration_options())?;
    let preview = executor.preview(&plan);

    if json {
        let value = serde_json::json!({ "plan": plan, "preview": preview });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "Plan:".bold(), plan.id.cyan());
    println!("  Software:  {}", plan.software.name);
    println!("  From:      {}", plan.source_path.display());
    println!("  To:        {}", plan.target_path.display());
    println!(
        "  Files:     {} ({})",
        plan.file_count(),
        format_size(plan.total_size)
    );
    let space = format!(
        "{} available",
        format_size(plan.available_space)
    );
    if preview.sufficient_space {
        println!("  Space:     {}", space.green());
    } else {
        println!("  Space:     {}", space.red());
    }
    let redirect = format!("{}", preview.redirect_kind);
    if preview.redirect_supported {
        println!("  Redirect:  {}", redirect);
    } else {
        println!("  Redirect:  {} {}", redirect, "(not available)".red());
    }

    if !preview.conflicts.is_empty() {
        println!();
        println!(
            "{} {} existing target file(s), policy: {}",
            "Conflicts:".yellow(),
            preview.conflicts.len(),
            preview.conflict_policy
        );
        for path in &preview.conflicts {
            println!("  {}", path.display());
        }
    }
    if !preview.locked_files.is_empty() {
        println!();
        println!(
            "{} {} file(s), policy: {}",
            "Locked:".yellow(),
            preview.locked_files.len(),
            preview.locked_file_policy
        );
        for path in &preview.locked_files {
            println!("  {}", path.display());
        }
    }
    if let Some(count) = preview.registry_references {
        println!();
        println!("Registry values to update: {}", count);
    }
    println!();
    Ok(())
}

fn handle_migrate(
    base_dir: &Path,
    args: &PlanArgs,
    overrides: Overrides,
    json: bool,
) -> Result<ExitCode> {
    let config = Config::load(base_dir)?;
    let mut options = config.to_migration_options();
    overrides.apply(&mut options);

    let plan = build_plan(&config, args)?;
    if !plan.has_sufficient_space() {
        return Err(RelocatorError::InsufficientSpace {
            required: plan.total_size,
            available: plan.available_space,
        });
    }

    if !json {
        println!();
        println!(
            "Moving {} -> {} ({} files, {})",
            plan.source_path.display(),
            plan.target_path.display(),
            plan.file_count(),
            format_size(plan.total_size)
        );
    }

    let executor = Arc::new(build_executor(base_dir, &config, options)?);
    let handle = executor.spawn(plan)?;

    let mut last_phase = MigrationPhase::Planned;
    for event in handle.progress().iter() {
        if json {
            continue;
        }
        if event.phase != last_phase {
            if last_phase != MigrationPhase::Planned {
                eprintln!();
            }
            last_phase = event.phase;
        }
        eprint!(
            "\r  [{:>3.0}%] {:<22} {}/{}",
            event.percent,
            event.phase.as_str(),
            event.files_done,
            event.file_count
        );
        io::stderr().flush().ok();
    }
    if !json {
        eprintln!();
    }

    let result = handle.wait()?;
    if let Some(error) = &result.registry_error {
        warn!(operation = %result.operation_id, error = %error, "registry phase failed");
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_migration(&result);
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_migration(result: &MigrationResult) {
    println!();
    if result.success {
        println!("{} {}", "Migrated:".green().bold(), result.operation_id);
    } else {
        println!("{} {}", "Not completed:".red().bold(), result.operation_id);
    }
    println!("  Files moved:   {}", result.migrated_files.len());

    if !result.skipped_files.is_empty() {
        println!("  {}", format!("Skipped: {}", result.skipped_files.len()).yellow());
        for issue in &result.skipped_files {
            println!("    {} ({})", issue.path.display(), issue.reason);
        }
    }
    if !result.failed_files.is_empty() {
        println!("  {}", format!("Failed: {}", result.failed_files.len()).red());
        for issue in &result.failed_files {
            println!("    {} ({})", issue.path.display(), issue.reason);
        }
    }
    if let Some(redirect) = &result.redirect {
        println!(
            "  Redirect:      {} -> {} ({})",
            redirect.link_path.display(),
            redirect.target_path.display(),
            redirect.kind
        );
    }
    if let Some(leftover) = &result.leftover_dir {
        println!("  Left behind:   {}", leftover.display());
    }
    if let Some(registry) = &result.registry {
        println!(
            "  Registry:      {} updated, {} failed (backup {})",
            registry.updated_count(),
            registry.failed_count(),
            registry.backup_id
        );
    }
    if let Some(error) = &result.registry_error {
        println!("  {} {}", "Registry:".yellow(), error);
    }

    if let Some(reason) = &result.abort {
        println!();
        if matches!(reason, AbortReason::Cancelled) {
            println!("{}", "Cancelled; changes were rolled back.".yellow());
        } else {
            println!("{} {}", "Aborted:".red(), reason);
        }
        if let Some(report) = &result.rolled_back {
            print_rollback(report);
        }
    } else if !result.success && !result.migrated_files.is_empty() {
        println!();
        println!("Originals were kept. Remove the copies with:");
        println!("  relocator undo {}", result.operation_id);
    } else if result.success && result.redirect.is_none() {
        println!();
        println!("Nothing was moved; no redirect created.");
    } else if result.success {
        println!();
        println!("Undo with: relocator undo {}", result.operation_id);
    }
}

fn handle_undo(base_dir: &Path, operation_id: &str) -> Result<ExitCode> {
    let config = Config::load(base_dir)?;
    let executor = build_executor(base_dir, &config, config.to_migration_options())?;
    let report = executor.rollback_operation(&OperationId::from_string(operation_id))?;

    println!();
    print_rollback(&report);
    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_rollback(report: &RollbackReport) {
    if report.is_complete() {
        println!("{} {}", "Rolled back:".green().bold(), report.operation_id);
    } else {
        println!("{} {}", "Rollback incomplete:".red().bold(), report.operation_id);
    }
    println!("  Restored files:   {}", report.restored.len());
    println!("  Removed copies:   {}", report.removed_copies);
    if report.redirect_removed {
        println!("  Redirect removed");
    }
    if report.leftovers_returned {
        println!("  Leftover files returned");
    }
    if report.registry_restored {
        println!("  Registry restored");
    }
    for path in &report.missing {
        println!("  {} {}", "Missing:".red(), path.display());
    }
    for warning in &report.warnings {
        println!("  {} {}", "Warning:".yellow(), warning);
    }
    if let Some(reason) = &report.aborted {
        println!("  {} {}", "Stopped:".red(), reason);
    }
}

// =============================================================================
// history / show / purge
// =============================================================================

fn handle_history(base_dir: &Path, days: Option<u32>, limit: usize, json: bool) -> Result<()> {
    let config = Config::load(base_dir)?;
    let log = open_log(base_dir, &config)?;
    let since = days.map(|d| Utc::now() - Duration::days(i64::from(d)));
    let records = log.get_history(since, Some(limit))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No operations recorded.");
        return Ok(());
    }

    println!();
    for record in &records {
        println!(
            "  {}  {}  {:<16} {:<10} {}",
            record.id.as_str().cyan(),
            record
                .started_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M"),
            record.kind.as_str(),
            status_label(record.status()),
            record.description
        );
    }
    println!();
    Ok(())
}

fn status_label(status: OperationStatus) -> colored::ColoredString {
    match status {
        OperationStatus::Running => status.as_str().yellow(),
        OperationStatus::Succeeded => status.as_str().green(),
        OperationStatus::Failed => status.as_str().red(),
    }
}

fn handle_show(base_dir: &Path, operation_id: &str, json: bool) -> Result<()> {
    let config = Config::load(base_dir)?;
    let log = open_log(base_dir, &config)?;
    let record = log
        .get_operation(&OperationId::from_string(operation_id))?
        .ok_or_else(|| RelocatorError::OperationNotFound {
            id: operation_id.to_string(),
        })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    print_record(&record);
    Ok(())
}

fn print_record(record: &OperationRecord) {
    println!();
    println!("{} {}", record.id.as_str().cyan().bold(), status_label(record.status()));
    println!("  Kind:     {}", record.kind);
    println!("  About:    {}", record.description);
    println!(
        "  Started:  {}",
        record.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(ended) = record.ended_at {
        println!(
            "  Ended:    {}",
            ended.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }

    if record.actions.is_empty() {
        println!();
        return;
    }
    println!();
    println!("Actions:");
    for action in &record.actions {
        let marker = if action.rollback_capable { "*" } else { " " };
        println!(
            "  {} {}  {:<16} {}",
            marker,
            action.timestamp.with_timezone(&Local).format("%H:%M:%S%.3f"),
            action.kind.as_str(),
            action.description
        );
        match (&action.before, &action.after) {
            (Some(before), Some(after)) => println!("      {} -> {}", before, after),
            (Some(before), None) => println!("      {}", before),
            (None, Some(after)) => println!("      -> {}", after),
            (None, None) => {}
        }
    }
    println!();
    println!("  * reversible");
    println!();
}

fn handle_purge(base_dir: &Path) -> Result<()> {
    let config = Config::load(base_dir)?;
    let executor = build_executor(base_dir, &config, config.to_migration_options())?;
    let operations = executor.log().purge_expired()?;
    let states = executor.purge_expired_states()?;
    println!(
        "{} {} operation(s), {} snapshot(s) older than {} days",
        "Purged:".green(),
        operations,
        states,
        config.history.retention_days
    );
    Ok(())
}

// =============================================================================
// link
// =============================================================================

fn handle_link(action: LinkAction, base_dir: &Path) -> Result<()> {
    let redirects = RedirectManager::new();

    match action {
        LinkAction::Create { link, target, kind } => {
            let config = Config::load(base_dir)?;
            let log = open_log(base_dir, &config)?;
            let kind = kind.unwrap_or_else(|| redirects.preferred_kind(&link));
            let id = log.begin_operation(
                OperationKind::RedirectCreate,
                format!("Create {} {} -> {}", kind, link.display(), target.display()),
            )?;

            match redirects.create(kind, &link, &target) {
                Ok(info) => {
                    log.log_action(
                        &id,
                        OperationAction::new(ActionKind::CreateRedirect, format!("created {}", kind))
                            .with_before(info.link_path.display().to_string())
                            .with_after(info.target_path.display().to_string())
                            .reversible(),
                    )?;
                    log.complete_operation(&id, true)?;
                    println!(
                        "{} {} -> {} ({})",
                        "Created:".green(),
                        info.link_path.display(),
                        info.target_path.display(),
                        info.kind
                    );
                }
                Err(source) => {
                    log.complete_operation(&id, false)?;
                    return Err(RelocatorError::RedirectCreationFailed { path: link, source });
                }
            }
        }
        LinkAction::Remove { link } => {
            let config = Config::load(base_dir)?;
            let log = open_log(base_dir, &config)?;
            let info = redirects.inspect(&link);
            let id = log.begin_operation(
                OperationKind::RedirectRemove,
                format!("Remove redirect {}", link.display()),
            )?;

            let removed = match redirects.try_remove_link(&link) {
                Ok(removed) => removed,
                Err(e) => {
                    log.complete_operation(&id, false)?;
                    return Err(e.into());
                }
            };
            if removed {
                let mut action = OperationAction::new(ActionKind::RemoveRedirect, "removed redirect")
                    .with_before(link.display().to_string());
                if let Some(info) = info {
                    action = action.with_after(info.target_path.display().to_string());
                }
                log.log_action(&id, action)?;
                println!("{} {}", "Removed:".green(), link.display());
            } else {
                println!("{} is not a redirect; nothing removed.", link.display());
            }
            log.complete_operation(&id, removed)?;
        }
        LinkAction::Inspect { path } => match redirects.inspect(&path) {
            Some(info) => {
                println!("Link:    {}", info.link_path.display());
                println!("Target:  {}", info.target_path.display());
                println!("Kind:    {}", info.kind);
                if info.target_exists {
                    println!("Status:  {}", "ok".green());
                } else {
                    println!("Status:  {}", "target missing".red());
                }
            }
            None => println!("{} is not a redirect.", path.display()),
        },
    }

    Ok(())
}

// =============================================================================
// registry
// =============================================================================

fn handle_registry(action: RegistryAction, base_dir: &Path) -> Result<()> {
    match action {
        RegistryAction::Find { path } => {
            let store = system_store().ok_or(RelocatorError::RegistryUnavailable)?;
            let updater = RegistryUpdater::new(store, base_dir);
            let references = updater.find_references(&path);
            if references.is_empty() {
                println!("No registry values mention {}.", path);
                return Ok(());
            }
            println!();
            for reference in &references {
                let name = if reference.value_name.is_empty() {
                    "(Default)"
                } else {
                    reference.value_name.as_str()
                };
                println!("  {}", reference.key.to_string().cyan());
                println!("    {} = {}", name, reference.value.display());
            }
            println!();
            println!("{} value(s)", references.len());
        }
        RegistryAction::Restore { backup_id } => {
            let store = system_store().ok_or(RelocatorError::RegistryUnavailable)?;
            let updater = RegistryUpdater::new(store, base_dir);
            let config = Config::load(base_dir)?;
            let log = open_log(base_dir, &config)?;
            let id = log.begin_operation(
                OperationKind::RegistryRestore,
                format!("Restore registry backup {}", backup_id),
            )?;

            let summary = match updater.restore_backup(&backup_id) {
                Ok(summary) => summary,
                Err(e) => {
                    log.complete_operation(&id, false)?;
                    return Err(e);
                }
            };
            log.log_action(
                &id,
                OperationAction::new(
                    ActionKind::RestoreRegistry,
                    format!("{} restored, {} failed", summary.restored, summary.failed.len()),
                )
                .with_before(backup_id.clone()),
            )?;
            log.complete_operation(&id, summary.failed.is_empty())?;

            println!("{} {} value(s)", "Restored:".green(), summary.restored);
            for name in &summary.failed {
                println!("  {} {}", "Failed:".red(), name);
            }
        }
        RegistryAction::Report { operation_id } => {
            let report = offline_updater(base_dir).generate_report(&operation_id)?;
            println!();
            println!("{} {}", "Registry report:".bold(), report.operation_id.cyan());
            println!("  {} -> {}", report.old_path, report.new_path);
            println!("  Backup: {}", report.result.backup_id);
            println!();
            for outcome in &report.result.outcomes {
                let status = if outcome.success {
                    "ok".green()
                } else {
                    "failed".red()
                };
                println!("  [{}] {}\\{}", status, outcome.key, outcome.value_name);
                if let Some(error) = &outcome.error {
                    println!("       {}", error);
                }
            }
            println!();
        }
        RegistryAction::Backups => {
            let updater = offline_updater(base_dir);
            let ids = updater.backups().list()?;
            if ids.is_empty() {
                println!("No registry backups.");
                return Ok(());
            }
            for id in ids {
                println!("  {}", id);
            }
        }
    }
    Ok(())
}

// =============================================================================
// config
// =============================================================================

fn handle_config(action: ConfigAction, base_dir: &Path) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load(base_dir)?;
            match config.get(&key) {
                Some(value) => {
                    println!("{}", value);
                }
                None => {
                    return Err(RelocatorError::ConfigKeyNotFound { key });
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load(base_dir)?;
            config.set(&key, &value)?;
            config.save(base_dir)?;
            println!("{} {} = {}", "Set:".green(), key, value);
        }
        ConfigAction::List => {
            let config = Config::load(base_dir)?;
            println!();
            for (key, value) in config.list() {
                println!("{} = {}", key.cyan(), value);
            }
            println!();
        }
        ConfigAction::Path => {
            let path = Config::path(base_dir);
            println!("{}", path.display());
        }
        ConfigAction::Init => {
            let path = Config::init(base_dir)?;
            println!("{} {}", "Initialized:".green(), path.display());
        }
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
