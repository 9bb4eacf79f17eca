use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use relocator_core::{ConflictPolicy, LockedFilePolicy, RedirectKind, RedirectPreference};

#[derive(Parser)]
#[command(name = "relocator")]
#[command(about = "Move installed software to another drive and leave a redirect behind")]
#[command(version)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Base directory (default: ~/.relocator)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Which installation to move and where
#[derive(clap::Args, Debug)]
pub struct PlanArgs {
    /// Installation directory to move
    pub source: PathBuf,

    /// Directory the installation is moved into
    #[arg(short, long)]
    pub target: PathBuf,

    /// Software name (default: source directory name)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Software vendor, available to the naming template as {vendor}
    #[arg(long)]
    pub vendor: Option<String>,

    /// Software version, available to the naming template as {version}
    #[arg(long = "app-version")]
    pub app_version: Option<String>,

    /// Naming template (default: naming.template from config)
    #[arg(long)]
    pub template: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show what a migration would do without changing anything
    Plan {
        #[command(flatten)]
        plan: PlanArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move an installation and leave a redirect at the old path
    Migrate {
        #[command(flatten)]
        plan: PlanArgs,

        /// What to do when a target file already exists (skip, overwrite, rename, ask)
        #[arg(long)]
        conflict: Option<ConflictPolicy>,

        /// What to do with files held by another process (skip, abort, ask)
        #[arg(long)]
        locked: Option<LockedFilePolicy>,

        /// Redirect kind (auto, junction, symlink)
        #[arg(long)]
        redirect: Option<RedirectPreference>,

        /// Skip SHA-256 verification of copies
        #[arg(long)]
        no_verify: bool,

        /// Leave registry references untouched
        #[arg(long)]
        no_registry: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Roll back a migration
    Undo {
        /// Operation id (op-...)
        operation_id: String,
    },

    /// Show recent operations
    History {
        /// Only operations from the last N days
        #[arg(long)]
        days: Option<u32>,

        /// Maximum entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one operation with its actions
    Show {
        /// Operation id (op-...)
        operation_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete history and transaction snapshots past the retention window
    Purge,

    /// Manage redirects directly
    Link {
        #[command(subcommand)]
        action: LinkAction,
    },

    /// Search, restore and report registry references
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum LinkAction {
    /// Create a redirect at LINK pointing to TARGET
    Create {
        link: PathBuf,
        target: PathBuf,

        /// junction or symlink (default: junction when the volume supports it)
        #[arg(short, long)]
        kind: Option<RedirectKind>,
    },

    /// Remove the redirect at LINK; its target is left alone
    Remove { link: PathBuf },

    /// Describe the redirect at PATH
    Inspect { path: PathBuf },
}

#[derive(Subcommand)]
pub enum RegistryAction {
    /// List registry values that mention PATH
    Find { path: String },

    /// Write a registry backup back
    Restore {
        /// Backup id (rb-...)
        backup_id: String,
    },

    /// Show the registry outcomes of a migration
    Report {
        /// Operation id (op-...)
        operation_id: String,
    },

    /// List registry backups
    Backups,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g., migration.conflict_policy)
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key (e.g., history.retention_days)
        key: String,
        /// Value to set
        value: String,
    },

    /// List all config values
    List,

    /// Show config file path
    Path,

    /// Write a commented default config file
    Init,
}
