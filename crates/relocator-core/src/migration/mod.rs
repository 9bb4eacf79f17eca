//! Migration Executor
//!
//! Drives a [`MigrationPlan`](crate::planner::MigrationPlan) through
//! copy, verify, delete, redirect and registry phases, rolling back from the
//! transaction record when a run cannot complete.

mod executor;
pub mod lock;
mod policy;
mod progress;
mod rollback;
mod state;

pub use executor::{
    AbortReason, FileIssue, MigratedFile, MigrationExecutor, MigrationHandle, MigrationResult,
    PlanPreview,
};
pub use policy::{ConflictPolicy, LockedFilePolicy, MigrationOptions, RedirectPreference};
pub use progress::{CancellationToken, MigrationPhase, ProgressEvent};
pub use rollback::{RollbackReport, StepOutcome};
pub use state::{MigrationState, StateStore, STATE_DIR};
