pub mod config;
pub mod error;
pub mod hash;
pub mod migration;
pub mod oplog;
pub mod planner;
pub mod redirect;
pub mod registry;

pub use config::Config;
pub use error::{RelocatorError, Result};
pub use migration::{
    AbortReason, CancellationToken, ConflictPolicy, FileIssue, LockedFilePolicy, MigratedFile,
    MigrationExecutor, MigrationHandle, MigrationOptions, MigrationPhase, MigrationResult,
    MigrationState, PlanPreview, ProgressEvent, RedirectPreference, RollbackReport,
};
pub use oplog::{
    ActionKind, OperationAction, OperationId, OperationKind, OperationLog, OperationRecord,
    OperationStatus,
};
pub use planner::{
    FileMoveOperation, MigrationPlan, MigrationPlanner, NameRenderer, SoftwareEntry,
    TemplateRenderer,
};
pub use redirect::{RedirectError, RedirectInfo, RedirectKind, RedirectManager};

// Registry
pub use registry::{
    Hive, MemoryRegistry, RegistryKeyPath, RegistryReference, RegistryStore, RegistryUpdateReport,
    RegistryUpdateResult, RegistryUpdater, RegistryValue, RestoreSummary,
};
