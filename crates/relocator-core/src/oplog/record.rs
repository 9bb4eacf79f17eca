use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn new() -> Self {
        let id = format!("op-{}", uuid::Uuid::new_v4().simple());
        Self(id)
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Migration,
    Rollback,
    RedirectCreate,
    RedirectRemove,
    RegistryUpdate,
    RegistryRestore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Rollback => "rollback",
            Self::RedirectCreate => "redirect_create",
            Self::RedirectRemove => "redirect_remove",
            Self::RegistryUpdate => "registry_update",
            Self::RegistryRestore => "registry_restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Migration,
            Self::Rollback,
            Self::RedirectCreate,
            Self::RedirectRemove,
            Self::RegistryUpdate,
            Self::RegistryRestore,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Primitive step inside an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PhaseChange,
    CopyFile,
    SkipFile,
    VerifyFailed,
    DeleteFile,
    MoveLeftovers,
    CreateRedirect,
    RemoveRedirect,
    BackupRegistry,
    UpdateRegistry,
    RestoreRegistry,
    RestoreFile,
    RemoveCopy,
}

impl ActionKind {
    const ALL: [ActionKind; 13] = [
        Self::PhaseChange,
        Self::CopyFile,
        Self::SkipFile,
        Self::VerifyFailed,
        Self::DeleteFile,
        Self::MoveLeftovers,
        Self::CreateRedirect,
        Self::RemoveRedirect,
        Self::BackupRegistry,
        Self::UpdateRegistry,
        Self::RestoreRegistry,
        Self::RestoreFile,
        Self::RemoveCopy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseChange => "phase_change",
            Self::CopyFile => "copy_file",
            Self::SkipFile => "skip_file",
            Self::VerifyFailed => "verify_failed",
            Self::DeleteFile => "delete_file",
            Self::MoveLeftovers => "move_leftovers",
            Self::CreateRedirect => "create_redirect",
            Self::RemoveRedirect => "remove_redirect",
            Self::BackupRegistry => "backup_registry",
            Self::UpdateRegistry => "update_registry",
            Self::RestoreRegistry => "restore_registry",
            Self::RestoreFile => "restore_file",
            Self::RemoveCopy => "remove_copy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step taken within an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAction {
    pub kind: ActionKind,
    /// Human-readable description
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// Value before the step, if meaningful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    /// Value after the step, if meaningful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Whether the step can be undone
    pub rollback_capable: bool,
}

impl OperationAction {
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            timestamp: Utc::now(),
            before: None,
            after: None,
            rollback_capable: false,
        }
    }

    pub fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before = Some(before.into());
        self
    }

    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }

    pub fn reversible(mut self) -> Self {
        self.rollback_capable = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A logged operation and its actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    pub description: String,
    pub started_at: DateTime<Utc>,
    /// Set once the operation completes
    pub ended_at: Option<DateTime<Utc>>,
    /// Outcome, set together with `ended_at`
    pub success: Option<bool>,
    pub actions: Vec<OperationAction>,
}

impl OperationRecord {
    pub fn status(&self) -> OperationStatus {
        match self.success {
            None => OperationStatus::Running,
            Some(true) => OperationStatus::Succeeded,
            Some(false) => OperationStatus::Failed,
        }
    }

    pub fn reversible_actions(&self) -> impl Iterator<Item = &OperationAction> {
        self.actions.iter().filter(|a| a.rollback_capable)
    }
}
