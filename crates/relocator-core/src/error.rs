use std::path::PathBuf;
use thiserror::Error;

use crate::redirect::RedirectError;

#[derive(Debug, Error)]
pub enum RelocatorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Insufficient space at target: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("File is locked by another process: {path}")]
    FileLocked { path: PathBuf },

    #[error("Target file already exists: {path}")]
    FileConflict { path: PathBuf },

    #[error("Integrity check failed for {path}")]
    IntegrityMismatch { path: PathBuf },

    #[error("Failed to create redirect at {path}: {source}")]
    RedirectCreationFailed {
        path: PathBuf,
        #[source]
        source: RedirectError,
    },

    #[error("Registry update failed for {key}: {message}")]
    RegistryUpdateFailed { key: String, message: String },

    #[error("Operation cancelled")]
    OperationCancelled,

    #[error("Transaction state for operation {operation_id} is no longer available")]
    StateUnavailable { operation_id: String },

    #[error("Operation not found: {id}")]
    OperationNotFound { id: String },

    #[error("Registry backup not found: {id}")]
    BackupNotFound { id: String },

    #[error("Registry access is not available on this platform")]
    RegistryUnavailable,

    #[error("Redirect error: {0}")]
    Redirect(#[from] RedirectError),

    #[error("Failed to parse config file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Unknown config key: {key}")]
    ConfigKeyNotFound { key: String },

    #[error("Invalid value for {key}: {value}")]
    ConfigValue { key: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, RelocatorError>;

impl RelocatorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 2,
            Self::InsufficientSpace { .. } => 3,
            Self::OperationNotFound { .. } | Self::BackupNotFound { .. } => 4,
            Self::StateUnavailable { .. } => 5,
            Self::RedirectCreationFailed { .. } | Self::Redirect(_) => 6,
            Self::OperationCancelled => 7,
            Self::ConfigParse { .. } | Self::ConfigKeyNotFound { .. } | Self::ConfigValue { .. } => {
                8
            }
            _ => 1,
        }
    }
}
