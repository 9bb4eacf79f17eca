use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Executor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Planned,
    CopyingFiles,
    VerifyingIntegrity,
    DeletingOriginals,
    CreatingRedirect,
    UpdatingRegistry,
    Completed,
    RollingBack,
    RolledBack,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::CopyingFiles => "copying_files",
            Self::VerifyingIntegrity => "verifying_integrity",
            Self::DeletingOriginals => "deleting_originals",
            Self::CreatingRedirect => "creating_redirect",
            Self::UpdatingRegistry => "updating_registry",
            Self::Completed => "completed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }

    /// Percentage band covered by this phase
    pub(crate) fn band(&self) -> (f64, f64) {
        match self {
            Self::Planned => (0.0, 0.0),
            Self::CopyingFiles => (0.0, 70.0),
            Self::VerifyingIntegrity => (70.0, 85.0),
            Self::DeletingOriginals => (85.0, 90.0),
            Self::CreatingRedirect => (90.0, 95.0),
            Self::UpdatingRegistry => (95.0, 100.0),
            Self::Completed => (100.0, 100.0),
            Self::RollingBack | Self::RolledBack => (0.0, 0.0),
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress notification emitted by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: MigrationPhase,
    /// Overall completion, 0-100
    pub percent: f64,
    pub current_file: Option<PathBuf>,
    /// Files finished in this phase
    pub files_done: usize,
    pub file_count: usize,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl ProgressEvent {
    pub(crate) fn phase(phase: MigrationPhase, file_count: usize, total_bytes: u64) -> Self {
        Self {
            phase,
            percent: phase.band().0,
            current_file: None,
            files_done: 0,
            file_count,
            bytes_transferred: 0,
            total_bytes,
        }
    }

    /// Place `fraction` (0..=1) of the current phase onto the overall scale.
    pub(crate) fn at(mut self, fraction: f64) -> Self {
        let (start, end) = self.phase.band();
        self.percent = start + (end - start) * fraction.clamp(0.0, 1.0);
        self
    }
}

/// Cooperative cancellation flag shared between caller and worker
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn percent_stays_inside_phase_band() {
        let event = ProgressEvent::phase(MigrationPhase::VerifyingIntegrity, 4, 100).at(0.5);
        assert!((event.percent - 77.5).abs() < f64::EPSILON);
        let clamped = ProgressEvent::phase(MigrationPhase::CopyingFiles, 4, 100).at(3.0);
        assert!((clamped.percent - 70.0).abs() < f64::EPSILON);
    }
}
