use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::redirect::{RedirectKind, RedirectManager};

/// What to do when a copy's target path already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    Skip,
    Overwrite,
    /// Write under `name_1.ext`, `name_2.ext`, ...
    #[default]
    Rename,
    /// No interactive prompt is available mid-run; behaves as `Skip`.
    #[serde(rename = "ask")]
    AskDeferredToSkip,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
            Self::Rename => "rename",
            Self::AskDeferredToSkip => "ask",
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            "rename" => Ok(Self::Rename),
            "ask" => Ok(Self::AskDeferredToSkip),
            other => Err(format!(
                "unknown conflict policy '{}' (expected skip, overwrite, rename or ask)",
                other
            )),
        }
    }
}

/// What to do when a source file is held exclusively by another process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockedFilePolicy {
    #[default]
    Skip,
    /// Stop the run and roll back
    Abort,
    /// Behaves as `Skip`.
    #[serde(rename = "ask")]
    AskDeferredToSkip,
}

impl LockedFilePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Abort => "abort",
            Self::AskDeferredToSkip => "ask",
        }
    }
}

impl std::fmt::Display for LockedFilePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockedFilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            "ask" => Ok(Self::AskDeferredToSkip),
            other => Err(format!(
                "unknown locked-file policy '{}' (expected skip, abort or ask)",
                other
            )),
        }
    }
}

/// Which redirect to install at the old location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectPreference {
    /// Junction where the volume supports it, otherwise a symbolic link
    #[default]
    Auto,
    Junction,
    #[serde(rename = "symlink")]
    SymbolicLink,
}

impl RedirectPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Junction => "junction",
            Self::SymbolicLink => "symlink",
        }
    }

    pub fn resolve(&self, manager: &RedirectManager, link_path: &Path) -> RedirectKind {
        match self {
            Self::Auto => manager.preferred_kind(link_path),
            Self::Junction => RedirectKind::Junction,
            Self::SymbolicLink => RedirectKind::SymbolicLink,
        }
    }
}

impl std::fmt::Display for RedirectPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RedirectPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "junction" => Ok(Self::Junction),
            "symlink" | "symbolic-link" => Ok(Self::SymbolicLink),
            other => Err(format!(
                "unknown redirect '{}' (expected auto, junction or symlink)",
                other
            )),
        }
    }
}

/// Per-run execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub conflict_policy: ConflictPolicy,
    pub locked_file_policy: LockedFilePolicy,
    /// Hash every source/target pair after copying
    pub verify_integrity: bool,
    /// Rewrite registry values that embed the old path
    pub update_registry: bool,
    pub redirect: RedirectPreference,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            locked_file_policy: LockedFilePolicy::default(),
            verify_integrity: true,
            update_registry: true,
            redirect: RedirectPreference::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_config_spellings() {
        assert_eq!("ask".parse::<ConflictPolicy>(), Ok(ConflictPolicy::AskDeferredToSkip));
        assert_eq!("Rename".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Rename));
        assert_eq!("abort".parse::<LockedFilePolicy>(), Ok(LockedFilePolicy::Abort));
        assert_eq!("symlink".parse::<RedirectPreference>(), Ok(RedirectPreference::SymbolicLink));
        assert!("sometimes".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn explicit_preference_ignores_volume() {
        let manager = RedirectManager::new();
        let here = Path::new(".");
        assert_eq!(
            RedirectPreference::Junction.resolve(&manager, here),
            RedirectKind::Junction
        );
        assert_eq!(
            RedirectPreference::SymbolicLink.resolve(&manager, here),
            RedirectKind::SymbolicLink
        );
    }

    #[test]
    fn defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.conflict_policy, ConflictPolicy::Rename);
        assert_eq!(options.locked_file_policy, LockedFilePolicy::Skip);
        assert!(options.verify_integrity);
        assert!(options.update_registry);
    }
}
