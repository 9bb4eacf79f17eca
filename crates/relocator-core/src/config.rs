use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RelocatorError, Result};
use crate::migration::{ConflictPolicy, LockedFilePolicy, MigrationOptions, RedirectPreference};
use crate::oplog::DEFAULT_RETENTION_DAYS;

const CONFIG_FILE: &str = "config.toml";

/// Default config template with rich comments
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# relocator configuration file
# Location: ~/.relocator/config.toml

[migration]
# When a file already exists at the target: skip | overwrite | rename | ask
# "rename" writes name_1.ext, name_2.ext, ...; "ask" currently behaves as skip
conflict_policy = "rename"

# When a source file is held open by another process: skip | abort | ask
locked_file_policy = "skip"

# Compare SHA-256 of every source/target pair before deleting originals
verify_integrity = true

# Rewrite registry values that still point at the old location (Windows)
update_registry = true

# Redirect left at the old location: auto | junction | symlink
redirect = "auto"

[history]
# Days of operation history to keep
retention_days = 30

[naming]
# Target directory name. Placeholders: {name} {vendor} {version}
template = "{name}"
"#;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub naming: NamingConfig,
}

/// Migration defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    #[serde(default)]
    pub locked_file_policy: LockedFilePolicy,

    #[serde(default = "default_true")]
    pub verify_integrity: bool,

    #[serde(default = "default_true")]
    pub update_registry: bool,

    #[serde(default)]
    pub redirect: RedirectPreference,
}

impl Default for MigrationConfig {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Days to keep operation history and transaction snapshots
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_template")]
    pub template: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_template() -> String {
    "{name}".to_string()
}

impl Config {
    /// Load config from base directory
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content).map_err(|e| RelocatorError::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Save config to base directory
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let path = base_dir.join(CONFIG_FILE);
        fs::create_dir_all(base_dir)?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Get config file path
    pub fn path(base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_FILE)
    }

    /// Initialize config with default template (rich comments)
    pub fn init(base_dir: &Path) -> Result<PathBuf> {
        let path = base_dir.join(CONFIG_FILE);
        fs::create_dir_all(base_dir)?;

        if !path.exists() {
            fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        }

        Ok(path)
    }

    /// Get a config value by dot-notation key
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Set a config value by dot-notation key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = |message: String| RelocatorError::ConfigValue {
            key: key.to_string(),
            value: message,
        };
        match key {
            "migration.conflict_policy" => {
                self.migration.conflict_policy = ConflictPolicy::from_str(value).map_err(invalid)?;
            }
            "migration.locked_file_policy" => {
                self.migration.locked_file_policy =
                    LockedFilePolicy::from_str(value).map_err(invalid)?;
            }
            "migration.verify_integrity" => {
                self.migration.verify_integrity = parse_bool(value).map_err(invalid)?;
            }
            "migration.update_registry" => {
                self.migration.update_registry = parse_bool(value).map_err(invalid)?;
            }
            "migration.redirect" => {
                self.migration.redirect = RedirectPreference::from_str(value).map_err(invalid)?;
            }
            "history.retention_days" => {
                self.history.retention_days = value
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|days| *days > 0)
                    .ok_or_else(|| invalid(format!("'{}' is not a positive number of days", value)))?;
            }
            "naming.template" => {
                if value.trim().is_empty() {
                    return Err(invalid("template must not be empty".to_string()));
                }
                self.naming.template = value.to_string();
            }
            _ => {
                return Err(RelocatorError::ConfigKeyNotFound {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// List all config keys with their current values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "migration.conflict_policy".to_string(),
                self.migration.conflict_policy.to_string(),
            ),
            (
                "migration.locked_file_policy".to_string(),
                self.migration.locked_file_policy.to_string(),
            ),
            (
                "migration.verify_integrity".to_string(),
                self.migration.verify_integrity.to_string(),
            ),
            (
                "migration.update_registry".to_string(),
                self.migration.update_registry.to_string(),
            ),
            (
                "migration.redirect".to_string(),
                self.migration.redirect.to_string(),
            ),
            (
                "history.retention_days".to_string(),
                self.history.retention_days.to_string(),
            ),
            ("naming.template".to_string(), self.naming.template.clone()),
        ]
    }

    /// Execution options for a migration run
    pub fn to_migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            conflict_policy: self.migration.conflict_policy,
            locked_file_policy: self.migration.locked_file_policy,
            verify_integrity: self.migration.verify_integrity,
            update_registry: self.migration.update_registry,
            redirect: self.migration.redirect,
        }
    }
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("'{}' is not a boolean", other)),
    }
}
