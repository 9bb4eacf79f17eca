//! Migration Planner
//!
//! Turns a software entry, a target base directory and a naming rule into an
//! immutable [`MigrationPlan`]. Planning never touches the filesystem beyond
//! reading it.

use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{RelocatorError, Result};
use crate::redirect::{RedirectKind, RedirectManager};

/// Installed software, as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    pub install_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Reported size in bytes, if discovery knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl SoftwareEntry {
    pub fn new(name: impl Into<String>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            vendor: None,
            install_path: install_path.into(),
            version: None,
            size: None,
        }
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Turns a software entry into a target directory name
pub trait NameRenderer {
    fn render(&self, entry: &SoftwareEntry) -> String;
}

/// `{name}`, `{vendor}` and `{version}` placeholders; missing fields render empty.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template: String,
}

impl TemplateRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new("{name}")
    }
}

impl NameRenderer for TemplateRenderer {
    fn render(&self, entry: &SoftwareEntry) -> String {
        let rendered = self
            .template
            .replace("{name}", &entry.name)
            .replace("{vendor}", entry.vendor.as_deref().unwrap_or(""))
            .replace("{version}", entry.version.as_deref().unwrap_or(""));
        sanitize_dir_name(&rendered)
    }
}

/// Replace characters Windows forbids in file names and trim trailing dots.
pub fn sanitize_dir_name(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    replaced
        .trim()
        .trim_end_matches(['.', ' '])
        .to_string()
}

/// One file to move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMoveOperation {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Path relative to both roots
    pub relative_path: PathBuf,
    pub size: u64,
}

/// Immutable description of one relocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: String,
    pub software: SoftwareEntry,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub files: Vec<FileMoveOperation>,
    pub total_size: u64,
    /// Free bytes on the target volume; 0 when unknown
    pub available_space: u64,
    pub recommended_redirect: RedirectKind,
    pub created_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn has_sufficient_space(&self) -> bool {
        self.total_size <= self.available_space
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationPlanner {
    redirects: RedirectManager,
}

impl MigrationPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_plan(
        &self,
        entry: &SoftwareEntry,
        target_base: &Path,
        renderer: &dyn NameRenderer,
    ) -> Result<MigrationPlan> {
        if entry.install_path.as_os_str().is_empty() {
            return Err(RelocatorError::InvalidArgument(
                "install path must not be empty".into(),
            ));
        }
        if target_base.as_os_str().is_empty() {
            return Err(RelocatorError::InvalidArgument(
                "target base path must not be empty".into(),
            ));
        }

        let source_path = absolute(&entry.install_path)?;
        if !source_path.is_dir() {
            return Err(RelocatorError::InvalidArgument(format!(
                "install path is not a directory: {}",
                source_path.display()
            )));
        }

        let target_base = absolute(target_base)?;
        if resolve_existing(&target_base).starts_with(resolve_existing(&source_path)) {
            return Err(RelocatorError::InvalidArgument(format!(
                "target {} lies inside the installation being moved",
                target_base.display()
            )));
        }

        let name = renderer.render(entry);
        if name.is_empty() || name == "." || name == ".." {
            return Err(RelocatorError::InvalidArgument(format!(
                "naming rule produced an unusable directory name for '{}'",
                entry.name
            )));
        }
        let target_path = unique_target(&target_base, &name);

        let files = enumerate_files(&source_path, &target_path);
        let total_size = files.iter().map(|f| f.size).sum();
        let available_space = available_space(&target_base);

        let plan = MigrationPlan {
            id: format!("plan-{}", uuid::Uuid::new_v4().simple()),
            software: entry.clone(),
            recommended_redirect: self.redirects.preferred_kind(&source_path),
            source_path,
            target_path,
            files,
            total_size,
            available_space,
            created_at: Utc::now(),
        };
        debug!(
            plan = %plan.id,
            files = plan.files.len(),
            total_size = plan.total_size,
            available = plan.available_space,
            "plan created"
        );
        Ok(plan)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

// Canonical form of the deepest existing ancestor, with the rest re-appended.
fn resolve_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            return rest.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn unique_target(base: &Path, name: &str) -> PathBuf {
    let candidate = base.join(name);
    if fs::symlink_metadata(&candidate).is_err() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = base.join(format!("{}_{}", name, n));
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

// Unreadable entries are skipped.
fn enumerate_files(source: &Path, target: &Path) -> Vec<FileMoveOperation> {
    let mut files = Vec::new();
    for entry in WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            debug!(path = %entry.path().display(), "skipping unreadable file");
            continue;
        };
        files.push(FileMoveOperation {
            source: entry.path().to_path_buf(),
            target: target.join(relative),
            relative_path: relative.to_path_buf(),
            size: meta.len(),
        });
    }
    files
}

fn available_space(path: &Path) -> u64 {
    path.ancestors()
        .find(|p| p.exists())
        .and_then(|p| fs2::available_space(p).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install(temp: &TempDir) -> Result<SoftwareEntry> {
        let root = temp.path().join("App");
        fs::create_dir_all(root.join("bin"))?;
        fs::write(root.join("a.txt"), vec![0u8; 10])?;
        fs::write(root.join("bin").join("b.dll"), vec![0u8; 20])?;
        fs::write(root.join("bin").join("c.exe"), vec![0u8; 30])?;
        Ok(SoftwareEntry::new("App", root).with_vendor("Acme"))
    }

    #[test]
    fn plan_reroots_every_file() -> Result<()> {
        let temp = TempDir::new()?;
        let entry = install(&temp)?;
        let base = temp.path().join("Apps");

        let plan =
            MigrationPlanner::new().create_plan(&entry, &base, &TemplateRenderer::default())?;

        assert_eq!(plan.target_path, base.join("App"));
        assert_eq!(plan.file_count(), 3);
        assert_eq!(plan.total_size, 60);
        for file in &plan.files {
            assert!(file.target.starts_with(&plan.target_path));
            assert_eq!(file.target, plan.target_path.join(&file.relative_path));
        }
        assert!(plan.available_space > 0);
        assert!(plan.id.starts_with("plan-"));
        Ok(())
    }

    #[test]
    fn name_collision_appends_suffix() -> Result<()> {
        let temp = TempDir::new()?;
        let entry = install(&temp)?;
        let base = temp.path().join("Apps");
        fs::create_dir_all(base.join("App"))?;
        fs::create_dir_all(base.join("App_1"))?;

        let plan =
            MigrationPlanner::new().create_plan(&entry, &base, &TemplateRenderer::default())?;
        assert_eq!(plan.target_path, base.join("App_2"));
        Ok(())
    }

    #[test]
    fn template_placeholders_and_sanitizing() {
        let entry = SoftwareEntry::new("Tool: Pro", "/x")
            .with_vendor("Acme/Corp")
            .with_version("2.0");
        let renderer = TemplateRenderer::new("{vendor} {name} {version}");
        assert_eq!(renderer.render(&entry), "Acme_Corp Tool_ Pro 2.0");
        assert_eq!(sanitize_dir_name("name. . "), "name");
    }

    #[test]
    fn rejects_unusable_inputs() -> Result<()> {
        let temp = TempDir::new()?;
        let entry = install(&temp)?;
        let planner = MigrationPlanner::new();
        let renderer = TemplateRenderer::default();

        let missing = SoftwareEntry::new("Ghost", temp.path().join("ghost"));
        assert!(matches!(
            planner.create_plan(&missing, temp.path(), &renderer),
            Err(RelocatorError::InvalidArgument(_))
        ));

        let inside = entry.install_path.join("nested");
        assert!(matches!(
            planner.create_plan(&entry, &inside, &renderer),
            Err(RelocatorError::InvalidArgument(_))
        ));

        let dots = TemplateRenderer::new("..");
        assert!(matches!(
            planner.create_plan(&entry, &temp.path().join("Apps"), &dots),
            Err(RelocatorError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn planning_does_not_mutate() -> Result<()> {
        let temp = TempDir::new()?;
        let entry = install(&temp)?;
        let base = temp.path().join("Apps");

        MigrationPlanner::new().create_plan(&entry, &base, &TemplateRenderer::default())?;
        assert!(!base.exists());
        Ok(())
    }
}
