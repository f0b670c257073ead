//! Resolved locations and options for one project.

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

pub const PROJECT_ENV: &str = "PKGREPO_PROJECT";
pub const REPOS_DIR_ENV: &str = "PKGREPO_REPOS_DIR";

pub const PACKAGES_DIR_NAME: &str = "Packages";
pub const MANIFEST_FILE_NAME: &str = "vpm-manifest.json";
pub const PROJECT_CONFIG_FILE_NAME: &str = "pkgrepo.json";

pub fn version() -> &'static str {
    env!("PKGREPO_VERSION")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub project_root: PathBuf,
    pub packages_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub repos_dir: PathBuf,
    pub include_prerelease: bool,
    pub user_agent: String,
}

impl Config {
    /// Standard layout below `project_root`.
    pub fn for_project(project_root: PathBuf, repos_dir: PathBuf) -> Self {
        let packages_dir = project_root.join(PACKAGES_DIR_NAME);
        let manifest_path = packages_dir.join(MANIFEST_FILE_NAME);
        Self {
            project_root,
            packages_dir,
            manifest_path,
            repos_dir,
            include_prerelease: false,
            user_agent: format!("pkgrepo/{}", version()),
        }
    }

    /// Resolve from explicit values, then environment variables, then the
    /// working directory and the per-user config directory.
    #[tracing::instrument(skip(runtime))]
    pub fn resolve<R: Runtime>(
        runtime: &R,
        project: Option<PathBuf>,
        repos_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let project_root = match project.or_else(|| runtime.env_var(PROJECT_ENV).ok().map(PathBuf::from)) {
            Some(root) => root,
            None => runtime.current_dir()?,
        };
        let repos_dir = match repos_dir.or_else(|| runtime.env_var(REPOS_DIR_ENV).ok().map(PathBuf::from)) {
            Some(dir) => dir,
            None => default_repos_dir(runtime)?,
        };

        debug!("Project {:?}, repositories in {:?}", project_root, repos_dir);
        Ok(Self::for_project(project_root, repos_dir))
    }

    pub fn with_prerelease(mut self, include_prerelease: bool) -> Self {
        self.include_prerelease = include_prerelease;
        self
    }

    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(PROJECT_CONFIG_FILE_NAME)
    }
}

/// `<config dir>/pkgrepo/Repos`, or `~/.pkgrepo/Repos` where there is no config dir.
pub fn default_repos_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    if let Some(config_dir) = runtime.config_dir() {
        return Ok(config_dir.join("pkgrepo").join("Repos"));
    }
    let home_dir = runtime
        .home_dir()
        .context("Could not find home directory")?;
    Ok(home_dir.join(".pkgrepo").join("Repos"))
}

/// Per-project rule declarations read from `pkgrepo.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Package ids that can never be removed
    #[serde(default)]
    pub protected: Vec<String>,
    /// Pairs of package ids that cannot be installed together
    #[serde(default)]
    pub exclusive: Vec<(String, String)>,
    /// Package id to the base package it needs installed first
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
}

impl ProjectConfig {
    /// Load the project file; a missing file yields the defaults.
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        if !runtime.exists(path) {
            return Ok(Self::default());
        }
        let content = runtime.read_to_string(path)?;
        serde_json::from_str(&content).with_context(|| format!("Invalid project config {:?}", path))
    }
}
