use anyhow::{Context, Result};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::{Host, Url};

use super::{Repository, decode_repository};
use crate::error::PackageError;
use crate::http::HttpClient;
use crate::runtime::{Runtime, sanitize_file_name};

const DESCRIPTOR_PATTERN: &str = "*.json";

/// Local cache of repository descriptors, one JSON file per repository.
///
/// The in-memory list is ordered by priority: files in name order as loaded,
/// followed by repositories added during this run.
pub struct RepositoryStore<R: Runtime> {
    runtime: Arc<R>,
    http_client: HttpClient,
    directory: PathBuf,
    repositories: Vec<Repository>,
}

impl<R: Runtime> RepositoryStore<R> {
    pub fn new(runtime: Arc<R>, http_client: HttpClient, directory: PathBuf) -> Self {
        Self {
            runtime,
            http_client,
            directory,
            repositories: Vec::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// Parse descriptor bytes in any accepted shape.
    pub fn parse(bytes: &[u8]) -> Result<Repository, PackageError> {
        decode_repository(bytes)
    }

    /// Read every descriptor in the store directory.
    ///
    /// A file that cannot be read or parsed is deleted and skipped.
    #[tracing::instrument(skip(self))]
    pub fn load_all(&mut self) -> Result<&[Repository]> {
        self.repositories.clear();
        if !self.runtime.exists(&self.directory) {
            debug!("Repository directory {:?} does not exist yet", self.directory);
            return Ok(&self.repositories);
        }

        let pattern = glob::Pattern::new(DESCRIPTOR_PATTERN)?;
        let files = self
            .runtime
            .read_dir(&self.directory)
            .with_context(|| format!("Failed to list repositories in {:?}", self.directory))?;

        for path in files {
            let matches = path
                .file_name()
                .map(|name| pattern.matches(&name.to_string_lossy()))
                .unwrap_or(false);
            if !matches || self.runtime.is_dir(&path) {
                continue;
            }

            match self.load_file(&path) {
                Ok(repo) => self.repositories.push(repo),
                Err(e) => {
                    warn!("Removing corrupt repository file {:?}: {:#}", path, e);
                    if let Err(e) = self.runtime.remove_file(&path) {
                        warn!("Failed to remove {:?}: {}", path, e);
                    }
                }
            }
        }

        info!("Loaded {} repositories", self.repositories.len());
        Ok(&self.repositories)
    }

    fn load_file(&self, path: &Path) -> Result<Repository> {
        let bytes = self.runtime.read(path)?;
        let mut repo = Self::parse(&bytes)?;
        repo.local_path = Some(path.to_path_buf());
        Ok(repo)
    }

    /// Fetch and parse a descriptor without persisting it.
    ///
    /// A descriptor without a name is named after the URL's host.
    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<Repository> {
        let bytes = self.http_client.get_bytes(url).await?;
        let mut repo = Self::parse(&bytes)?;
        if repo.name.trim().is_empty() {
            repo.name = derive_name_from_url(url);
            debug!("Named repository from {} as {:?}", url, repo.name);
        }
        Ok(repo)
    }

    /// Fetch a descriptor and persist it to the store directory.
    pub async fn download_from_url(&self, url: &str) -> Result<Repository> {
        let mut repo = self.fetch(url).await?;
        self.persist(&mut repo)?;
        Ok(repo)
    }

    /// Write the parsed descriptor as pretty JSON, at its existing location or
    /// at `<directory>/<sanitized name>.json`.
    ///
    /// A new repository never takes over another repository's file: when the
    /// name is already in use a numbered file such as `<name>-2.json` is used.
    pub fn persist(&self, repo: &mut Repository) -> Result<()> {
        let path = repo
            .local_path
            .clone()
            .unwrap_or_else(|| self.free_path_for(&repo.name));
        let content = serde_json::to_string_pretty(repo)?;
        self.runtime
            .write_atomic(&path, content.as_bytes())
            .with_context(|| format!("Failed to save repository to {:?}", path))?;
        repo.local_path = Some(path);
        Ok(())
    }

    fn free_path_for(&self, name: &str) -> PathBuf {
        let stem = sanitize_file_name(name);
        let mut path = self.directory.join(format!("{}.json", stem));
        let mut suffix = 2;
        while self.is_path_taken(&path) {
            path = self.directory.join(format!("{}-{}.json", stem, suffix));
            suffix += 1;
        }
        path
    }

    fn is_path_taken(&self, path: &Path) -> bool {
        self.runtime.exists(path)
            || self
                .repositories
                .iter()
                .any(|r| r.local_path.as_deref() == Some(path))
    }

    pub fn contains(&self, repo: &Repository) -> bool {
        self.repositories.iter().any(|r| r.is_same_as(repo))
    }

    /// Add to the active set unless an equivalent repository is already present.
    pub fn insert(&mut self, repo: Repository) -> bool {
        if self.contains(&repo) {
            debug!("Discarding duplicate repository {:?}", repo.name);
            return false;
        }
        self.repositories.push(repo);
        true
    }

    /// Download a repository and add it if it is new.
    ///
    /// Returns `None` for a duplicate, which is never written to disk.
    #[tracing::instrument(skip(self))]
    pub async fn add_from_url(&mut self, url: &str) -> Result<Option<Repository>> {
        let mut repo = self.fetch(url).await?;
        if self.contains(&repo) {
            info!("Repository {} is already known", url);
            return Ok(None);
        }
        self.persist(&mut repo)?;
        self.repositories.push(repo.clone());
        Ok(Some(repo))
    }

    /// Remove a repository by name, deleting its cached descriptor.
    pub fn remove(&mut self, name: &str) -> Result<Option<Repository>> {
        let Some(index) = self.repositories.iter().position(|r| r.name == name) else {
            return Ok(None);
        };
        let repo = self.repositories.remove(index);
        if let Some(path) = &repo.local_path
            && self.runtime.exists(path)
        {
            self.runtime
                .remove_file(path)
                .with_context(|| format!("Failed to remove repository file {:?}", path))?;
        }
        Ok(Some(repo))
    }

    /// Re-download every URL-backed repository.
    ///
    /// A repository whose refresh fails keeps its cached copy; the others
    /// are still refreshed. Returns how many were refreshed.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_all(&mut self) -> usize {
        let this: &Self = self;
        let fetches = this
            .repositories
            .iter()
            .enumerate()
            .filter(|(_, repo)| repo.is_remote())
            .map(|(index, repo)| async move { (index, this.fetch(&repo.url).await) });
        let results = join_all(fetches).await;

        let mut refreshed = 0;
        for (index, result) in results {
            let cached = &self.repositories[index];
            match result {
                Ok(mut fresh) => {
                    fresh.local_path = cached.local_path.clone();
                    if let Err(e) = self.persist(&mut fresh) {
                        warn!("Failed to save refreshed {:?}: {:#}", fresh.name, e);
                    }
                    self.repositories[index] = fresh;
                    refreshed += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to refresh {:?} from {}, keeping cached copy: {:#}",
                        cached.name, cached.url, e
                    );
                }
            }
        }

        info!("Refreshed {} repositories", refreshed);
        refreshed
    }
}

/// Human readable repository name from a URL host.
///
/// `https://vpm.example.com/index.json` becomes `ExampleRepo`.
pub fn derive_name_from_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return "Repository".to_string();
    };
    let label = match parsed.host() {
        Some(Host::Domain(domain)) => {
            let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
            match labels.len() {
                0 => None,
                1 => Some(labels[0].to_string()),
                n => Some(labels[n - 2].to_string()),
            }
        }
        _ => None,
    };

    match label {
        Some(label) => {
            let mut chars = label.chars();
            match chars.next() {
                Some(first) => format!("{}{}Repo", first.to_uppercase(), chars.as_str()),
                None => "Repository".to_string(),
            }
        }
        None => "Repository".to_string(),
    }
}
