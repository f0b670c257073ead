//! The engine's explicit context object.
//!
//! [`PackageManager`] owns the repository store, the merged catalog, the
//! manifest store and the installer for one project. Presentation layers call
//! its operations and observe [`CatalogEvent`]s instead of reaching into any
//! shared global state.

use anyhow::Result;
use log::{debug, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogEntry, PackageCatalog};
use crate::cleanup::SharedCleanupContext;
use crate::config::{Config, ProjectConfig};
use crate::download::{Downloader, HttpDownloader};
use crate::error::PackageError;
use crate::http::{HttpClient, build_http_client};
use crate::install::{InstallOutcome, InstallProgressFn, Installer};
use crate::manifest::{Manifest, ManifestStore};
use crate::repository::{Repository, RepositoryStore};
use crate::rules::ConstraintRules;
use crate::runtime::Runtime;

const EVENT_CAPACITY: usize = 64;

/// Notifications emitted after an operation changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    RepositoriesRefreshed { count: usize },
    RepositoryAdded { name: String },
    RepositoryRemoved { name: String },
    PackageInstalled { id: String, version: String },
    PackageRemoved { id: String },
    ManifestReconciled { updated: usize },
}

/// An installed package with a newer published version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedPackage {
    pub id: String,
    pub installed: String,
    pub latest: String,
    pub repository: String,
}

pub struct PackageManager<R: Runtime + 'static> {
    runtime: Arc<R>,
    config: Config,
    repositories: Mutex<RepositoryStore<R>>,
    catalog: RwLock<Arc<PackageCatalog>>,
    manifest: Arc<ManifestStore<R>>,
    installer: Installer<R>,
    events: broadcast::Sender<CatalogEvent>,
}

impl<R: Runtime + 'static> PackageManager<R> {
    /// Build a manager for `config`, reading the project's rule declarations.
    #[tracing::instrument(skip(runtime, config, cleanup_ctx))]
    pub fn new(runtime: Arc<R>, config: Config, cleanup_ctx: SharedCleanupContext) -> Result<Self> {
        let http_client = build_http_client(&config.user_agent)?;
        let project = ProjectConfig::load(runtime.as_ref(), &config.project_config_path())?;
        let rules = ConstraintRules::from_project_config(&project).map_err(PackageError::from)?;
        let downloader = Arc::new(HttpDownloader::new(runtime.clone(), http_client.clone()));
        Ok(Self::with_parts(
            runtime,
            config,
            http_client,
            downloader,
            rules,
            cleanup_ctx,
        ))
    }

    pub fn with_parts(
        runtime: Arc<R>,
        config: Config,
        http_client: HttpClient,
        downloader: Arc<dyn Downloader>,
        rules: ConstraintRules,
        cleanup_ctx: SharedCleanupContext,
    ) -> Self {
        let repositories =
            RepositoryStore::new(runtime.clone(), http_client, config.repos_dir.clone());
        let manifest = Arc::new(ManifestStore::new(
            runtime.clone(),
            config.manifest_path.clone(),
        ));
        let installer = Installer::new(
            runtime.clone(),
            downloader,
            manifest.clone(),
            rules,
            config.packages_dir.clone(),
            cleanup_ctx,
        )
        .with_prerelease(config.include_prerelease);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            runtime,
            config,
            repositories: Mutex::new(repositories),
            catalog: RwLock::new(Arc::new(PackageCatalog::default())),
            manifest,
            installer,
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CatalogEvent) {
        debug!("Event: {:?}", event);
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Snapshot of the current catalog.
    pub fn catalog(&self) -> Arc<PackageCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn rebuild_catalog(&self, repositories: &[Repository]) {
        let catalog = PackageCatalog::from_repositories(repositories);
        debug!(
            "Catalog rebuilt from {} repositories: {} packages",
            repositories.len(),
            catalog.len()
        );
        *self.catalog.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(catalog);
    }

    /// Load every local repository descriptor and rebuild the catalog.
    pub async fn load(&self) -> Result<usize, PackageError> {
        let mut store = self.repositories.lock().await;
        let count = store.load_all().map_err(PackageError::classify)?.len();
        self.rebuild_catalog(store.repositories());
        Ok(count)
    }

    /// Re-fetch every URL-backed repository, returning how many were updated.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize, PackageError> {
        let mut store = self.repositories.lock().await;
        let count = store.refresh_all().await;
        self.rebuild_catalog(store.repositories());
        drop(store);

        self.emit(CatalogEvent::RepositoriesRefreshed { count });
        Ok(count)
    }

    pub async fn repositories(&self) -> Vec<Repository> {
        self.repositories.lock().await.repositories().to_vec()
    }

    /// Download, deduplicate and persist the repository at `url`.
    ///
    /// Returns `None` when an equivalent repository is already known.
    #[tracing::instrument(skip(self))]
    pub async fn add_repository(&self, url: &str) -> Result<Option<Repository>, PackageError> {
        let mut store = self.repositories.lock().await;
        let added = store
            .add_from_url(url)
            .await
            .map_err(PackageError::classify)?;
        if let Some(repo) = &added {
            self.rebuild_catalog(store.repositories());
            drop(store);
            self.emit(CatalogEvent::RepositoryAdded {
                name: repo.name.clone(),
            });
        }
        Ok(added)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_repository(&self, name: &str) -> Result<Repository, PackageError> {
        let mut store = self.repositories.lock().await;
        let removed = store
            .remove(name)
            .map_err(PackageError::classify)?
            .ok_or_else(|| PackageError::NotFound(format!("No repository named {:?}", name)))?;
        self.rebuild_catalog(store.repositories());
        drop(store);

        self.emit(CatalogEvent::RepositoryRemoved {
            name: removed.name.clone(),
        });
        Ok(removed)
    }

    /// Best published version of `id`.
    pub fn resolve(&self, id: &str, include_prerelease: bool) -> Result<CatalogEntry, PackageError> {
        self.catalog()
            .resolve(id, include_prerelease)
            .cloned()
            .ok_or_else(|| PackageError::NotFound(format!("No repository publishes {}", id)))
    }

    /// Install `id` at `version`, or at its best published version.
    pub async fn install(
        &self,
        id: &str,
        version: Option<&str>,
        include_prerelease: bool,
        on_progress: InstallProgressFn,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, PackageError> {
        let entry = match version {
            Some(version) => self
                .catalog()
                .find_version(id, version)
                .cloned()
                .ok_or_else(|| PackageError::NotFound(format!("{} {} is not published", id, version)))?,
            None => self.resolve(id, include_prerelease)?,
        };
        self.install_version(&entry, on_progress, cancel).await
    }

    /// Install one specific published version.
    ///
    /// Completion is reported through the returned result and a
    /// [`CatalogEvent::PackageInstalled`] per installed package.
    #[tracing::instrument(skip(self, entry, on_progress, cancel), fields(id = %entry.version.name))]
    pub async fn install_version(
        &self,
        entry: &CatalogEntry,
        on_progress: InstallProgressFn,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, PackageError> {
        let catalog = self.catalog();
        let outcome = self
            .installer
            .install(entry, &catalog, on_progress, cancel)
            .await
            .map_err(PackageError::classify)?;

        for package in &outcome.installed {
            self.emit(CatalogEvent::PackageInstalled {
                id: package.id.clone(),
                version: package.version.clone(),
            });
        }
        Ok(outcome)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<(), PackageError> {
        self.installer
            .remove(id)
            .await
            .map_err(PackageError::classify)?;
        self.emit(CatalogEvent::PackageRemoved { id: id.to_string() });
        Ok(())
    }

    /// Sync the manifest with the packages on disk, returning how many entries changed.
    #[tracing::instrument(skip(self))]
    pub fn reconcile_manifest(&self) -> Result<usize, PackageError> {
        let catalog = self.catalog();
        if catalog.is_empty() {
            warn!("No repositories loaded, nothing can be reconciled");
        }
        let updated = self
            .manifest
            .reconcile_from_disk(&self.config.packages_dir, &catalog)
            .map_err(PackageError::classify)?;
        self.emit(CatalogEvent::ManifestReconciled { updated });
        Ok(updated)
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.read()
    }

    /// Installed packages with a newer published version, by id.
    pub fn outdated(&self, include_prerelease: bool) -> Vec<OutdatedPackage> {
        let catalog = self.catalog();
        let manifest = self.manifest.read();
        manifest
            .locked
            .iter()
            .filter_map(|(id, record)| {
                let newer = catalog.resolve_newer(id, &record.version, include_prerelease)?;
                Some(OutdatedPackage {
                    id: id.clone(),
                    installed: record.version.clone(),
                    latest: newer.version.version.clone(),
                    repository: newer.repository.clone(),
                })
            })
            .collect()
    }
}
