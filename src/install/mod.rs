//! Package installation and removal.
//!
//! An install walks a fixed sequence of stages:
//!
//! ```text
//! Idle -> Downloading -> Extracting -> Merging -> ManifestUpdate -> Complete
//!              \              \            \             \
//!               +--------------+------------+-------------+--> Failed
//! ```
//!
//! Constraint checks run before the first stage, so a rejected install never
//! touches the disk. The manifest is written last: a failure in any earlier
//! stage leaves no manifest entry for the package.
//!
//! # Structure
//!
//! - `merge` - Diff and copy an extracted payload into the package directory
//! - `locks` - Per package serialization, shared by mutually exclusive packages

mod locks;
mod merge;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveExtractor, ArchiveExtractorImpl, find_package_root};
use crate::catalog::{CatalogEntry, PackageCatalog};
use crate::cleanup::{SharedCleanupContext, TempArtifacts};
use crate::download::{Downloader, ProgressFn, verify_checksum};
use crate::error::{ConstraintViolation, PackageError};
use crate::manifest::ManifestStore;
use crate::repository::PackageVersion;
use crate::rules::ConstraintRules;
use crate::runtime::{Runtime, sanitize_file_name};

pub use locks::PackageLocks;
pub use merge::{META_SUFFIX, MergeReport, collect_files, companion_of, merge_package};

/// Share of a package's progress spent downloading.
const DOWNLOAD_SHARE: f32 = 0.8;

static WORK_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Idle,
    Downloading,
    Extracting,
    Merging,
    ManifestUpdate,
    Complete,
    Failed,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallStage::Idle => "idle",
            InstallStage::Downloading => "downloading",
            InstallStage::Extracting => "extracting",
            InstallStage::Merging => "merging",
            InstallStage::ManifestUpdate => "updating manifest",
            InstallStage::Complete => "complete",
            InstallStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress of one install operation, covering any base package it pulls in.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallProgress {
    pub package: String,
    pub stage: InstallStage,
    /// Overall fraction in `[0, 1]`
    pub fraction: f32,
}

pub type InstallProgressFn = Arc<dyn Fn(InstallProgress) + Send + Sync>;

pub fn no_progress() -> InstallProgressFn {
    Arc::new(|_| {})
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub id: String,
    pub version: String,
}

/// Result of a successful install, base packages first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstallOutcome {
    pub installed: Vec<InstalledPackage>,
    pub files_copied: usize,
    pub files_removed: usize,
}

/// Maps a package's `[0, 1]` progress into a slice of the caller's range.
#[derive(Clone)]
struct ProgressRange {
    sink: InstallProgressFn,
    start: f32,
    end: f32,
}

impl ProgressRange {
    fn full(sink: InstallProgressFn) -> Self {
        Self {
            sink,
            start: 0.0,
            end: 1.0,
        }
    }

    fn sub(&self, start: f32, end: f32) -> Self {
        let span = self.end - self.start;
        Self {
            sink: self.sink.clone(),
            start: self.start + span * start,
            end: self.start + span * end,
        }
    }

    fn report(&self, package: &str, stage: InstallStage, fraction: f32) {
        (self.sink)(InstallProgress {
            package: package.to_string(),
            stage,
            fraction: self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0),
        });
    }
}

/// Current stage of one package, logging and reporting each transition.
struct StageTracker<'a> {
    id: &'a str,
    progress: &'a ProgressRange,
    stage: InstallStage,
    fraction: f32,
}

impl<'a> StageTracker<'a> {
    fn new(id: &'a str, progress: &'a ProgressRange) -> Self {
        Self {
            id,
            progress,
            stage: InstallStage::Idle,
            fraction: 0.0,
        }
    }

    fn enter(&mut self, stage: InstallStage, fraction: f32) {
        debug!("{}: {} -> {}", self.id, self.stage, stage);
        self.stage = stage;
        self.fraction = fraction;
        self.progress.report(self.id, stage, fraction);
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(PackageError::Cancelled.into());
    }
    Ok(())
}

pub struct Installer<R: Runtime + 'static> {
    runtime: Arc<R>,
    downloader: Arc<dyn Downloader>,
    extractor: ArchiveExtractorImpl,
    manifest: Arc<ManifestStore<R>>,
    rules: ConstraintRules,
    packages_dir: PathBuf,
    include_prerelease: bool,
    cleanup_ctx: SharedCleanupContext,
    locks: PackageLocks,
}

impl<R: Runtime + 'static> Installer<R> {
    pub fn new(
        runtime: Arc<R>,
        downloader: Arc<dyn Downloader>,
        manifest: Arc<ManifestStore<R>>,
        rules: ConstraintRules,
        packages_dir: PathBuf,
        cleanup_ctx: SharedCleanupContext,
    ) -> Self {
        Self {
            runtime,
            downloader,
            extractor: ArchiveExtractorImpl::new(),
            manifest,
            rules,
            packages_dir,
            include_prerelease: false,
            cleanup_ctx,
            locks: PackageLocks::new(),
        }
    }

    /// Allow pre-release versions when resolving base packages.
    pub fn with_prerelease(mut self, include_prerelease: bool) -> Self {
        self.include_prerelease = include_prerelease;
        self
    }

    pub fn rules(&self) -> &ConstraintRules {
        &self.rules
    }

    pub fn manifest(&self) -> &Arc<ManifestStore<R>> {
        &self.manifest
    }

    /// Directory a package is installed into. Ids that are not a plain file name are rejected.
    pub fn package_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || sanitize_file_name(id) != id {
            return Err(PackageError::NotFound(format!("Invalid package id {:?}", id)).into());
        }
        Ok(self.packages_dir.join(id))
    }

    /// Install `entry`, installing its required base package first when missing.
    ///
    /// Re-installing the version already present runs the full pipeline again,
    /// which repairs a damaged package directory.
    #[tracing::instrument(skip(self, entry, catalog, on_progress, cancel), fields(id = %entry.version.name, version = %entry.version.version))]
    pub async fn install(
        &self,
        entry: &CatalogEntry,
        catalog: &PackageCatalog,
        on_progress: InstallProgressFn,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        self.install_with_base(entry, catalog, ProgressRange::full(on_progress), cancel, Vec::new())
            .await
    }

    fn install_with_base<'a>(
        &'a self,
        entry: &'a CatalogEntry,
        catalog: &'a PackageCatalog,
        progress: ProgressRange,
        cancel: &'a CancellationToken,
        chain: Vec<String>,
    ) -> BoxFuture<'a, Result<InstallOutcome>> {
        async move {
            let id = entry.version.name.clone();
            if chain.contains(&id) {
                return Err(PackageError::from(ConstraintViolation::BaseInstallFailed {
                    package: chain.last().cloned().unwrap_or_default(),
                    base: id,
                    reason: format!("circular requirement through {}", chain.join(" -> ")),
                })
                .into());
            }

            // A base installed for a package in the same exclusion group runs
            // under the lock its dependent already holds
            let lock_key = self.rules.lock_key(&id);
            let _guard = if chain.iter().any(|c| self.rules.lock_key(c) == lock_key) {
                None
            } else {
                Some(self.locks.acquire(&lock_key).await)
            };
            let target_dir = self.package_dir(&id)?;
            let manifest = self.manifest.read();
            self.rules
                .check_install(&id, &manifest)
                .map_err(PackageError::from)?;

            let mut outcome = InstallOutcome::default();
            let mut dependencies = entry.version.vpm_dependencies.clone();

            let own_progress = match self.rules.missing_base(&id, &manifest) {
                Some(base) => {
                    let base = base.to_string();
                    info!("{} requires {}, installing it first", id, base);
                    let base_entry = catalog
                        .resolve(&base, self.include_prerelease)
                        .or_else(|| catalog.resolve(&base, true))
                        .ok_or_else(|| {
                            PackageError::from(ConstraintViolation::BaseInstallFailed {
                                package: id.clone(),
                                base: base.clone(),
                                reason: "no repository publishes it".to_string(),
                            })
                        })?;

                    let mut base_chain = chain.clone();
                    base_chain.push(id.clone());
                    let base_outcome = self
                        .install_with_base(base_entry, catalog, progress.sub(0.0, 0.5), cancel, base_chain)
                        .await
                        .map_err(|e| match PackageError::classify(e) {
                            PackageError::Cancelled => PackageError::Cancelled,
                            other => PackageError::from(ConstraintViolation::BaseInstallFailed {
                                package: id.clone(),
                                base: base.clone(),
                                reason: other.to_string(),
                            }),
                        })?;

                    dependencies.insert(base, base_entry.version.version.clone());
                    outcome.installed.extend(base_outcome.installed);
                    outcome.files_copied += base_outcome.files_copied;
                    outcome.files_removed += base_outcome.files_removed;
                    progress.sub(0.5, 1.0)
                }
                None => {
                    // Keep the edge to an already installed base
                    if let Some(base) = self.rules.required_base(&id) {
                        if let Some(version) = manifest.installed_version(base) {
                            dependencies.insert(base.to_string(), version.to_string());
                        }
                    }
                    progress
                }
            };

            let mut tracker = StageTracker::new(&id, &own_progress);
            let result = self
                .install_payload(&entry.version, &target_dir, dependencies, &mut tracker, cancel)
                .await;
            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    warn!("Install of {} failed while {}: {:#}", id, tracker.stage, e);
                    let fraction = tracker.fraction;
                    tracker.enter(InstallStage::Failed, fraction);
                    return Err(e);
                }
            };

            info!("Installed {} {}", id, entry.version.version);
            outcome.installed.push(InstalledPackage {
                id: id.clone(),
                version: entry.version.version.clone(),
            });
            outcome.files_copied += report.copied;
            outcome.files_removed += report.removed;
            Ok(outcome)
        }
        .boxed()
    }

    async fn install_payload(
        &self,
        version: &PackageVersion,
        target_dir: &Path,
        dependencies: BTreeMap<String, String>,
        tracker: &mut StageTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<MergeReport> {
        let id = tracker.id;
        if version.download_url.is_empty() {
            return Err(PackageError::RepositoryParse(format!(
                "{} {} has no download url",
                id, version.version
            ))
            .into());
        }
        ensure_not_cancelled(cancel)?;

        let mut artifacts = TempArtifacts::new(self.cleanup_ctx.clone());
        let work_dir = artifacts.track(self.runtime.temp_dir().join(format!(
            "pkgrepo-{}-{}-{}",
            sanitize_file_name(id),
            std::process::id(),
            WORK_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        )));
        self.runtime
            .create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work directory {:?}", work_dir))?;
        let archive_path = work_dir.join("package.archive");
        let extract_dir = work_dir.join("extracted");

        tracker.enter(InstallStage::Downloading, 0.0);
        let download_progress: ProgressFn = {
            let range = tracker.progress.clone();
            let id = id.to_string();
            Arc::new(move |f| range.report(&id, InstallStage::Downloading, f * DOWNLOAD_SHARE))
        };
        self.downloader
            .download(&version.download_url, &archive_path, download_progress, cancel)
            .await?;
        if let Some(expected) = version.content_hash.as_deref().filter(|h| !h.trim().is_empty()) {
            verify_checksum(self.runtime.as_ref(), &archive_path, expected)?;
        } else {
            debug!("No checksum published for {} {}", id, version.version);
        }
        ensure_not_cancelled(cancel)?;

        tracker.enter(InstallStage::Extracting, DOWNLOAD_SHARE);
        let count = self
            .extractor
            .extract(self.runtime.as_ref(), &archive_path, &extract_dir)?;
        let package_root = find_package_root(self.runtime.as_ref(), &extract_dir)?;
        debug!("Extracted {} files, package root {:?}", count, package_root);
        ensure_not_cancelled(cancel)?;

        tracker.enter(InstallStage::Merging, 0.85);
        let report = merge_package(self.runtime.as_ref(), &package_root, target_dir)?;

        tracker.enter(InstallStage::ManifestUpdate, 0.95);
        self.manifest
            .add_or_update(id, &version.version, Some(dependencies))?;

        tracker.enter(InstallStage::Complete, 1.0);
        Ok(report)
    }

    /// Remove an installed package from disk and from the manifest.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(&self.rules.lock_key(id)).await;
        let target_dir = self.package_dir(id)?;
        let manifest = self.manifest.read();

        if !manifest.is_installed(id) && !self.runtime.exists(&target_dir) {
            return Err(PackageError::NotFound(format!("{} is not installed", id)).into());
        }
        self.rules
            .check_remove(id, &manifest)
            .map_err(PackageError::from)?;

        if self.runtime.exists(&target_dir) {
            debug!("Removing {:?}", target_dir);
            self.runtime
                .remove_dir_all(&target_dir)
                .with_context(|| format!("Failed to remove {:?}", target_dir))?;
        }
        let companion = companion_of(&target_dir);
        if self.runtime.exists(&companion) {
            self.runtime
                .remove_file(&companion)
                .with_context(|| format!("Failed to remove {:?}", companion))?;
        }

        self.manifest.remove(id)?;
        info!("Removed {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::new_shared;
    use crate::download::{HttpDownloader, MockDownloader};
    use crate::http::HttpClient;
    use crate::manifest::MANIFEST_CACHE_TTL;
    use crate::repository::{Package, Repository};
    use crate::runtime::RealRuntime;
    use reqwest::Client;
    use sha2::{Digest, Sha256};
    use std::fs;
    use std::io::{Cursor, Write};
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        server: mockito::ServerGuard,
        installer: Installer<RealRuntime>,
    }

    impl Fixture {
        fn packages_dir(&self) -> PathBuf {
            self.dir.path().join("Packages")
        }

        fn entry(&self, id: &str, version: &str) -> CatalogEntry {
            CatalogEntry {
                version: PackageVersion {
                    name: id.into(),
                    version: version.into(),
                    download_url: format!("{}/{}-{}.zip", self.server.url(), id, version),
                    ..Default::default()
                },
                repository: "test".into(),
            }
        }

        async fn serve(&mut self, id: &str, version: &str, body: Vec<u8>) -> mockito::Mock {
            self.server
                .mock("GET", format!("/{}-{}.zip", id, version).as_str())
                .with_body(body)
                .create_async()
                .await
        }
    }

    async fn fixture_with(rules: ConstraintRules, downloader: Option<Arc<dyn Downloader>>) -> Fixture {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(RealRuntime);
        let packages_dir = dir.path().join("Packages");
        let manifest = Arc::new(ManifestStore::with_ttl(
            runtime.clone(),
            packages_dir.join("vpm-manifest.json"),
            MANIFEST_CACHE_TTL,
        ));
        let downloader = downloader.unwrap_or_else(|| {
            let http_client = HttpClient::new(Client::new()).without_retry_delay();
            Arc::new(HttpDownloader::new(runtime.clone(), http_client))
        });
        let installer = Installer::new(runtime, downloader, manifest, rules, packages_dir, new_shared());
        Fixture {
            dir,
            server: mockito::Server::new_async().await,
            installer,
        }
    }

    async fn fixture(rules: ConstraintRules) -> Fixture {
        fixture_with(rules, None).await
    }

    fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        use ::zip::ZipWriter;
        use ::zip::write::FileOptions;

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options: FileOptions<()> = FileOptions::default();
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn payload(id: &str, version: &str, extra: &[(&str, &str)]) -> Vec<u8> {
        let descriptor = format!(r#"{{"name": "{}", "version": "{}"}}"#, id, version);
        let mut files = vec![("package.json", descriptor.as_str())];
        files.extend_from_slice(extra);
        zip_bytes(&files)
    }

    fn catalog_of(entries: &[CatalogEntry]) -> PackageCatalog {
        let mut repo = Repository {
            name: "test".into(),
            url: "https://example.com/index.json".into(),
            ..Default::default()
        };
        for entry in entries {
            let package = repo
                .packages
                .entry(entry.version.name.clone())
                .or_insert_with(|| Package {
                    id: entry.version.name.clone(),
                    ..Default::default()
                });
            package
                .versions
                .insert(entry.version.version.clone(), entry.version.clone());
        }
        PackageCatalog::from_repositories(&[repo])
    }

    fn recording_progress() -> (InstallProgressFn, Arc<Mutex<Vec<InstallProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: InstallProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));
        (progress, seen)
    }

    #[tokio::test]
    async fn test_install_writes_files_then_manifest() {
        let mut f = fixture(ConstraintRules::default()).await;
        let mock = f
            .serve("com.a", "1.0.0", payload("com.a", "1.0.0", &[("Runtime/a.cs", "class A {}")]))
            .await;
        let entry = f.entry("com.a", "1.0.0");
        let (progress, seen) = recording_progress();

        let outcome = f
            .installer
            .install(&entry, &catalog_of(&[entry.clone()]), progress, &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            outcome.installed,
            vec![InstalledPackage {
                id: "com.a".into(),
                version: "1.0.0".into()
            }]
        );
        assert_eq!(outcome.files_copied, 2);
        let package_dir = f.packages_dir().join("com.a");
        assert_eq!(
            fs::read_to_string(package_dir.join("Runtime/a.cs")).unwrap(),
            "class A {}"
        );
        assert_eq!(
            f.installer.manifest().read().installed_version("com.a"),
            Some("1.0.0")
        );

        let seen = seen.lock().unwrap();
        let stages: Vec<InstallStage> = seen.iter().map(|p| p.stage).collect();
        assert_eq!(stages.first(), Some(&InstallStage::Downloading));
        assert_eq!(stages.last(), Some(&InstallStage::Complete));
        assert!(stages.contains(&InstallStage::Merging));
        assert!(seen.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert_eq!(seen.last().unwrap().fraction, 1.0);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_base_is_installed_first() {
        let rules = ConstraintRules::default().require("com.addon", "com.base");
        let mut f = fixture(rules).await;
        let _base = f.serve("com.base", "2.0.0", payload("com.base", "2.0.0", &[])).await;
        let _addon = f.serve("com.addon", "1.0.0", payload("com.addon", "1.0.0", &[])).await;
        let base = f.entry("com.base", "2.0.0");
        let addon = f.entry("com.addon", "1.0.0");
        let catalog = catalog_of(&[base, addon.clone()]);
        let (progress, seen) = recording_progress();

        let outcome = f
            .installer
            .install(&addon, &catalog, progress, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<&str> = outcome.installed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["com.base", "com.addon"]);

        let manifest = f.installer.manifest().read();
        assert_eq!(manifest.installed_version("com.base"), Some("2.0.0"));
        assert_eq!(
            manifest.locked["com.addon"].dependencies.get("com.base"),
            Some(&"2.0.0".to_string())
        );
        assert_eq!(manifest.dependents_of("com.base"), vec!["com.addon".to_string()]);

        let seen = seen.lock().unwrap();
        assert!(
            seen.iter()
                .filter(|p| p.package == "com.base")
                .all(|p| p.fraction <= 0.5)
        );
        assert!(
            seen.iter()
                .filter(|p| p.package == "com.addon")
                .all(|p| p.fraction >= 0.5)
        );
    }

    #[tokio::test]
    async fn test_unpublished_base_fails_without_installing() {
        let rules = ConstraintRules::default().require("com.addon", "com.base");
        let mut f = fixture(rules).await;
        let mock = f
            .server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let addon = f.entry("com.addon", "1.0.0");

        let err = f
            .installer
            .install(&addon, &catalog_of(&[addon.clone()]), no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();

        match PackageError::classify(err) {
            PackageError::ConstraintViolation(ConstraintViolation::BaseInstallFailed { package, base, .. }) => {
                assert_eq!(package, "com.addon");
                assert_eq!(base, "com.base");
            }
            other => panic!("unexpected {:?}", other),
        }
        mock.assert_async().await;
        assert!(!f.packages_dir().join("com.addon").exists());
        assert!(!f.installer.manifest().read().is_installed("com.addon"));
    }

    #[tokio::test]
    async fn test_mutually_exclusive_install_touches_nothing() {
        let rules = ConstraintRules::default().mutually_exclusive("variant-x", "variant-y");
        let mut f = fixture(rules).await;
        f.installer
            .manifest()
            .add_or_update("variant-y", "1.0.0", None)
            .unwrap();
        let mock = f
            .server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let entry = f.entry("variant-x", "1.0.0");

        let err = f
            .installer
            .install(&entry, &catalog_of(&[entry.clone()]), no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(PackageError::classify(err).is_constraint_violation());
        mock.assert_async().await;
        assert!(!f.packages_dir().join("variant-x").exists());
        assert!(!f.installer.manifest().read().is_installed("variant-x"));
    }

    #[tokio::test]
    async fn test_concurrent_exclusive_installs_admit_one() {
        let rules = ConstraintRules::default().mutually_exclusive("variant-x", "variant-y");
        let mut f = fixture(rules).await;
        let _x = f.serve("variant-x", "1.0.0", payload("variant-x", "1.0.0", &[])).await;
        let _y = f.serve("variant-y", "1.0.0", payload("variant-y", "1.0.0", &[])).await;
        let x = f.entry("variant-x", "1.0.0");
        let y = f.entry("variant-y", "1.0.0");
        let catalog = catalog_of(&[x.clone(), y.clone()]);
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            f.installer.install(&x, &catalog, no_progress(), &cancel),
            f.installer.install(&y, &catalog, no_progress(), &cancel),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let manifest = f.installer.manifest().read();
        assert_ne!(
            manifest.is_installed("variant-x"),
            manifest.is_installed("variant-y")
        );
        let rejected = results.into_iter().find_map(Result::err).unwrap();
        assert!(PackageError::classify(rejected).is_constraint_violation());
    }

    #[test_log::test(tokio::test)]
    async fn test_upgrade_removes_stale_files_and_metadata() {
        let mut f = fixture(ConstraintRules::default()).await;
        let _v1 = f.serve(
            "com.a",
            "1.0.0",
            payload(
                "com.a",
                "1.0.0",
                &[("Runtime/old.cs", "old"), ("Runtime/old.cs.meta", "guid"), ("Runtime/kept.cs", "v1")],
            ),
        )
        .await;
        let _v2 = f.serve("com.a", "1.1.0", payload("com.a", "1.1.0", &[("Runtime/kept.cs", "v2")]))
            .await;
        let v1 = f.entry("com.a", "1.0.0");
        let v2 = f.entry("com.a", "1.1.0");
        let catalog = catalog_of(&[v1.clone(), v2.clone()]);
        let cancel = CancellationToken::new();

        f.installer.install(&v1, &catalog, no_progress(), &cancel).await.unwrap();
        let outcome = f.installer.install(&v2, &catalog, no_progress(), &cancel).await.unwrap();

        let package_dir = f.packages_dir().join("com.a");
        assert_eq!(outcome.files_removed, 2);
        assert!(!package_dir.join("Runtime/old.cs").exists());
        assert!(!package_dir.join("Runtime/old.cs.meta").exists());
        assert_eq!(fs::read_to_string(package_dir.join("Runtime/kept.cs")).unwrap(), "v2");
        assert_eq!(
            f.installer.manifest().read().installed_version("com.a"),
            Some("1.1.0")
        );
    }

    #[tokio::test]
    async fn test_checksum_is_verified() {
        let mut f = fixture(ConstraintRules::default()).await;
        let body = payload("com.a", "1.0.0", &[]);
        let digest = hex::encode(Sha256::digest(&body));
        let _mock = f.serve("com.a", "1.0.0", body).await;

        let mut good = f.entry("com.a", "1.0.0");
        good.version.content_hash = Some(digest.to_uppercase());
        let mut bad = good.clone();
        bad.version.content_hash = Some("00".repeat(32));
        let catalog = catalog_of(&[good.clone()]);
        let cancel = CancellationToken::new();

        let err = f
            .installer
            .install(&bad, &catalog, no_progress(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(PackageError::classify(err), PackageError::Corruption(_)));
        assert!(!f.packages_dir().join("com.a").exists());
        assert!(!f.installer.manifest().read().is_installed("com.a"));

        f.installer.install(&good, &catalog, no_progress(), &cancel).await.unwrap();
        assert!(f.installer.manifest().read().is_installed("com.a"));
    }

    #[tokio::test]
    async fn test_cancelled_install_leaves_no_manifest_entry() {
        let f = fixture(ConstraintRules::default()).await;
        let entry = f.entry("com.a", "1.0.0");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .installer
            .install(&entry, &catalog_of(&[entry.clone()]), no_progress(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(PackageError::classify(err), PackageError::Cancelled));
        assert!(!f.installer.manifest().read().is_installed("com.a"));
    }

    #[test_log::test(tokio::test)]
    async fn test_download_failure_reports_failed_stage() {
        let mut downloader = MockDownloader::new();
        downloader
            .expect_download()
            .times(1)
            .returning(|_, _, _, _| Err(anyhow::anyhow!("connection reset")));
        let f = fixture_with(ConstraintRules::default(), Some(Arc::new(downloader))).await;
        let entry = f.entry("com.a", "1.0.0");
        let (progress, seen) = recording_progress();

        let result = f
            .installer
            .install(&entry, &catalog_of(&[entry.clone()]), progress, &CancellationToken::new())
            .await;

        assert!(result.is_err());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().map(|p| p.stage), Some(InstallStage::Failed));
        assert!(!f.packages_dir().join("com.a").exists());
        assert!(!f.installer.manifest().read().is_installed("com.a"));
    }

    #[tokio::test]
    async fn test_empty_archive_is_reported_as_corruption() {
        let mut downloader = MockDownloader::new();
        downloader
            .expect_download()
            .times(1)
            .returning(|_, dest, _, _| {
                let empty = zip_bytes(&[]);
                fs::write(dest, &empty)?;
                Ok(empty.len() as u64)
            });
        let f = fixture_with(ConstraintRules::default(), Some(Arc::new(downloader))).await;
        let entry = f.entry("com.a", "1.0.0");

        let err = f
            .installer
            .install(&entry, &catalog_of(&[entry.clone()]), no_progress(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(PackageError::classify(err), PackageError::Corruption(_)));
        assert!(!f.packages_dir().join("com.a").exists());
        assert!(!f.installer.manifest().read().is_installed("com.a"));
    }

    #[tokio::test]
    async fn test_remove_deletes_directory_companion_and_entry() {
        let f = fixture(ConstraintRules::default()).await;
        let package_dir = f.packages_dir().join("com.a");
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(package_dir.join("package.json"), "{}").unwrap();
        fs::write(f.packages_dir().join("com.a.meta"), "guid").unwrap();
        f.installer.manifest().add_or_update("com.a", "1.0.0", None).unwrap();

        f.installer.remove("com.a").await.unwrap();

        assert!(!package_dir.exists());
        assert!(!f.packages_dir().join("com.a.meta").exists());
        assert!(!f.installer.manifest().read().is_installed("com.a"));
    }

    #[tokio::test]
    async fn test_remove_is_guarded() {
        let f = fixture(ConstraintRules::default().protect("com.core")).await;
        let deps = BTreeMap::from([("com.c".to_string(), "1.0.0".to_string())]);
        let manifest = f.installer.manifest();
        manifest.add_or_update("com.c", "1.0.0", None).unwrap();
        manifest.add_or_update("com.d", "1.0.0", Some(deps)).unwrap();
        manifest.add_or_update("com.core", "1.0.0", None).unwrap();
        fs::create_dir_all(f.packages_dir().join("com.c")).unwrap();

        let err = f.installer.remove("com.c").await.unwrap_err();
        match PackageError::classify(err) {
            PackageError::ConstraintViolation(ConstraintViolation::RequiredBy { dependents, .. }) => {
                assert_eq!(dependents, vec!["com.d".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.packages_dir().join("com.c").exists());

        let err = f.installer.remove("com.core").await.unwrap_err();
        assert!(PackageError::classify(err).is_constraint_violation());
        assert!(manifest.read().is_installed("com.core"));
    }

    #[tokio::test]
    async fn test_remove_unknown_package() {
        let f = fixture(ConstraintRules::default()).await;
        let err = f.installer.remove("com.missing").await.unwrap_err();
        assert!(matches!(PackageError::classify(err), PackageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_package_dir_rejects_path_like_ids() {
        let f = fixture(ConstraintRules::default()).await;
        assert!(f.installer.package_dir("com.a").is_ok());
        assert!(f.installer.package_dir("../outside").is_err());
        assert!(f.installer.package_dir("a/b").is_err());
        assert!(f.installer.package_dir("").is_err());
    }
}
