use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{DESCRIPTOR_FILE_NAME, DependencyRecord, LockedRecord, Manifest, PackageDescriptor};
use crate::catalog::PackageCatalog;
use crate::runtime::Runtime;

/// How long a manifest read from disk is served from memory.
pub const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(5);

struct CachedManifest {
    manifest: Manifest,
    read_at: Instant,
}

/// Reads, caches and atomically writes the project manifest.
pub struct ManifestStore<R: Runtime> {
    runtime: Arc<R>,
    path: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<CachedManifest>>,
    /// Serializes read-modify-write cycles
    update_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<R: Runtime> ManifestStore<R> {
    pub fn new(runtime: Arc<R>, path: PathBuf) -> Self {
        Self::with_ttl(runtime, path, MANIFEST_CACHE_TTL)
    }

    pub fn with_ttl(runtime: Arc<R>, path: PathBuf, ttl: Duration) -> Self {
        Self {
            runtime,
            path,
            ttl,
            cache: Mutex::new(None),
            update_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current manifest; a missing or unreadable file reads as empty.
    pub fn read(&self) -> Manifest {
        let mut cache = lock(&self.cache);
        if let Some(cached) = cache.as_ref()
            && cached.read_at.elapsed() < self.ttl
        {
            return cached.manifest.clone();
        }

        let manifest = self.read_from_disk();
        *cache = Some(CachedManifest {
            manifest: manifest.clone(),
            read_at: Instant::now(),
        });
        manifest
    }

    fn read_from_disk(&self) -> Manifest {
        if !self.runtime.exists(&self.path) {
            debug!("No manifest at {:?}", self.path);
            return Manifest::default();
        }
        let parsed = self
            .runtime
            .read_to_string(&self.path)
            .and_then(|content| {
                serde_json::from_str::<Manifest>(&content).context("Failed to parse manifest")
            });
        match parsed {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Treating unreadable manifest {:?} as empty: {:#}", self.path, e);
                Manifest::default()
            }
        }
    }

    /// Replace the manifest file atomically and drop the cached copy.
    #[tracing::instrument(skip(self, manifest))]
    pub fn write(&self, manifest: &Manifest) -> Result<()> {
        let content = serde_json::to_string_pretty(manifest)?;
        let result = self
            .runtime
            .write_atomic(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write manifest {:?}", self.path));
        self.invalidate();
        result
    }

    pub fn invalidate(&self) {
        *lock(&self.cache) = None;
    }

    /// Apply `change` to a fresh copy of the manifest and write it back if it reports a change.
    pub fn update<T>(&self, change: impl FnOnce(&mut Manifest) -> (bool, T)) -> Result<T> {
        let _guard = lock(&self.update_lock);
        self.invalidate();
        let mut manifest = self.read();
        let (changed, value) = change(&mut manifest);
        if changed {
            self.write(&manifest)?;
        }
        Ok(value)
    }

    pub fn add_or_update(
        &self,
        id: &str,
        version: &str,
        dependencies: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        self.update(|manifest| {
            manifest.add_or_update(id, version, dependencies);
            (true, ())
        })
    }

    /// Remove `id` from the manifest, returning whether it was present.
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.update(|manifest| {
            let removed = manifest.remove(id);
            (removed, removed)
        })
    }

    /// Bring the manifest in line with the packages present in `packages_dir`.
    ///
    /// Only packages known to `catalog` are considered. Returns how many
    /// manifest entries were added or changed.
    #[tracing::instrument(skip(self, catalog))]
    pub fn reconcile_from_disk(&self, packages_dir: &Path, catalog: &PackageCatalog) -> Result<usize> {
        let on_disk = self.scan_installed(packages_dir)?;

        self.update(|manifest| {
            let mut updated = 0;
            for descriptor in on_disk.values() {
                let id = &descriptor.name;
                if !catalog.contains(id) {
                    debug!("Skipping {} which no repository publishes", id);
                    continue;
                }
                if manifest.installed_version(id) == Some(descriptor.version.as_str()) {
                    continue;
                }

                info!(
                    "Reconciling {}: manifest {:?}, on disk {}",
                    id,
                    manifest.installed_version(id),
                    descriptor.version
                );
                let is_new = !manifest.is_installed(id);
                if is_new || manifest.dependencies.contains_key(id) {
                    manifest.dependencies.insert(
                        id.clone(),
                        DependencyRecord {
                            version: descriptor.version.clone(),
                        },
                    );
                }
                manifest
                    .locked
                    .entry(id.clone())
                    .or_insert_with(LockedRecord::default)
                    .version = descriptor.version.clone();
                updated += 1;
            }

            let on_disk_ids: BTreeSet<&str> = on_disk.keys().map(String::as_str).collect();
            for id in manifest.locked.keys() {
                if !on_disk_ids.contains(id.as_str()) {
                    warn!("{} is in the manifest but not installed", id);
                }
            }

            (updated > 0, updated)
        })
    }

    /// Descriptors of every package directory, keyed by declared id.
    fn scan_installed(&self, packages_dir: &Path) -> Result<BTreeMap<String, PackageDescriptor>> {
        let mut found = BTreeMap::new();
        if !self.runtime.exists(packages_dir) {
            return Ok(found);
        }

        let entries = self
            .runtime
            .read_dir(packages_dir)
            .with_context(|| format!("Failed to list packages in {:?}", packages_dir))?;
        for dir in entries {
            if !self.runtime.is_dir(&dir) || !self.runtime.exists(&dir.join(DESCRIPTOR_FILE_NAME))
            {
                continue;
            }
            match PackageDescriptor::load(self.runtime.as_ref(), &dir) {
                Ok(descriptor) => {
                    found.insert(descriptor.name.clone(), descriptor);
                }
                Err(e) => warn!("Skipping package directory {:?}: {:#}", dir, e),
            }
        }
        Ok(found)
    }
}
