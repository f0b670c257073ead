//! Flattened view of every package published by the loaded repositories.

mod version;

use log::debug;
use std::collections::BTreeMap;

use crate::repository::{PackageVersion, Repository};

pub use version::{VersionResolver, Versioned};

/// A published version together with the repository it will be fetched from.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub version: PackageVersion,
    pub repository: String,
}

impl Versioned for CatalogEntry {
    fn version_str(&self) -> &str {
        &self.version.version
    }
}

/// All versions of one package id across repositories.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogPackage {
    pub id: String,
    pub versions: BTreeMap<String, CatalogEntry>,
    /// Set when more than one repository publishes this id
    pub from_multiple_repositories: bool,
}

impl CatalogPackage {
    pub fn latest(&self, include_unstable: bool) -> Option<&CatalogEntry> {
        VersionResolver::latest(self.versions.values(), include_unstable)
    }

    pub fn latest_newer(&self, current: &str, include_unstable: bool) -> Option<&CatalogEntry> {
        VersionResolver::latest_newer(self.versions.values(), current, include_unstable)
    }
}

/// Package catalog merged from repositories in priority order.
///
/// When two repositories publish the same `(id, version)`, the one earlier in
/// the list wins and the later copy is ignored.
#[derive(Debug, Clone, Default)]
pub struct PackageCatalog {
    packages: BTreeMap<String, CatalogPackage>,
}

impl PackageCatalog {
    pub fn from_repositories(repositories: &[Repository]) -> Self {
        let mut packages: BTreeMap<String, CatalogPackage> = BTreeMap::new();
        // Which repository first contributed each id
        let mut first_source: BTreeMap<String, &str> = BTreeMap::new();

        for repo in repositories {
            for (id, package) in &repo.packages {
                let entry = packages.entry(id.clone()).or_insert_with(|| CatalogPackage {
                    id: id.clone(),
                    ..Default::default()
                });
                match first_source.get(id.as_str()) {
                    None => {
                        first_source.insert(id.clone(), repo.name.as_str());
                    }
                    Some(first) if *first != repo.name => entry.from_multiple_repositories = true,
                    Some(_) => {}
                }

                for (key, version) in &package.versions {
                    if entry.versions.contains_key(key) {
                        debug!(
                            "{} {} from {:?} shadowed by an earlier repository",
                            id, key, repo.name
                        );
                        continue;
                    }
                    // The map key is authoritative for the package id
                    let mut version = version.clone();
                    version.name = id.clone();
                    entry.versions.insert(
                        key.clone(),
                        CatalogEntry {
                            version,
                            repository: repo.name.clone(),
                        },
                    );
                }
            }
        }

        Self { packages }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.packages.contains_key(id)
    }

    pub fn package(&self, id: &str) -> Option<&CatalogPackage> {
        self.packages.get(id)
    }

    pub fn packages(&self) -> impl Iterator<Item = &CatalogPackage> {
        self.packages.values()
    }

    /// Latest version of `id`, from whichever repository publishes it.
    pub fn resolve(&self, id: &str, include_unstable: bool) -> Option<&CatalogEntry> {
        self.package(id)?.latest(include_unstable)
    }

    pub fn resolve_newer(
        &self,
        id: &str,
        current: &str,
        include_unstable: bool,
    ) -> Option<&CatalogEntry> {
        self.package(id)?.latest_newer(current, include_unstable)
    }

    /// Exact published version string of `id`.
    pub fn find_version(&self, id: &str, version: &str) -> Option<&CatalogEntry> {
        self.package(id)?.versions.get(version)
    }

    /// The single best version of every package, for display and selection.
    pub fn latest_per_package(&self, include_unstable: bool) -> Vec<&CatalogEntry> {
        self.packages
            .values()
            .filter_map(|p| p.latest(include_unstable))
            .collect()
    }
}
