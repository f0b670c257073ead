//! The project manifest: durable record of installed packages.
//!
//! `dependencies` holds the packages requested directly, `locked` every
//! installed package with the dependency edges captured when it was installed.

mod descriptor;
mod store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use descriptor::{DESCRIPTOR_FILE_NAME, DescriptorAuthor, PackageDescriptor};
pub use store::{MANIFEST_CACHE_TTL, ManifestStore};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyRecord>,
    #[serde(default)]
    pub locked: BTreeMap<String, LockedRecord>,
    /// Top-level keys written by other tools, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DependencyRecord {
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct LockedRecord {
    pub version: String,
    /// Dependency id to version range
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl Manifest {
    pub fn is_installed(&self, id: &str) -> bool {
        self.locked.contains_key(id) || self.dependencies.contains_key(id)
    }

    /// Installed version, preferring the locked record.
    pub fn installed_version(&self, id: &str) -> Option<&str> {
        self.locked
            .get(id)
            .map(|l| l.version.as_str())
            .or_else(|| self.dependencies.get(id).map(|d| d.version.as_str()))
    }

    /// Ids of other packages whose locked dependencies reference `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.locked
            .iter()
            .filter(|(other, record)| other.as_str() != id && record.dependencies.contains_key(id))
            .map(|(other, _)| other.clone())
            .collect()
    }

    pub fn add_or_update(
        &mut self,
        id: &str,
        version: &str,
        dependencies: Option<BTreeMap<String, String>>,
    ) {
        self.dependencies.insert(
            id.to_string(),
            DependencyRecord {
                version: version.to_string(),
            },
        );
        self.locked.insert(
            id.to_string(),
            LockedRecord {
                version: version.to_string(),
                dependencies: dependencies.unwrap_or_default(),
            },
        );
    }

    /// Drop `id` from both maps. Dependents are left alone.
    pub fn remove(&mut self, id: &str) -> bool {
        let direct = self.dependencies.remove(id).is_some();
        let locked = self.locked.remove(id).is_some();
        direct || locked
    }
}
