//! Repository descriptors: the catalogs of packages published by remote sources.
//!
//! # Structure
//!
//! - `decode` - Ordered decode strategies for the accepted wire shapes
//! - `store` - Loading, persisting, downloading and refreshing descriptors

mod decode;
mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use decode::{DecodeStrategy, decode_repository};
pub use store::{RepositoryStore, derive_name_from_url};

/// A named source of packages, optionally backed by a URL for refresh.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub packages: BTreeMap<String, Package>,
    /// Where the descriptor lives on disk, if it has been persisted
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

impl Repository {
    /// Duplicate detection: same (name, id) when both are present, otherwise same URL.
    pub fn is_same_as(&self, other: &Repository) -> bool {
        let same_identity = !self.name.is_empty()
            && !self.id.is_empty()
            && self.name == other.name
            && self.id == other.id;
        let same_url = !self.url.is_empty() && self.url == other.url;
        same_identity || same_url
    }

    /// Whether the descriptor can be re-fetched from the network.
    pub fn is_remote(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.get(id)
    }
}

/// A package with one entry per published version string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Package {
    /// Filled from the key of the enclosing `packages` map
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub versions: BTreeMap<String, PackageVersion>,
}

/// One immutable, fully described release of a package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "unity", default, skip_serializing_if = "Option::is_none")]
    pub unity_compatibility: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog_url: Option<String>,
    #[serde(rename = "url", default)]
    pub download_url: String,
    #[serde(rename = "zipSHA256", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Packages this version needs, keyed by id with a version range as value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vpm_dependencies: BTreeMap<String, String>,
}

impl PackageVersion {
    pub fn author_name(&self) -> Option<&str> {
        self.author.as_ref().map(|a| a.name.as_str())
    }

    pub fn author_url(&self) -> Option<&str> {
        self.author.as_ref().and_then(|a| a.url.as_deref())
    }

    /// Display name, falling back to the package name.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Author {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
