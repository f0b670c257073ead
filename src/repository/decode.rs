//! Decoding of repository descriptors.
//!
//! Descriptors arrive in three shapes carrying the same data: the fields at
//! the top level, the fields nested under `repo`, or a `repositories` map
//! keyed by an opaque id. Field names are matched case-insensitively. Each
//! shape is a [`DecodeStrategy`]; they are tried in [`DecodeStrategy::ORDER`]
//! and the first one yielding a repository with a URL wins.

use log::debug;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{Package, PackageVersion, Repository};
use crate::error::PackageError;

const VERSION_FIELDS: &[&str] = &[
    "name",
    "displayName",
    "version",
    "unity",
    "description",
    "author",
    "license",
    "changelogUrl",
    "url",
    "zipSHA256",
    "vpmDependencies",
];

const AUTHOR_FIELDS: &[&str] = &["name", "url"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// `{ "name": .., "url": .., "packages": .. }`
    Direct,
    /// `{ "repo": { "name": .., "url": .. } }`
    Wrapped,
    /// `{ "repositories": { "<id>": { "url": .., "name": .. } } }`
    RepositoriesMap,
}

impl DecodeStrategy {
    pub const ORDER: [DecodeStrategy; 3] = [
        DecodeStrategy::Direct,
        DecodeStrategy::Wrapped,
        DecodeStrategy::RepositoriesMap,
    ];

    /// Attempt this shape on an already parsed document.
    ///
    /// Returns `None` when the shape does not match or yields no URL.
    pub fn decode(self, root: &Value) -> Option<Repository> {
        let root = root.as_object()?;
        let repo = match self {
            DecodeStrategy::Direct => decode_fields(root),
            DecodeStrategy::Wrapped => {
                let inner = field(root, "repo")?.as_object()?;
                with_outer_packages(decode_fields(inner), root)
            }
            DecodeStrategy::RepositoriesMap => {
                let repositories = field(root, "repositories")?.as_object()?;
                let repo = repositories.iter().find_map(|(key, entry)| {
                    let mut repo = decode_fields(entry.as_object()?);
                    if repo.url.is_empty() {
                        return None;
                    }
                    if repo.id.is_empty() {
                        repo.id = key.clone();
                    }
                    Some(repo)
                })?;
                with_outer_packages(repo, root)
            }
        };
        (!repo.url.is_empty()).then_some(repo)
    }
}

/// Parse descriptor bytes, trying every strategy in order.
pub fn decode_repository(bytes: &[u8]) -> Result<Repository, PackageError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(PackageError::RepositoryParse("descriptor is empty".into()));
    }

    let root: Value = serde_json::from_slice(bytes)
        .map_err(|e| PackageError::RepositoryParse(format!("invalid JSON: {}", e)))?;
    if !root.is_object() {
        return Err(PackageError::RepositoryParse(
            "descriptor is not a JSON object".into(),
        ));
    }

    for strategy in DecodeStrategy::ORDER {
        if let Some(repo) = strategy.decode(&root) {
            debug!("Decoded repository {:?} using {:?}", repo.name, strategy);
            return Ok(repo);
        }
    }

    Err(PackageError::RepositoryParse(
        "descriptor does not declare a url".into(),
    ))
}

/// Case-insensitive field lookup, preferring an exact match.
fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).or_else(|| {
        obj.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    field(obj, key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn decode_fields(obj: &Map<String, Value>) -> Repository {
    let author = match field(obj, "author") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Object(author)) => string_field(author, "name"),
        _ => String::new(),
    };

    Repository {
        name: string_field(obj, "name"),
        author,
        url: string_field(obj, "url"),
        id: string_field(obj, "id"),
        packages: field(obj, "packages")
            .and_then(Value::as_object)
            .map(decode_packages)
            .unwrap_or_default(),
        local_path: None,
    }
}

fn with_outer_packages(mut repo: Repository, root: &Map<String, Value>) -> Repository {
    if repo.packages.is_empty()
        && let Some(packages) = field(root, "packages").and_then(Value::as_object)
    {
        repo.packages = decode_packages(packages);
    }
    repo
}

fn decode_packages(packages: &Map<String, Value>) -> BTreeMap<String, Package> {
    let mut result = BTreeMap::new();
    for (id, entry) in packages {
        let Some(versions) = entry
            .as_object()
            .and_then(|e| field(e, "versions"))
            .and_then(Value::as_object)
        else {
            debug!("Skipping package {} without versions", id);
            continue;
        };

        let mut package = Package {
            id: id.clone(),
            versions: BTreeMap::new(),
        };
        for (version_key, value) in versions {
            match decode_version(value) {
                Some(mut version) => {
                    if version.version.is_empty() {
                        version.version = version_key.clone();
                    }
                    if version.name.is_empty() {
                        version.name = id.clone();
                    }
                    package.versions.insert(version_key.clone(), version);
                }
                None => debug!("Skipping malformed version {} of {}", version_key, id),
            }
        }
        result.insert(id.clone(), package);
    }
    result
}

fn decode_version(value: &Value) -> Option<PackageVersion> {
    let mut obj = canonical_keys(value.as_object()?, VERSION_FIELDS);
    match obj.get("author") {
        Some(Value::String(name)) => {
            let author = Value::Object(Map::from_iter([(
                "name".to_string(),
                Value::String(name.clone()),
            )]));
            obj.insert("author".into(), author);
        }
        Some(Value::Object(author)) => {
            let author = Value::Object(canonical_keys(author, AUTHOR_FIELDS));
            obj.insert("author".into(), author);
        }
        Some(_) => {
            obj.remove("author");
        }
        None => {}
    }
    serde_json::from_value(Value::Object(obj)).ok()
}

/// Rename keys matching a known field case-insensitively to its canonical spelling.
fn canonical_keys(obj: &Map<String, Value>, known: &[&str]) -> Map<String, Value> {
    obj.iter()
        .map(|(key, value)| {
            let canonical = known
                .iter()
                .find(|k| k.eq_ignore_ascii_case(key))
                .map(|k| k.to_string())
                .unwrap_or_else(|| key.clone());
            (canonical, value.clone())
        })
        .collect()
}
