use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::runtime::Runtime;

/// File name of the descriptor found at the root of every installed package.
pub const DESCRIPTOR_FILE_NAME: &str = "package.json";

/// The `package.json` shipped inside a package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<DescriptorAuthor>,
}

/// Authors appear either as a plain string or as an object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum DescriptorAuthor {
    Name(String),
    Detailed {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
}

impl DescriptorAuthor {
    pub fn name(&self) -> &str {
        match self {
            DescriptorAuthor::Name(name) => name,
            DescriptorAuthor::Detailed { name, .. } => name,
        }
    }
}

impl PackageDescriptor {
    /// Load the descriptor of the package rooted at `package_dir`.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime + ?Sized>(runtime: &R, package_dir: &Path) -> Result<Self> {
        let path = package_dir.join(DESCRIPTOR_FILE_NAME);
        let content = runtime
            .read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let descriptor: PackageDescriptor = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(descriptor)
    }
}
