//! Error taxonomy surfaced to callers of the engine.
//!
//! Internal plumbing uses `anyhow` with context; operations exposed through
//! [`crate::context::PackageManager`] classify their failures into
//! [`PackageError`] so the presentation layer can show a definite reason.

use thiserror::Error;

use crate::http::NonRetryableError;

/// A rejected operation, decided before any filesystem mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    #[error("{package} cannot be installed while {conflicts_with} is installed")]
    MutuallyExclusive {
        package: String,
        conflicts_with: String,
    },

    #[error("{package} is protected and cannot be removed")]
    Protected { package: String },

    #[error("{package} is required by {}", dependents.join(", "))]
    RequiredBy {
        package: String,
        dependents: Vec<String>,
    },

    #[error("Circular base requirement: {}", packages.join(" -> "))]
    CircularRequirement { packages: Vec<String> },

    #[error("{package} requires {base}, which failed to install: {reason}")]
    BaseInstallFailed {
        package: String,
        base: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum PackageError {
    /// Malformed or incomplete repository descriptor
    #[error("Invalid repository descriptor: {0}")]
    RepositoryParse(String),

    /// Download or descriptor fetch failure
    #[error("Network error: {0}")]
    Network(String),

    /// Permission or lock issues while touching the project
    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("{0}")]
    ConstraintViolation(#[from] ConstraintViolation),

    /// Content that exists on disk or on the wire but cannot be trusted
    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl PackageError {
    /// Map an internal error onto the public taxonomy.
    ///
    /// An error that already is a `PackageError` is preserved; network and
    /// I/O errors anywhere in the chain decide the category; everything else
    /// is reported as a file system failure since that is where the
    /// installer spends its time.
    pub fn classify(error: anyhow::Error) -> Self {
        let error = match error.downcast::<PackageError>() {
            Ok(package_error) => return package_error,
            Err(error) => error,
        };

        for cause in error.chain() {
            if cause.downcast_ref::<NonRetryableError>().is_some()
                || cause.downcast_ref::<reqwest::Error>().is_some()
            {
                return PackageError::Network(format!("{:#}", error));
            }
            if cause.downcast_ref::<std::io::Error>().is_some() {
                return PackageError::FileSystem(format!("{:#}", error));
            }
            if cause.downcast_ref::<serde_json::Error>().is_some() {
                return PackageError::Corruption(format!("{:#}", error));
            }
        }

        PackageError::FileSystem(format!("{:#}", error))
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, PackageError::ConstraintViolation(_))
    }
}
