//! Package archive extraction.
//!
//! Archives are recognised by their leading bytes rather than by file name,
//! since downloads land in temporary files with arbitrary names.

mod tar_gz;
mod zip;

use crate::error::PackageError;
use crate::manifest::DESCRIPTOR_FILE_NAME;
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use log::debug;
use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};

pub use tar_gz::TarGzExtractor;
pub use zip::ZipExtractor;

const HEADER_LEN: usize = 8;

/// Trait for format-specific archive extractors
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveExtractor: Send + Sync {
    /// Check if this extractor understands an archive starting with `header`
    fn can_handle(&self, header: &[u8]) -> bool;

    /// Extract the whole archive below `extract_to`, returning the number of files written
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<usize>;
}

/// Dispatcher that selects the appropriate extractor based on the archive's magic bytes.
pub struct ArchiveExtractorImpl {
    zip: ZipExtractor,
    tar_gz: TarGzExtractor,
}

impl Default for ArchiveExtractorImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveExtractorImpl {
    pub fn new() -> Self {
        Self {
            zip: ZipExtractor,
            tar_gz: TarGzExtractor,
        }
    }
}

impl ArchiveExtractor for ArchiveExtractorImpl {
    fn can_handle(&self, header: &[u8]) -> bool {
        self.zip.can_handle(header) || self.tar_gz.can_handle(header)
    }

    #[tracing::instrument(skip(self, runtime))]
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<usize> {
        let header = read_header(runtime, archive_path)?;
        if self.zip.can_handle(&header) {
            return self.zip.extract(runtime, archive_path, extract_to);
        }
        if self.tar_gz.can_handle(&header) {
            return self.tar_gz.extract(runtime, archive_path, extract_to);
        }
        Err(PackageError::Corruption(format!(
            "Unsupported archive format: {}",
            archive_path.display()
        ))
        .into())
    }
}

fn read_header<R: Runtime>(runtime: &R, path: &Path) -> Result<Vec<u8>> {
    let reader = runtime
        .open(path)
        .with_context(|| format!("Failed to open archive at {:?}", path))?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    reader
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)
        .with_context(|| format!("Failed to read archive header of {:?}", path))?;
    Ok(header)
}

/// Locate the directory holding the package descriptor inside an extracted archive.
///
/// Archives may wrap the package in one or more directories, so the tree is
/// searched breadth-first and the shallowest descriptor wins.
pub fn find_package_root<R: Runtime>(runtime: &R, extracted: &Path) -> Result<PathBuf> {
    let mut queue = VecDeque::from([extracted.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let descriptor = dir.join(DESCRIPTOR_FILE_NAME);
        if runtime.exists(&descriptor) && !runtime.is_dir(&descriptor) {
            debug!("Found package root at {:?}", dir);
            return Ok(dir);
        }
        for entry in runtime.read_dir(&dir)? {
            if runtime.is_dir(&entry) {
                queue.push_back(entry);
            }
        }
    }

    Err(PackageError::Corruption(format!(
        "Archive does not contain a {}",
        DESCRIPTOR_FILE_NAME
    ))
    .into())
}
