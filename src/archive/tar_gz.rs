use crate::error::PackageError;
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::debug;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

use super::ArchiveExtractor;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Extractor for gzip-compressed tar archives
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn can_handle(&self, header: &[u8]) -> bool {
        header.starts_with(GZIP_MAGIC)
    }

    #[tracing::instrument(skip(self, runtime))]
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<usize> {
        debug!("Extracting tar.gz archive to {:?}...", extract_to);
        let reader = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = Archive::new(GzDecoder::new(reader));

        runtime.create_dir_all(extract_to)?;

        let mut files = 0;
        let corrupt = |e: std::io::Error| {
            PackageError::Corruption(format!("Failed to read tar archive {:?}: {}", archive_path, e))
        };
        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let raw_path = entry.path().context("Invalid tar entry path")?.into_owned();

            let Some(entry_path) = enclosed_path(&raw_path) else {
                debug!("Skipping entry with unsafe path: {:?}", raw_path);
                continue;
            };
            let full_path = extract_to.join(&entry_path);

            match entry.header().entry_type() {
                EntryType::Directory => {
                    runtime.create_dir_all(&full_path)?;
                }
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    let mut dest_file = runtime.create_file(&full_path)?;
                    std::io::copy(&mut entry, &mut dest_file)
                        .with_context(|| format!("Failed to extract file {:?}", full_path))?;
                    files += 1;

                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode()
                        && let Err(e) = runtime.set_permissions(&full_path, mode)
                    {
                        debug!("Failed to set permissions on {:?}: {}", full_path, e);
                    }
                }
                other => {
                    debug!("Skipping {:?} entry {:?}", other, raw_path);
                }
            }
        }

        if files == 0 {
            return Err(PackageError::Corruption(format!(
                "Archive {:?} appears to be empty",
                archive_path
            ))
            .into());
        }

        debug!("Extracted {} files from {:?}", files, archive_path);
        Ok(files)
    }
}

/// Relative form of an archive entry path, or `None` if it would escape the target.
fn enclosed_path(path: &Path) -> Option<PathBuf> {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if result.as_os_str().is_empty() {
        None
    } else {
        Some(result)
    }
}
