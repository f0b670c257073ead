use crate::error::PackageError;
use crate::runtime::Runtime;
use anyhow::{Context, Result};
use log::debug;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

use super::ArchiveExtractor;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";

/// Extractor for zip-compatible package archives
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn can_handle(&self, header: &[u8]) -> bool {
        header.starts_with(ZIP_MAGIC) || header.starts_with(ZIP_EMPTY_MAGIC)
    }

    #[tracing::instrument(skip(self, runtime))]
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
    ) -> Result<usize> {
        debug!("Extracting zip archive to {:?}...", extract_to);
        let mut reader = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;

        // ZipArchive needs Read + Seek; Runtime::open only gives Read
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?;
        let mut archive = ZipArchive::new(std::io::Cursor::new(buffer)).map_err(|e| {
            PackageError::Corruption(format!("Failed to parse ZIP archive {:?}: {}", archive_path, e))
        })?;

        runtime.create_dir_all(extract_to)?;

        let mut files = 0;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| {
                PackageError::Corruption(format!("Failed to read ZIP entry {}: {}", i, e))
            })?;

            let Some(entry_path) = entry.enclosed_name() else {
                debug!("Skipping entry with unsafe path: {}", entry.name());
                continue;
            };
            let full_path = extract_to.join(&entry_path);

            if entry.is_dir() {
                runtime.create_dir_all(&full_path)?;
                continue;
            }

            if let Some(parent) = full_path.parent() {
                runtime.create_dir_all(parent)?;
            }
            let mut dest_file = runtime.create_file(&full_path)?;
            std::io::copy(&mut entry, &mut dest_file)
                .with_context(|| format!("Failed to extract file {:?}", full_path))?;
            files += 1;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode()
                && let Err(e) = runtime.set_permissions(&full_path, mode)
            {
                debug!("Failed to set permissions on {:?}: {}", full_path, e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;
    use zip::CompressionMethod;
    use zip::ZipWriter;
    use zip::write::FileOptions;

    fn create_test_archive(path: &Path, files: &[(&str, &str)]) -> Result<()> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options: FileOptions<()> =
            FileOptions::default().compression_method(CompressionMethod::Deflated);

        for (name, content) in files {
            zip.start_file(*name, options)?;
            zip.write_all(content.as_bytes())?;
        }

        zip.finish()?;
        Ok(())
    }

    #[test]
    fn test_can_handle_zip_magic() {
        assert!(ZipExtractor.can_handle(b"PK\x03\x04rest"));
        assert!(ZipExtractor.can_handle(b"PK\x05\x06"));
        assert!(!ZipExtractor.can_handle(&[0x1f, 0x8b, 0x08, 0x00]));
        assert!(!ZipExtractor.can_handle(b"PK"));
    }

    #[test]
    fn test_extract_keeps_nested_layout() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("test.zip");
        let extract_path = dir.path().join("extracted");

        create_test_archive(
            &archive_path,
            &[
                ("com.example.tool/package.json", "{}"),
                ("com.example.tool/Runtime/a.cs", "class A {}"),
            ],
        )?;

        let files = ZipExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        assert_eq!(files, 2);
        assert_eq!(
            fs::read_to_string(extract_path.join("com.example.tool/Runtime/a.cs"))?,
            "class A {}"
        );
        assert!(extract_path.join("com.example.tool/package.json").exists());
        Ok(())
    }

    #[test]
    fn test_extract_flat_archive() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("test.zip");
        let extract_path = dir.path().join("extracted");

        create_test_archive(&archive_path, &[("package.json", "{}"), ("a.cs", "a")])?;

        ZipExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        assert!(extract_path.join("package.json").exists());
        assert_eq!(fs::read_to_string(extract_path.join("a.cs"))?, "a");
        Ok(())
    }

    #[test]
    fn test_extract_empty_archive() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("test.zip");
        let extract_path = dir.path().join("extracted");

        create_test_archive(&archive_path, &[]).unwrap();

        let err = ZipExtractor
            .extract(&RealRuntime, &archive_path, &extract_path)
            .unwrap_err();
        assert!(matches!(
            PackageError::classify(err),
            PackageError::Corruption(msg) if msg.contains("appears to be empty")
        ));
    }

    #[test]
    fn test_extract_corrupted_archive() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("test.zip");
        let extract_path = dir.path().join("extracted");

        fs::write(&archive_path, "PK\x03\x04 corrupted data").unwrap();

        let err = ZipExtractor
            .extract(&RealRuntime, &archive_path, &extract_path)
            .unwrap_err();
        assert!(matches!(PackageError::classify(err), PackageError::Corruption(_)));
    }

    #[test]
    fn test_extract_archive_with_directory_entries() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("test.zip");
        let extract_path = dir.path().join("extracted");

        {
            let file = File::create(&archive_path)?;
            let mut zip = ZipWriter::new(file);
            let options: FileOptions<()> =
                FileOptions::default().compression_method(CompressionMethod::Stored);
            zip.add_directory("pkg/Editor/", options)?;

            let file_options: FileOptions<()> =
                FileOptions::default().compression_method(CompressionMethod::Deflated);
            zip.start_file("pkg/Editor/tool.cs", file_options)?;
            zip.write_all(b"nested file")?;

            zip.finish()?;
        }

        ZipExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        assert!(extract_path.join("pkg/Editor").is_dir());
        assert_eq!(
            fs::read_to_string(extract_path.join("pkg/Editor/tool.cs"))?,
            "nested file"
        );
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_archive_preserves_file_permissions() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let archive_path = dir.path().join("test.zip");
        let extract_path = dir.path().join("extracted");

        {
            let file = File::create(&archive_path)?;
            let mut zip = ZipWriter::new(file);
            let options: FileOptions<()> = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o755);
            zip.start_file("pkg/tool.sh", options)?;
            zip.write_all(b"#!/bin/sh\necho hello")?;
            zip.finish()?;
        }

        ZipExtractor.extract(&RealRuntime, &archive_path, &extract_path)?;

        let mode = fs::metadata(extract_path.join("pkg/tool.sh"))?
            .permissions()
            .mode();
        assert!(mode & 0o111 != 0, "expected executable, mode was {:o}", mode);
        Ok(())
    }

    #[test]
    fn test_extract_nonexistent_archive() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("nonexistent.zip");
        let extract_path = dir.path().join("extracted");

        let result = ZipExtractor.extract(&RealRuntime, &archive_path, &extract_path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to open archive")
        );
    }
}
