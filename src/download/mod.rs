//! Archive download with progress reporting, cancellation and checksum verification.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::PackageError;
use crate::http::HttpClient;
use crate::runtime::Runtime;

/// Fractional progress callback, always called with a value in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Fetches a remote archive into a local file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` to `dest`, returning the number of bytes written.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

/// Downloader backed by [`HttpClient`], writing through the [`Runtime`].
pub struct HttpDownloader<R: Runtime> {
    runtime: Arc<R>,
    http_client: HttpClient,
}

impl<R: Runtime> HttpDownloader<R> {
    pub fn new(runtime: Arc<R>, http_client: HttpClient) -> Self {
        Self {
            runtime,
            http_client,
        }
    }
}

#[async_trait]
impl<R: Runtime + 'static> Downloader for HttpDownloader<R> {
    #[tracing::instrument(skip(self, dest, on_progress, cancel))]
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        info!("Downloading {}...", url);

        let runtime = &self.runtime;
        let dest_path = dest.to_path_buf();
        let progress = on_progress.clone();

        let bytes = self
            .http_client
            .download_file(
                url,
                || {
                    runtime
                        .create_file(&dest_path)
                        .with_context(|| format!("Failed to create download file at {:?}", dest_path))
                },
                move |done, total| {
                    if let Some(total) = total.filter(|t| *t > 0) {
                        progress((done as f64 / total as f64).min(1.0) as f32);
                    }
                },
                cancel,
            )
            .await?;

        on_progress(1.0);
        info!("Download complete.");
        Ok(bytes)
    }
}

/// Compare the SHA-256 of the file at `path` with `expected` (hex, any case).
///
/// A mismatch is reported as [`PackageError::Corruption`].
#[tracing::instrument(skip(runtime))]
pub fn verify_checksum<R: Runtime>(runtime: &R, path: &Path, expected: &str) -> Result<()> {
    let mut file = runtime
        .open(path)
        .with_context(|| format!("Failed to open {:?} for checksum", path))?;
    let mut hasher = Sha256::new();
    let bytes_read = std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {:?} for checksum", path))?;
    let actual = hex::encode(hasher.finalize());

    debug!("Calculated SHA256: {} ({} bytes read)", actual, bytes_read);
    debug!("Expected SHA256:   {}", expected);

    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(PackageError::Corruption(format!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        ))
        .into())
    }
}
