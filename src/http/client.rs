//! HTTP client with built-in retry logic, progress reporting and cancellation.

use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::Client;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::retry::{MAX_RETRIES, NonRetryableError, backoff_delay, check_retryable};
use crate::error::PackageError;

/// Build the shared reqwest client used for descriptor fetches and downloads.
pub fn build_http_client(user_agent: &str) -> Result<HttpClient> {
    let client = Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;
    Ok(HttpClient::new(client))
}

/// HTTP client with built-in retry logic for network operations.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    retry_scale: u32,
}

impl HttpClient {
    /// Creates a new HTTP client wrapping the given reqwest Client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry_scale: 1,
        }
    }

    /// Disable the backoff sleeps between attempts (the attempt count is unchanged).
    pub fn without_retry_delay(mut self) -> Self {
        self.retry_scale = 0;
        self
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Performs a GET request and returns the whole body.
    /// Automatically retries on transient errors.
    #[tracing::instrument(skip(self))]
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {}...", url);

        self.with_retry("GET", || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .context("Failed to send request")?;

            let response = response.error_for_status().map_err(check_retryable)?;

            let body = response
                .bytes()
                .await
                .context("Failed to read response body")?;

            Ok(body.to_vec())
        })
        .await
    }

    /// Downloads `url` into writers produced by `create_writer`, one per attempt.
    ///
    /// `on_progress` receives the bytes written so far and the total size when
    /// the server announced one. Cancelling `cancel` aborts the transfer with
    /// [`PackageError::Cancelled`] and is never retried.
    #[tracing::instrument(skip(self, create_writer, on_progress, cancel))]
    pub async fn download_file<W, F, P>(
        &self,
        url: &str,
        create_writer: F,
        mut on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
        P: FnMut(u64, Option<u64>),
    {
        debug!("Downloading file from {}...", url);

        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self
                .download_file_once(url, &create_writer, &mut on_progress, cancel)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    if !is_retryable_error(&e) {
                        return Err(e);
                    }

                    if attempt < MAX_RETRIES {
                        let delay = self.delay_after(attempt);
                        warn!(
                            "Download attempt {}/{} failed ({}), retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Download failed after {} attempts", MAX_RETRIES)))
    }

    async fn download_file_once<W, F, P>(
        &self,
        url: &str,
        create_writer: &F,
        on_progress: &mut P,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
        P: FnMut(u64, Option<u64>),
    {
        if cancel.is_cancelled() {
            return Err(PackageError::Cancelled.into());
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download request")?;

        let mut response = response.error_for_status().map_err(check_retryable)?;
        let total = response.content_length();

        // Local write failures are final, the server is not at fault
        let mut writer =
            create_writer().map_err(|e| PackageError::FileSystem(format!("{:#}", e)))?;
        let mut downloaded_bytes: u64 = 0;
        on_progress(0, total);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PackageError::Cancelled.into());
                }
                chunk = response.chunk() => {
                    chunk.context("Failed to read chunk from download stream")?
                }
            };

            let Some(chunk) = chunk else {
                break;
            };

            writer.write_all(&chunk).map_err(|e| {
                PackageError::FileSystem(format!("Failed to write chunk to file: {}", e))
            })?;
            downloaded_bytes += chunk.len() as u64;
            on_progress(downloaded_bytes, total);
        }
        writer
            .flush()
            .map_err(|e| PackageError::FileSystem(format!("Failed to flush downloaded file: {}", e)))?;

        debug!(
            "Downloaded {:.2} MB",
            downloaded_bytes as f64 / (1024.0 * 1024.0)
        );

        Ok(downloaded_bytes)
    }

    /// Executes an async operation with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !is_retryable_error(&e) {
                        debug!("{}: non-retryable error: {}", operation_name, e);
                        return Err(e);
                    }

                    if attempt < MAX_RETRIES {
                        let delay = self.delay_after(attempt);
                        warn!(
                            "{}: attempt {}/{} failed ({}), retrying in {}ms...",
                            operation_name,
                            attempt,
                            MAX_RETRIES,
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("{}: failed after {} attempts", operation_name, MAX_RETRIES)
        }))
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        backoff_delay(attempt) * self.retry_scale
    }
}

/// Client errors and already classified failures (cancellation, local
/// writes) are final; everything else may be transient.
fn is_retryable_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<NonRetryableError>().is_none() && e.downcast_ref::<PackageError>().is_none()
}
