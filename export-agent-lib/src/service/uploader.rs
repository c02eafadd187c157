//! Delivery of a finished export to the backend.

use crate::Result;
use camino::Utf8Path;
use core::time::Duration;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::future::BoxFuture;
use layered::{Execute, Service, Stack};
use ohno::{IntoAppError, app_err};
use reqwest::StatusCode;
use seatbelt::retry::{Backoff, Retry};
use seatbelt::timeout::Timeout;
use seatbelt::{RecoveryInfo, ResilienceContext};
use tick::Clock;

const LOG_TARGET: &str = "  uploader";

/// Retries on top of the first attempt.
const MAX_UPLOAD_RETRIES: u32 = 3;

const UPLOAD_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Per attempt; an export archive can be large.
const UPLOAD_TIMEOUT: Duration = Duration::from_mins(10);

/// Sends the contents of an export directory somewhere.
pub trait Uploader: Send + Sync {
    fn upload<'a>(&'a self, dir: &'a Utf8Path, url: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Uploads a directory as one `tar.gz` archive with an HTTP `PUT`.
///
/// Network errors, server errors and 429 responses are retried with exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    max_retries: u32,
    base_delay: Duration,
}

impl Default for HttpUploader {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpUploader {
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            max_retries: MAX_UPLOAD_RETRIES,
            base_delay: UPLOAD_RETRY_BASE_DELAY,
        }
    }

    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    async fn put(&self, url: &str, archive: Vec<u8>) -> Result<()> {
        let clock = Clock::new_tokio();
        let context = ResilienceContext::new(&clock).name("upload");

        let client = self.client.clone();
        let service = (
            Retry::layer("retry", &context)
                .clone_input()
                .recovery_with(|result: &Result<reqwest::Response>, _| upload_recovery(result))
                .max_retry_attempts(self.max_retries)
                .base_delay(self.base_delay)
                .backoff(Backoff::Exponential)
                .on_retry(|_output, args| {
                    log::debug!(
                        target: LOG_TARGET,
                        "Retrying upload (attempt {}, delay {}ms)",
                        args.attempt().index() + 1,
                        args.retry_delay().as_millis(),
                    );
                }),
            Timeout::layer("timeout", &context)
                .timeout_error(|_| app_err!("upload timed out after {UPLOAD_TIMEOUT:?}"))
                .timeout(UPLOAD_TIMEOUT),
            Execute::new(move |(url, archive): (String, Vec<u8>)| {
                let client = client.clone();
                async move {
                    client
                        .put(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                        .body(archive)
                        .send()
                        .await
                        .map_err(ohno::AppError::from)
                }
            }),
        )
            .into_service();

        let response = service.execute((url.to_string(), archive)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(app_err!("upload rejected with status {status}: {body}"))
    }
}

/// Network errors, 5xx and 429 are worth another attempt. A 429 `Retry-After` is honored.
fn upload_recovery(result: &Result<reqwest::Response>) -> RecoveryInfo {
    match result {
        Err(_) => RecoveryInfo::retry(),
        Ok(resp) if resp.status().is_server_error() => RecoveryInfo::retry(),
        Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => retry_after(resp.headers())
            .map_or_else(RecoveryInfo::retry, |delay| RecoveryInfo::retry().delay(delay)),
        Ok(_) => RecoveryInfo::never(),
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let secs = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

impl Uploader for HttpUploader {
    fn upload<'a>(&'a self, dir: &'a Utf8Path, url: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let source = dir.to_path_buf();
            let archive = tokio::task::spawn_blocking(move || archive_dir(&source))
                .await
                .into_app_err("archive task panicked")??;

            log::info!(target: LOG_TARGET, "Uploading {} bytes from '{dir}'", archive.len());
            self.put(url, archive).await
        })
    }
}

/// Pack `dir` into an in-memory `tar.gz`, with paths relative to `dir`.
pub fn archive_dir(dir: &Utf8Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", dir)
        .into_app_err_with(|| format!("archiving '{dir}'"))?;
    let encoder = builder.into_inner().into_app_err_with(|| format!("archiving '{dir}'"))?;
    encoder.finish().into_app_err_with(|| format!("compressing '{dir}'"))
}
