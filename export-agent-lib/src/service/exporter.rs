//! The export queue.
//!
//! Every export goes through one [`Exporter`]. Requests are queued on a channel and a
//! single worker runs them one at a time, so no two exports ever write to the uploads
//! directory together. Each caller waits for its own job and gets its outcome.

use super::messages::{ExportRequest, IntegrationOutcome};
use super::uploader::Uploader;
use crate::Result;
use camino::{Utf8Path, Utf8PathBuf};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use futures::future::BoxFuture;
use ohno::{IntoAppError, bail};
use std::fs;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const LOG_TARGET: &str = "  exporter";

/// Produces the data of one export into the uploads directory.
pub trait ExportPipeline: Send + Sync {
    fn run<'a>(&'a self, request: &'a ExportRequest) -> BoxFuture<'a, Result<Vec<IntegrationOutcome>>>;
}

type Job = (ExportRequest, oneshot::Sender<Result<Vec<IntegrationOutcome>>>);

/// Runs queued exports one at a time.
#[derive(Clone)]
pub struct Exporter {
    queue: mpsc::UnboundedSender<Job>,
    running: Arc<AtomicBool>,
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter").field("running", &self.is_running()).finish_non_exhaustive()
    }
}

impl Exporter {
    /// Start the worker. It stops once every handle is dropped.
    #[must_use]
    pub fn start(pipeline: Arc<dyn ExportPipeline>, uploader: Arc<dyn Uploader>, uploads_dir: impl Into<Utf8PathBuf>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            pipeline,
            uploader,
            uploads_dir: uploads_dir.into(),
            running: Arc::clone(&running),
        };
        let _ = tokio::spawn(worker.run(rx));

        Self { queue, running }
    }

    /// Queue `request` and wait for it to finish.
    ///
    /// Succeeds only if the export and its upload both succeeded.
    pub async fn export(&self, request: ExportRequest) -> Result<Vec<IntegrationOutcome>> {
        let (done, wait) = oneshot::channel();
        if self.queue.send((request, done)).is_err() {
            bail!("export queue is closed");
        }

        match wait.await {
            Ok(result) => result,
            Err(_) => bail!("export worker stopped before the job finished"),
        }
    }

    /// Whether an export is executing right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

struct Worker {
    pipeline: Arc<dyn ExportPipeline>,
    uploader: Arc<dyn Uploader>,
    uploads_dir: Utf8PathBuf,
    running: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some((request, done)) = rx.recv().await {
            self.running.store(true, Ordering::Release);
            log::info!(target: LOG_TARGET, "Starting export job '{}'", request.job_id);

            let result = self.execute(&request).await;
            match &result {
                Ok(_) => log::info!(target: LOG_TARGET, "Export job '{}' finished", request.job_id),
                Err(e) => log::error!(target: LOG_TARGET, "Export job '{}' failed: {e:#}", request.job_id),
            }

            self.running.store(false, Ordering::Release);
            if done.send(result).is_err() {
                log::debug!(target: LOG_TARGET, "Nobody waited for export job '{}'", request.job_id);
            }
        }
    }

    async fn execute(&self, request: &ExportRequest) -> Result<Vec<IntegrationOutcome>> {
        purge(&self.uploads_dir)?;

        let outcomes = self.pipeline.run(request).await?;

        match &request.upload_url {
            Some(url) => self.uploader.upload(&self.uploads_dir, url).await?,
            None => log::info!(target: LOG_TARGET, "No upload target for job '{}', leaving export in '{}'", request.job_id, self.uploads_dir),
        }

        Ok(outcomes)
    }
}

/// Empty `dir` of anything a previous export left behind.
fn purge(dir: &Utf8Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).into_app_err_with(|| format!("purging '{dir}'")),
    }
    fs::create_dir_all(dir).into_app_err_with(|| format!("creating '{dir}'"))
}
