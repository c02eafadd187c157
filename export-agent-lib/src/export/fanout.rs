//! Concurrent fan-out of one parent stream into dependent stages.
//!
//! A [`FanOut`] has one producer and any number of stages. The producer pages the
//! parent collection and publishes each page to every stage through its own bounded
//! channel, so each stage observes the whole parent stream. Stages run as separate
//! tasks and report errors into a shared [`ErrorSink`] where the first error wins.
//!
//! After the first error:
//!
//! - further publishes fail, so the producer stops paging,
//! - every stage's next read discards whatever is still buffered and ends its input,
//! - calls already in flight are allowed to finish.
//!
//! [`FanOut::run`] returns only after the producer and every stage have finished.

use crate::Result;
use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};
use ohno::{AppError, app_err, bail};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "    fanout";

/// Pages flow through the pipeline shared, not copied.
pub type Page<P> = Arc<[P]>;

/// Collects the first error reported by any part of a pipeline.
#[derive(Debug)]
pub struct ErrorSink {
    pipeline: String,
    failed: AtomicBool,
    first: Mutex<Option<AppError>>,
}

impl ErrorSink {
    fn new(pipeline: String) -> Self {
        Self {
            pipeline,
            failed: AtomicBool::new(false),
            first: Mutex::new(None),
        }
    }

    /// Record an error. Only the first one is kept.
    ///
    /// Returns `true` for the first error. Later ones are usually fallout from the
    /// drain and are only logged at debug level.
    pub fn report(&self, stage: &str, error: AppError) -> bool {
        let mut first = self.first.lock().expect("lock not poisoned");
        let is_first = !self.failed.swap(true, Ordering::AcqRel);
        if is_first {
            log::error!(target: LOG_TARGET, "Failed {} in stage '{stage}': {error:#}", self.pipeline);
            *first = Some(error);
        } else {
            log::debug!(target: LOG_TARGET, "Also failed {} in stage '{stage}': {error:#}", self.pipeline);
        }
        is_first
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<AppError> {
        self.first.lock().expect("lock not poisoned").take()
    }
}

/// Producer side of a pipeline.
#[derive(Debug)]
pub struct Publisher<P> {
    outputs: Vec<mpsc::Sender<Page<P>>>,
    sink: Arc<ErrorSink>,
}

impl<P> Publisher<P> {
    /// Send one page to every stage.
    ///
    /// Fails once the pipeline has failed, so the producer stops fetching.
    pub async fn publish(&self, items: Vec<P>) -> Result<()> {
        if self.sink.is_failed() {
            bail!("pipeline aborted after an earlier error");
        }

        let page: Page<P> = items.into();
        for output in &self.outputs {
            // A closed receiver belongs to a stage that already ended; skip it.
            let _ = output.send(Arc::clone(&page)).await;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.sink.is_failed()
    }
}

/// Input side of one stage.
#[derive(Debug)]
pub struct StageInput<P> {
    input: mpsc::Receiver<Page<P>>,
    sink: Arc<ErrorSink>,
}

impl<P> StageInput<P> {
    /// Next page, or `None` when the producer finished or the pipeline failed.
    pub async fn next(&mut self) -> Option<Page<P>> {
        let page = self.input.recv().await?;
        if self.sink.is_failed() {
            self.drain();
            return None;
        }
        Some(page)
    }

    /// Whether another part of the pipeline has failed.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.sink.is_failed()
    }

    /// Stop accepting pages and drop everything already buffered.
    fn drain(&mut self) {
        self.input.close();
        let mut dropped = 0_usize;
        while self.input.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!(target: LOG_TARGET, "Discarded {dropped} buffered page(s) after failure");
        }
    }
}

/// Thread-safe collector for results a stage hands back to the caller.
#[derive(Debug)]
pub struct SideOutput<M> {
    items: Arc<Mutex<Vec<M>>>,
}

impl<M> Clone for SideOutput<M> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<M> SideOutput<M> {
    fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: M) {
        self.items.lock().expect("lock not poisoned").push(item);
    }

    fn take(&self) -> Vec<M> {
        core::mem::take(&mut *self.items.lock().expect("lock not poisoned"))
    }
}

/// What a completed pipeline hands back.
#[derive(Debug)]
pub struct FanOutResult<M> {
    /// The first error reported by the producer or any stage.
    pub error: Option<AppError>,

    /// Everything stages pushed to the side output, including before a failure.
    pub side: Vec<M>,
}

impl<M> FanOutResult<M> {
    pub fn into_result(self) -> Result<Vec<M>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.side),
        }
    }
}

/// One producer fanned out to named stages.
#[derive(Debug)]
pub struct FanOut<P, M = ()> {
    buffer: usize,
    sink: Arc<ErrorSink>,
    side: SideOutput<M>,
    outputs: Vec<mpsc::Sender<Page<P>>>,
    stages: Vec<(String, JoinHandle<()>)>,
}

impl<P, M> FanOut<P, M>
where
    P: Send + Sync + 'static,
    M: Send + 'static,
{
    /// `buffer` is the number of pages each stage may have queued.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            sink: Arc::new(ErrorSink::new(pipeline.into())),
            side: SideOutput::new(),
            outputs: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Handle stages use to hand results back to the caller.
    #[must_use]
    pub fn side_output(&self) -> SideOutput<M> {
        self.side.clone()
    }

    /// Start a stage. It begins receiving pages once the producer publishes.
    pub fn stage<F, Fut>(&mut self, name: &str, stage: F)
    where
        F: FnOnce(StageInput<P>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.outputs.push(tx);

        let sink = Arc::clone(&self.sink);
        let input = StageInput {
            input: rx,
            sink: Arc::clone(&sink),
        };
        let future = stage(input);
        let stage_name = name.to_string();

        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                let _ = sink.report(&stage_name, e);
            }
        });

        self.stages.push((name.to_string(), handle));
    }

    /// Run `producer` to completion, then wait for every stage.
    pub async fn run<F, Fut>(self, producer: F) -> FanOutResult<M>
    where
        F: FnOnce(Publisher<P>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let publisher = Publisher {
            outputs: self.outputs,
            sink: Arc::clone(&self.sink),
        };

        // The publisher is dropped when the producer finishes, which closes every
        // stage's input.
        if let Err(e) = producer(publisher).await {
            let _ = self.sink.report("producer", e);
        }

        for (name, handle) in self.stages {
            if let Err(e) = handle.await {
                let _ = self.sink.report(&name, app_err!("stage '{name}' did not complete: {e}"));
            }
        }

        FanOutResult {
            error: self.sink.take(),
            side: self.side.take(),
        }
    }
}
