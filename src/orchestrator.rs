//! Conversion orchestrator: the handle the presentation layer talks to.
//!
//! Owns the [`JobQueue`], [`WorkerPool`] and [`ResultSink`]. Create one per
//! application and pass it (or an `Arc` of it) to whatever needs to submit,
//! cancel or observe conversions.

use crate::converter::{self, Vectorizer};
use crate::error::SubmitError;
use crate::job::{ConversionJob, ConversionOptions, ConversionResult, Delivery};
use crate::pool::WorkerPool;
use crate::queue::JobQueue;
use crate::sink::ResultSink;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct Orchestrator {
    queue: Arc<JobQueue>,
    sink: Arc<ResultSink>,
    pool: WorkerPool,
}

impl Orchestrator {
    /// Starts `concurrency` workers (at least one) around `vectorizer`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(concurrency: usize, vectorizer: Arc<dyn Vectorizer>) -> Self {
        let queue = Arc::new(JobQueue::new());
        let sink = Arc::new(ResultSink::new(queue.clone()));
        let pool = WorkerPool::start(concurrency, queue.clone(), sink.clone(), vectorizer);

        Self { queue, sink, pool }
    }

    /// Queues a conversion of `source_path` into `output_path`.
    ///
    /// # Arguments
    ///
    /// * `output_path` - SVG destination; also the key for supersession
    /// * `source_path` - Raster image to trace
    /// * `options` - Tracing parameters
    ///
    /// # Returns
    ///
    /// The generation assigned to this submission. Any earlier
    /// submission for the same output is superseded: if it is still waiting
    /// it is dropped, and if it is already running its result is discarded
    /// when it finishes. The superseded conversion keeps its CPU until the
    /// vectorizer returns.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::OptionOutOfRange`],
    /// [`SubmitError::UnsupportedFormat`] or [`SubmitError::SourceUnreadable`]
    /// without touching the queue, and [`SubmitError::ShutDown`] once
    /// shutdown has started
    pub fn submit(
        &self,
        output_path: impl Into<PathBuf>,
        source_path: impl Into<PathBuf>,
        options: ConversionOptions,
    ) -> Result<u64, SubmitError> {
        let output_path = output_path.into();
        let source_path = source_path.into();

        options.validate()?;
        if converter::source_format(&source_path).is_none() {
            return Err(SubmitError::UnsupportedFormat(source_path));
        }
        if !is_readable_file(&source_path) {
            return Err(SubmitError::SourceUnreadable(source_path));
        }

        let job = ConversionJob::new(source_path, output_path, options);
        let job_id = job.job_id.clone();
        let output = job.output_path.display().to_string();
        let generation = self.queue.submit(job)?;

        info!(
            "Submitted job: job_id={}, output={}, generation={}",
            job_id, output, generation
        );
        Ok(generation)
    }

    /// Stops caring about the outstanding conversion for `output_path`.
    ///
    /// The observer receives [`ConversionResult::Cancelled`] for it. A
    /// conversion that is already running is not interrupted; its result is
    /// discarded. Returns `false` if nothing was outstanding.
    pub fn cancel(&self, output_path: impl AsRef<Path>) -> bool {
        let output_path = output_path.as_ref();
        match self.sink.cancel(output_path) {
            Some(generation) => {
                info!(
                    "Cancelled job: output={}, generation={}",
                    output_path.display(),
                    generation
                );
                true
            }
            None => false,
        }
    }

    /// Registers `observer` for results of `output_path`, replacing any
    /// previous observer for that path.
    ///
    /// Observers run on the dispatcher task, one delivery at a time.
    pub fn subscribe<F>(&self, output_path: impl Into<PathBuf>, observer: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.sink.subscribe(output_path, Arc::new(observer));
    }

    /// Like [`subscribe`](Self::subscribe), delivering into a channel.
    pub fn subscribe_channel(
        &self,
        output_path: impl Into<PathBuf>,
    ) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(output_path, move |delivery| {
            let _ = tx.send(delivery);
        });
        rx
    }

    pub fn unsubscribe(&self, output_path: impl AsRef<Path>) -> bool {
        self.sink.unsubscribe(output_path.as_ref())
    }

    /// Number of jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.queue.pending_len()
    }

    pub fn concurrency(&self) -> usize {
        self.pool.concurrency()
    }

    /// Shuts the orchestrator down.
    ///
    /// No job is claimed after this starts; jobs still waiting are reported
    /// as cancelled. Returns once every running conversion has finished and
    /// every accepted result has reached its observer. Idempotent.
    pub async fn shutdown(&self) {
        let abandoned = self.queue.close();
        if !abandoned.is_empty() {
            debug!("Cancelling {} queued jobs", abandoned.len());
        }
        for job in abandoned {
            self.sink
                .deliver(job.output_path, job.generation, ConversionResult::Cancelled);
        }

        self.pool.shutdown().await;
        self.sink.close().await;
        info!("Orchestrator shutdown complete");
    }
}

/// Opens `path` to prove the current process can read it.
fn is_readable_file(path: &Path) -> bool {
    File::open(path)
        .and_then(|file| file.metadata())
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}
