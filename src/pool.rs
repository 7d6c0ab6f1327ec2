//! Bounded pool of conversion workers.
//!
//! Each worker is a Tokio task that claims one job at a time from the
//! [`JobQueue`] and runs the vectorizer on the blocking thread pool, so the
//! number of concurrent external calls never exceeds the number of workers.
//!
//! Cancellation is result suppression only: once a conversion has started it
//! runs to completion and keeps its CPU until then. When it returns, the
//! worker checks the job's generation and silently discards the result if a
//! newer submission or a cancel made it stale.

use crate::converter::Vectorizer;
use crate::job::{ConversionJob, ConversionResult, JobStatus};
use crate::queue::JobQueue;
use crate::sink::ResultSink;
use crate::telemetry::{self, JobRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Fixed-size set of worker tasks sharing one queue and one sink.
pub struct WorkerPool {
    concurrency: usize,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `concurrency` worker loops (at least one).
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        concurrency: usize,
        queue: Arc<JobQueue>,
        sink: Arc<ResultSink>,
        vectorizer: Arc<dyn Vectorizer>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let shutdown = CancellationToken::new();

        let handles = (0..concurrency)
            .map(|worker_id| {
                let queue = queue.clone();
                let sink = sink.clone();
                let vectorizer = vectorizer.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    worker_loop(worker_id, queue, sink, vectorizer, shutdown).await
                })
            })
            .collect();

        info!("Worker pool started: concurrency={}", concurrency);

        Self {
            concurrency,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stops claiming new jobs and waits for every worker to exit.
    ///
    /// Conversions already running are not interrupted; this returns once
    /// they have finished and their results were handed to the sink.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

/// Claims and processes jobs until the queue closes or shutdown fires.
async fn worker_loop(
    worker_id: usize,
    queue: Arc<JobQueue>,
    sink: Arc<ResultSink>,
    vectorizer: Arc<dyn Vectorizer>,
    shutdown: CancellationToken,
) {
    info!("Worker {} started", worker_id);

    while let Some(job) = queue.next(&shutdown).await {
        process_job(worker_id, job, &queue, &sink, &vectorizer).await;
        telemetry::record_queue_depth(queue.pending_len());
    }

    info!("Worker {} stopped", worker_id);
}

/// Runs one conversion and reports it unless it went stale meanwhile.
async fn process_job(
    worker_id: usize,
    job: ConversionJob,
    queue: &JobQueue,
    sink: &ResultSink,
    vectorizer: &Arc<dyn Vectorizer>,
) {
    info!(
        "Processing job: job_id={}, output={}, generation={}",
        job.job_id,
        job.output_path.display(),
        job.generation
    );

    let result = {
        let vectorizer = vectorizer.clone();
        let source = job.source_path.clone();
        let options = job.options.clone();
        task::spawn_blocking(move || vectorizer.vectorize(&source, &options)).await
    };

    let result = match result {
        Ok(Ok(svg_bytes)) => ConversionResult::Success { svg_bytes },
        Ok(Err(e)) => ConversionResult::Failure {
            reason: e.to_string(),
        },
        Err(e) => ConversionResult::Failure {
            reason: format!("conversion task aborted: {}", e),
        },
    };

    let stale = queue.is_stale(&job.output_path, job.generation);
    let status = if stale {
        JobStatus::Superseded
    } else {
        result.status()
    };
    let error = match &result {
        ConversionResult::Failure { reason } => Some(reason.clone()),
        _ => None,
    };

    telemetry::record_conversion(&JobRecord {
        job_id: &job.job_id,
        worker_id,
        output_path: &job.output_path,
        generation: job.generation,
        status,
        duration_ms: job.elapsed_ms(),
        error: error.as_deref(),
    });

    if stale {
        debug!(
            "Discarding superseded result: job_id={}, generation={}",
            job.job_id, job.generation
        );
        return;
    }

    // the sink re-checks under its lock; a cancel may still win the race
    sink.deliver(job.output_path, job.generation, result);
}
