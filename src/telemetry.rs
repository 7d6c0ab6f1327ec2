//! Telemetry and structured logging for the vectorize worker.

use crate::job::JobStatus;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use std::path::Path;
use tracing::{info, warn};

const TRACER_NAME: &str = "vectorize-worker";

/// Conversions slower than this are logged as warnings.
const SLOW_CONVERSION_MS: u128 = 5000;

/// What a worker knows about a job once its conversion returned.
#[derive(Debug, Clone, Copy)]
pub struct JobRecord<'a> {
    pub job_id: &'a str,
    pub worker_id: usize,
    pub output_path: &'a Path,
    pub generation: u64,
    pub status: JobStatus,
    /// Time from submission to completion.
    pub duration_ms: u128,
    pub error: Option<&'a str>,
}

/// Records telemetry for a finished conversion.
///
/// Emits a structured log line and an OpenTelemetry span with the job's
/// outcome, duration and, for failures, the error message. Superseded jobs
/// are recorded too so wasted conversion time stays visible.
///
/// # Arguments
///
/// * `record` - Outcome of one conversion as seen by the worker
pub fn record_conversion(record: &JobRecord<'_>) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");
    let duration_ms = i64::try_from(record.duration_ms).unwrap_or(i64::MAX);

    span.set_attribute(KeyValue::new("job_id", record.job_id.to_string()));
    span.set_attribute(KeyValue::new("worker_id", record.worker_id as i64));
    span.set_attribute(KeyValue::new(
        "output_path",
        record.output_path.display().to_string(),
    ));
    span.set_attribute(KeyValue::new("generation", record.generation as i64));
    span.set_attribute(KeyValue::new("status", record.status.to_string()));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));

    info!(
        job_id = %record.job_id,
        worker_id = record.worker_id,
        output_path = %record.output_path.display(),
        generation = record.generation,
        status = %record.status,
        duration_ms = duration_ms,
        "Conversion job finished"
    );

    if record.duration_ms > SLOW_CONVERSION_MS {
        warn!(
            job_id = %record.job_id,
            duration_ms = duration_ms,
            "Conversion exceeded performance threshold ({}ms)",
            SLOW_CONVERSION_MS
        );
    }

    if let Some(error) = record.error {
        span.set_attribute(KeyValue::new("error", error.to_string()));
        warn!(
            job_id = %record.job_id,
            output_path = %record.output_path.display(),
            error = %error,
            "Conversion job failed"
        );
    }

    span.end();
}

/// Records a worker heartbeat with the number of jobs still waiting.
///
/// # Arguments
///
/// * `pending` - Jobs queued but not yet claimed
pub fn record_queue_depth(pending: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", pending as i64));
    span.end();

    info!(queue_length = pending, "Worker heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Call once at startup from inside the Tokio runtime. Reads
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - service name (default: vectorize-worker)
///
/// # Returns
///
/// Result indicating success or failure
///
/// # Errors
///
/// Returns an error if the OTLP exporter pipeline cannot be installed
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans on shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
