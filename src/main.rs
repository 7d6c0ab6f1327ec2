//! Vectorize Worker Service
//!
//! Reads conversion commands as JSON lines on stdin, traces each source image
//! into SVG with vtracer on a bounded worker pool, and writes the result next
//! to the requested output path.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `WORKER_CONCURRENCY`: Number of concurrent conversions (default: CPU count)
//! - `VTRACER_BIN`: use this vtracer executable instead of the built-in library
//! - `LOG_FORMAT`: `json` for JSON log lines
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vectorize_worker::command::Command;
use vectorize_worker::config::WorkerConfig;
use vectorize_worker::converter::{Vectorizer, VtracerCli, VtracerLib};
use vectorize_worker::job::{ConversionResult, Delivery};
use vectorize_worker::orchestrator::Orchestrator;
use vectorize_worker::telemetry;

/// Latest generation submitted per output that has not been answered yet.
#[derive(Debug, Default)]
struct Outstanding {
    latest: HashMap<PathBuf, u64>,
}

impl Outstanding {
    fn track(&mut self, output: PathBuf, generation: u64) {
        self.latest.insert(output, generation);
    }

    fn contains(&self, output: &Path) -> bool {
        self.latest.contains_key(output)
    }

    /// Returns `true` when `generation` answers the latest submission for
    /// `output`, which then stops being outstanding.
    fn settle(&mut self, output: &Path, generation: u64) -> bool {
        if self
            .latest
            .get(output)
            .is_some_and(|latest| *latest <= generation)
        {
            self.latest.remove(output);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.latest.len()
    }

    fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().context("Failed to load configuration")?;

    init_logging(config.json_logs);

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting vectorize worker service");
    let vectorizer: Arc<dyn Vectorizer> = match &config.vtracer_bin {
        Some(bin) => {
            info!(
                "Configuration: concurrency={}, backend=cli ({})",
                config.concurrency,
                bin.display()
            );
            Arc::new(VtracerCli::new(bin.clone()))
        }
        None => {
            info!(
                "Configuration: concurrency={}, backend=library",
                config.concurrency
            );
            Arc::new(VtracerLib)
        }
    };
    let orchestrator = Orchestrator::start(config.concurrency, vectorizer);

    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<Delivery>();
    let mut outstanding = Outstanding::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    info!("Worker service ready, reading commands from stdin");

    while input_open || !outstanding.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => handle_line(&line, &orchestrator, &results_tx, &mut outstanding),
                Ok(None) => {
                    info!("Input closed, waiting for {} outstanding jobs", outstanding.len());
                    input_open = false;
                }
                Err(e) => {
                    error!("Failed to read command: {}", e);
                    input_open = false;
                }
            },
            Some(delivery) = results_rx.recv() => {
                handle_delivery(delivery, &orchestrator, &mut outstanding).await;
            }
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Shutting down, waiting for running conversions to finish...");
    orchestrator.shutdown().await;

    // shutdown reports queued jobs as cancelled
    while let Ok(delivery) = results_rx.try_recv() {
        handle_delivery(delivery, &orchestrator, &mut outstanding).await;
    }

    telemetry::shutdown_telemetry();
    info!("Worker service shutdown complete");
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    // logs go to stderr
    let (json_layer, text_layer) = if json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

fn handle_line(
    line: &str,
    orchestrator: &Orchestrator,
    results: &mpsc::UnboundedSender<Delivery>,
    outstanding: &mut Outstanding,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring malformed command: {}", e);
            return;
        }
    };

    let output = command.output_path();
    match command {
        Command::Submit {
            source, options, ..
        } => {
            let results = results.clone();
            orchestrator.subscribe(output.clone(), move |delivery| {
                let _ = results.send(delivery);
            });

            match orchestrator.submit(output.clone(), source, options) {
                Ok(generation) => outstanding.track(output, generation),
                Err(e) => {
                    warn!("Rejected submission for {}: {}", output.display(), e);
                    if !outstanding.contains(&output) {
                        orchestrator.unsubscribe(&output);
                    }
                }
            }
        }
        Command::Cancel { .. } => {
            if !orchestrator.cancel(&output) {
                info!("Nothing to cancel for {}", output.display());
            }
        }
    }
}

async fn handle_delivery(
    delivery: Delivery,
    orchestrator: &Orchestrator,
    outstanding: &mut Outstanding,
) {
    let Delivery {
        output_path,
        generation,
        result,
    } = delivery;

    if outstanding.settle(&output_path, generation) {
        orchestrator.unsubscribe(&output_path);
    }

    match result {
        ConversionResult::Success { svg_bytes } => {
            match tokio::fs::write(&output_path, &svg_bytes).await {
                Ok(()) => info!(
                    "SVG saved: output={}, generation={}, bytes={}",
                    output_path.display(),
                    generation,
                    svg_bytes.len()
                ),
                Err(e) => error!("Failed to write {}: {}", output_path.display(), e),
            }
        }
        ConversionResult::Failure { reason } => {
            error!(
                "Conversion failed: output={}, generation={}, error={}",
                output_path.display(),
                generation,
                reason
            );
        }
        ConversionResult::Cancelled => {
            info!(
                "Conversion cancelled: output={}, generation={}",
                output_path.display(),
                generation
            );
        }
    }
}
