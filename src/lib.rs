//! Vectorize Worker Library
//!
//! Keeps an interactive front end responsive while raster images are traced
//! into SVG by a slow, blocking vectorizer. Submissions are keyed by output
//! path; a newer submission for the same output supersedes the older one,
//! and only the latest result for each output is ever delivered.
//!
//! ## Module Overview
//!
//! - `orchestrator`: the submit / cancel / subscribe facade
//! - `queue`: one pending job per output path plus the generation table
//! - `pool`: bounded worker tasks running the vectorizer off the async threads
//! - `sink`: ordered, at-most-once result delivery to observers
//! - `converter`: the `Vectorizer` trait and the vtracer backends
//! - `job`: job, options and result models
//! - `command`: JSON command protocol used by the binary
//! - `config`: environment configuration
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vectorize_worker::{
//!     converter::VtracerLib,
//!     job::{ConversionOptions, ConversionResult},
//!     orchestrator::Orchestrator,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = Orchestrator::start(2, Arc::new(VtracerLib));
//!     let mut results = orchestrator.subscribe_channel("cat.svg");
//!
//!     orchestrator
//!         .submit("cat.svg", "cat.png", ConversionOptions::default())
//!         .expect("valid submission");
//!
//!     if let Some(delivery) = results.recv().await {
//!         if let ConversionResult::Success { svg_bytes } = delivery.result {
//!             std::fs::write(&delivery.output_path, svg_bytes).unwrap();
//!         }
//!     }
//!
//!     orchestrator.shutdown().await;
//! }
//! ```

pub mod command;
pub mod config;
pub mod converter;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod sink;
pub mod telemetry;
