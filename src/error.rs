//! Error types for submission and conversion.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported synchronously by [`Orchestrator::submit`](crate::orchestrator::Orchestrator::submit).
///
/// Everything that can be detected without running the vectorizer is
/// rejected here; failures of the conversion itself arrive later as
/// [`ConversionResult::Failure`](crate::job::ConversionResult::Failure).
#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    #[error("source image is not a readable file: {}", .0.display())]
    SourceUnreadable(PathBuf),

    #[error("unsupported source image format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("option {name}={value} is outside {min}..={max}")]
    OptionOutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("orchestrator is shutting down")]
    ShutDown,
}

impl SubmitError {
    /// Returns `true` for the `InvalidInput` family (everything but shutdown).
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, SubmitError::ShutDown)
    }
}

/// Failure of the external conversion call.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to launch {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vectorizer exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("failed to decode source image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("tracing failed: {0}")]
    Trace(String),

    #[error("vectorizer produced invalid SVG: {0}")]
    InvalidSvg(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
