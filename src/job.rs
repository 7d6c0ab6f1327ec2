//! Job models and result types for the vectorization queue.

use crate::error::SubmitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

/// A request to vectorize one raster image into one SVG target.
///
/// Jobs are keyed by `output_path`. The queue assigns `generation` on
/// submission; a higher generation for the same output supersedes every
/// lower one.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub job_id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub options: ConversionOptions,
    pub submitted_at: Instant,
    pub generation: u64,
}

impl ConversionJob {
    pub fn new(source_path: PathBuf, output_path: PathBuf, options: ConversionOptions) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            source_path,
            output_path,
            options,
            submitted_at: Instant::now(),
            generation: 0,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.submitted_at.elapsed().as_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Color,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hierarchical {
    #[default]
    Stacked,
    Cutout,
}

/// Curve fitting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveMode {
    #[default]
    Spline,
    Polygon,
    Pixel,
}

/// Tracing parameters forwarded verbatim to the vectorizer.
///
/// The orchestrator only range-checks these; it never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub color_mode: ColorMode,
    pub hierarchical: Hierarchical,
    pub mode: CurveMode,
    /// Discard patches smaller than this many pixels.
    pub filter_speckle: u32,
    /// Significant bits per RGB channel.
    pub color_precision: u32,
    /// Color difference between gradient layers.
    pub layer_difference: u32,
    /// Minimum momentary angle (degrees) to be considered a corner.
    pub corner_threshold: u32,
    /// Subdivide smoothed paths until segments are shorter than this.
    pub length_threshold: f64,
    /// Minimum angle displacement (degrees) to splice a spline.
    pub splice_threshold: u32,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            color_mode: ColorMode::Color,
            hierarchical: Hierarchical::Stacked,
            mode: CurveMode::Spline,
            filter_speckle: 4,
            color_precision: 6,
            layer_difference: 16,
            corner_threshold: 60,
            length_threshold: 4.0,
            splice_threshold: 45,
        }
    }
}

impl ConversionOptions {
    /// Checks every numeric parameter against the range the vectorizer accepts.
    pub fn validate(&self) -> Result<(), SubmitError> {
        check_range("filter_speckle", self.filter_speckle as f64, 0.0, 128.0)?;
        check_range("color_precision", self.color_precision as f64, 1.0, 8.0)?;
        check_range("layer_difference", self.layer_difference as f64, 0.0, 128.0)?;
        check_range("corner_threshold", self.corner_threshold as f64, 0.0, 180.0)?;
        check_range("length_threshold", self.length_threshold, 3.5, 10.0)?;
        check_range("splice_threshold", self.splice_threshold as f64, 0.0, 180.0)?;
        Ok(())
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), SubmitError> {
    // rejects NaN as well
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SubmitError::OptionOutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

/// Outcome of one non-superseded job.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionResult {
    Success { svg_bytes: Vec<u8> },
    Failure { reason: String },
    Cancelled,
}

impl ConversionResult {
    pub fn status(&self) -> JobStatus {
        match self {
            ConversionResult::Success { .. } => JobStatus::Succeeded,
            ConversionResult::Failure { .. } => JobStatus::Failed,
            ConversionResult::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConversionResult::Success { .. })
    }
}

/// Terminal state of a job as recorded by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// Finished after a newer generation replaced it; never delivered.
    Superseded,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Superseded => write!(f, "superseded"),
        }
    }
}

/// A result handed to the observer registered for `output_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub output_path: PathBuf,
    pub generation: u64,
    pub result: ConversionResult,
}
