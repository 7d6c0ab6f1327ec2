//! Raster to SVG conversion with vtracer.
//!
//! [`VtracerLib`] traces in process and is the default backend.
//! [`VtracerCli`] shells out to a separately installed `vtracer` executable.

use crate::error::ConvertError;
use crate::job::{ColorMode, ConversionOptions, CurveMode, Hierarchical};
use image::ImageFormat;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use visioncortex::{ColorImage, PathSimplifyMode};

/// The external conversion call.
///
/// Implementations block and are CPU-bound; the worker pool only ever calls
/// them from the blocking thread pool. A call cannot be interrupted once
/// started.
#[cfg_attr(test, mockall::automock)]
pub trait Vectorizer: Send + Sync {
    /// Converts the raster image at `source` into SVG bytes.
    ///
    /// # Arguments
    ///
    /// * `source` - Raster image path, already checked to be a supported format
    /// * `options` - Tracing parameters
    ///
    /// # Returns
    ///
    /// The SVG document as UTF-8 bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be read or traced, or if the
    /// produced SVG does not parse
    fn vectorize(&self, source: &Path, options: &ConversionOptions) -> Result<Vec<u8>, ConvertError>;
}

/// Image formats accepted as conversion sources.
const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Bmp,
    ImageFormat::Gif,
    ImageFormat::Tiff,
];

/// Curve fitting iterations per path.
const MAX_ITERATIONS: usize = 10;

/// Detects the source image format from the file extension.
///
/// # Returns
///
/// `None` for unknown extensions and formats vtracer cannot read
pub fn source_format(path: &Path) -> Option<ImageFormat> {
    ImageFormat::from_path(path)
        .ok()
        .filter(|format| SUPPORTED_FORMATS.contains(format))
}

/// Default SVG destination for `source`: same stem, `.svg` extension.
pub fn default_output_path(source: &Path) -> PathBuf {
    source.with_extension("svg")
}

/// Vectorizer running the vtracer library on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct VtracerLib;

impl Vectorizer for VtracerLib {
    fn vectorize(&self, source: &Path, options: &ConversionOptions) -> Result<Vec<u8>, ConvertError> {
        info!("Vectorizing image: source={}", source.display());

        let image = decode(source)?;
        let svg = vtracer::convert(image, trace_config(options)).map_err(ConvertError::Trace)?;
        let svg = svg.to_string().into_bytes();
        validate_svg(&svg)?;

        info!("Vectorization complete: {} bytes", svg.len());
        Ok(svg)
    }
}

/// Decodes `source` into RGBA pixels using the format implied by its extension.
fn decode(source: &Path) -> Result<ColorImage, ConvertError> {
    let format = source_format(source).ok_or_else(|| {
        ConvertError::Trace(format!("unsupported source format: {}", source.display()))
    })?;

    let reader = BufReader::new(File::open(source)?);
    let rgba = image::load(reader, format)?.to_rgba8();
    let (width, height) = rgba.dimensions();

    debug!("Decoded {:?} source: {}x{}", format, width, height);
    Ok(ColorImage {
        pixels: rgba.into_raw(),
        width: width as usize,
        height: height as usize,
    })
}

/// Maps conversion options onto the vtracer library configuration.
pub fn trace_config(options: &ConversionOptions) -> vtracer::Config {
    vtracer::Config {
        color_mode: match options.color_mode {
            ColorMode::Color => vtracer::ColorMode::Color,
            ColorMode::Binary => vtracer::ColorMode::Binary,
        },
        hierarchical: match options.hierarchical {
            Hierarchical::Stacked => vtracer::Hierarchical::Stacked,
            Hierarchical::Cutout => vtracer::Hierarchical::Cutout,
        },
        mode: match options.mode {
            CurveMode::Spline => PathSimplifyMode::Spline,
            CurveMode::Polygon => PathSimplifyMode::Polygon,
            CurveMode::Pixel => PathSimplifyMode::None,
        },
        filter_speckle: options.filter_speckle as usize,
        color_precision: options.color_precision as i32,
        layer_difference: options.layer_difference as i32,
        corner_threshold: options.corner_threshold as i32,
        length_threshold: options.length_threshold,
        max_iterations: MAX_ITERATIONS,
        splice_threshold: options.splice_threshold as i32,
        ..vtracer::Config::default()
    }
}

/// Vectorizer backed by the `vtracer` executable.
#[derive(Debug, Clone)]
pub struct VtracerCli {
    program: PathBuf,
}

impl VtracerCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for VtracerCli {
    fn default() -> Self {
        Self::new("vtracer")
    }
}

impl Vectorizer for VtracerCli {
    fn vectorize(&self, source: &Path, options: &ConversionOptions) -> Result<Vec<u8>, ConvertError> {
        info!("Vectorizing image: source={}", source.display());

        let output = tempfile::Builder::new()
            .prefix("vectorize-")
            .suffix(".svg")
            .tempfile()?;

        let run = Command::new(&self.program)
            .args(command_args(source, output.path(), options))
            .output()
            .map_err(|e| ConvertError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !run.status.success() {
            return Err(ConvertError::Exited {
                status: run.status.to_string(),
                stderr: String::from_utf8_lossy(&run.stderr).trim().to_string(),
            });
        }

        let svg = fs::read(output.path())?;
        validate_svg(&svg)?;

        info!("Vectorization complete: {} bytes", svg.len());
        Ok(svg)
    }
}

/// Builds the vtracer argument list for one conversion.
pub fn command_args(source: &Path, output: &Path, options: &ConversionOptions) -> Vec<OsString> {
    let color_mode = match options.color_mode {
        ColorMode::Color => "color",
        ColorMode::Binary => "bw",
    };
    let hierarchical = match options.hierarchical {
        Hierarchical::Stacked => "stacked",
        Hierarchical::Cutout => "cutout",
    };
    let mode = match options.mode {
        CurveMode::Spline => "spline",
        CurveMode::Polygon => "polygon",
        CurveMode::Pixel => "pixel",
    };

    let mut args: Vec<OsString> = vec![
        "--input".into(),
        source.as_os_str().to_owned(),
        "--output".into(),
        output.as_os_str().to_owned(),
    ];
    let flags = [
        ("--colormode", color_mode.to_string()),
        ("--hierarchical", hierarchical.to_string()),
        ("--mode", mode.to_string()),
        ("--filter_speckle", options.filter_speckle.to_string()),
        ("--color_precision", options.color_precision.to_string()),
        ("--gradient_step", options.layer_difference.to_string()),
        ("--corner_threshold", options.corner_threshold.to_string()),
        ("--segment_length", options.length_threshold.to_string()),
        ("--splice_threshold", options.splice_threshold.to_string()),
    ];
    for (flag, value) in flags {
        args.push(flag.into());
        args.push(value.into());
    }
    args
}

/// Parses `svg` and checks it has a drawable size.
///
/// # Errors
///
/// Returns [`ConvertError::InvalidSvg`] if the bytes are not UTF-8, do not
/// parse as SVG, or describe an empty canvas
pub fn validate_svg(svg: &[u8]) -> Result<(), ConvertError> {
    let text = std::str::from_utf8(svg).map_err(|e| ConvertError::InvalidSvg(e.to_string()))?;

    let tree = usvg::Tree::from_str(text, &usvg::Options::default())
        .map_err(|e| ConvertError::InvalidSvg(e.to_string()))?;

    let size = tree.size();
    if size.width() <= 0.0 || size.height() <= 0.0 {
        return Err(ConvertError::InvalidSvg(format!(
            "invalid dimensions {}x{}",
            size.width(),
            size.height()
        )));
    }

    debug!("SVG validated: {}x{} units", size.width(), size.height());
    Ok(())
}
