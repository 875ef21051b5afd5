//! Named image transforms and the registry the worker dispatches through.
//!
//! Every transform is a pure `bytes -> bytes` function. Dispatch is keyed by
//! [`Operation`], so a name that does not parse as an operation can never be
//! registered; at execution time such a name resolves to [`Stage::Unknown`]
//! and the pipeline skips it.

use std::collections::HashMap;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::models::job::Operation;

pub type TransformFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync>;

const MAX_WIDTH: u32 = 800;
const MAX_HEIGHT: u32 = 600;
const JPEG_QUALITY: u8 = 85;
const BLUR_SIGMA: f32 = 2.0;
const WATERMARK_ALPHA: f32 = 180.0 / 255.0;
const WATERMARK_MARGIN: u32 = 20;

/// Result of resolving one requested operation name.
pub enum Stage<'a> {
    Apply(Operation, &'a TransformFn),
    /// A known operation with no function registered.
    Unregistered(Operation),
    Unknown,
}

/// Output of a full pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub bytes: Vec<u8>,
    pub applied: Vec<Operation>,
    /// Requested names that were skipped, in request order.
    pub skipped: Vec<String>,
}

#[derive(Clone, Default)]
pub struct TransformRegistry {
    stages: HashMap<Operation, TransformFn>,
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in image transforms.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Operation::Resize, resize)
            .register(Operation::Watermark, watermark)
            .register(Operation::Filter, blur);
        registry
    }

    pub fn register(
        &mut self,
        op: Operation,
        f: impl Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.stages.insert(op, Arc::new(f));
        self
    }

    /// Register by name, refusing names that are not operations.
    pub fn register_named(
        &mut self,
        name: &str,
        f: impl Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    ) -> Result<&mut Self, TransformError> {
        let op: Operation = name
            .parse()
            .map_err(|_| TransformError::UnknownOperation(name.to_string()))?;
        Ok(self.register(op, f))
    }

    pub fn lookup(&self, name: &str) -> Stage<'_> {
        match name.parse::<Operation>() {
            Ok(op) => match self.stages.get(&op) {
                Some(f) => Stage::Apply(op, f),
                None => Stage::Unregistered(op),
            },
            Err(_) => Stage::Unknown,
        }
    }

    /// Feed `input` through `operations` in order, each stage consuming the
    /// previous stage's output. Unresolvable names are skipped.
    pub fn run(
        &self,
        operations: &[String],
        input: Vec<u8>,
    ) -> Result<PipelineOutput, TransformError> {
        let mut output = PipelineOutput {
            bytes: input,
            applied: Vec::with_capacity(operations.len()),
            skipped: Vec::new(),
        };
        for name in operations {
            match self.lookup(name) {
                Stage::Apply(op, f) => {
                    output.bytes = f(&output.bytes)?;
                    output.applied.push(op);
                }
                Stage::Unregistered(_) | Stage::Unknown => output.skipped.push(name.clone()),
            }
        }
        Ok(output)
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, TransformError> {
    image::load_from_memory(bytes).map_err(TransformError::Decode)
}

/// Flatten onto white and encode as JPEG.
fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, TransformError> {
    let rgb = flatten(img);
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(TransformError::Encode)?;
    Ok(out)
}

fn flatten(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = f32::from(a) / 255.0;
        let over_white = |c: u8| (f32::from(c) * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        Rgb([over_white(r), over_white(g), over_white(b)])
    })
}

/// Fit within 800x600 preserving aspect ratio. Smaller images are only re-encoded.
pub fn resize(bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
    let img = decode(bytes)?;
    let img = if img.width() > MAX_WIDTH || img.height() > MAX_HEIGHT {
        img.resize(MAX_WIDTH, MAX_HEIGHT, FilterType::Lanczos3)
    } else {
        img
    };
    encode_jpeg(&img)
}

/// Blend a translucent light band into the bottom-right corner.
pub fn watermark(bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
    let mut rgb = flatten(&decode(bytes)?);
    let (width, height) = rgb.dimensions();
    let band_w = (width / 4).max(1);
    let band_h = (height / 12).max(1);
    let x0 = width.saturating_sub(band_w + WATERMARK_MARGIN);
    let y0 = height.saturating_sub(band_h + WATERMARK_MARGIN);

    for y in y0..(y0 + band_h).min(height) {
        for x in x0..(x0 + band_w).min(width) {
            let pixel = rgb.get_pixel_mut(x, y);
            for channel in pixel.0.iter_mut() {
                let blended =
                    f32::from(*channel) * (1.0 - WATERMARK_ALPHA) + 255.0 * WATERMARK_ALPHA;
                *channel = blended.round() as u8;
            }
        }
    }
    encode_jpeg(&DynamicImage::ImageRgb8(rgb))
}

pub fn blur(bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
    let img = decode(bytes)?;
    encode_jpeg(&img.blur(BLUR_SIGMA))
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Operation {op} failed: {message}")]
    Stage { op: Operation, message: String },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Transform task aborted: {0}")]
    Aborted(String),
}
