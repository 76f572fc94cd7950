//! Local background-removal processors
//!
//! The chain depends only on [`ImageProcessor`]. Two implementations are
//! selected at startup from [`ProcessorConfig`]:
//!
//! - [`InProcessProcessor`] - decode, bound, segment and composite inside
//!   this process on the blocking pool
//! - [`SubprocessProcessor`] - hand the raw bytes to an external worker over
//!   stdin/stdout (e.g. a rembg script or `idcard-photo-worker`)
//!
//! ## Cleaning steps
//!
//! 1. Decode the raw bytes and flatten to RGB
//! 2. Downscale so neither side exceeds `max_dimension` (aspect preserved)
//! 3. Segment foreground from background into an alpha mask
//! 4. Composite the foreground over the solid canvas colour
//! 5. Encode as PNG
//!
//! Each intermediate buffer is dropped as soon as the next one exists; this
//! stage is the pipeline's peak-memory point.

pub mod in_process;
pub mod mock;
pub mod segment;
pub mod subprocess;

use crate::config::{CanvasColor, ProcessorConfig};
use crate::error::PhotoError;
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;

pub use in_process::InProcessProcessor;
pub use mock::MockProcessor;
pub use segment::{BorderKeySegmenter, Segmenter};
pub use subprocess::SubprocessProcessor;

/// Parameters for one processing call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessOptions {
    pub max_dimension: u32,
    pub canvas_color: CanvasColor,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            max_dimension: 800,
            canvas_color: CanvasColor::default(),
        }
    }
}

/// Capability interface for background removal
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Processor identifier for logs
    fn name(&self) -> &str;

    /// Produce background-removed PNG bytes composited onto the canvas colour
    async fn process(&self, input: Bytes, options: ProcessOptions) -> Result<Vec<u8>, PhotoError>;
}

/// Build the processor selected in config; `None` when local processing is disabled
pub fn from_config(config: &ProcessorConfig) -> Option<Arc<dyn ImageProcessor>> {
    match config {
        ProcessorConfig::InProcess => Some(Arc::new(InProcessProcessor::default())),
        ProcessorConfig::Subprocess { program, args } => {
            Some(Arc::new(SubprocessProcessor::new(program.clone(), args.clone())))
        }
        ProcessorConfig::Disabled => None,
    }
}

/// Decode raw bytes in any supported format
pub fn decode(input: &[u8]) -> Result<DynamicImage, PhotoError> {
    image::load_from_memory(input)
        .map_err(|e| PhotoError::ProcessingFailed(format!("decode failed: {}", e)))
}

/// Downscale so neither side exceeds `max_dimension`, preserving aspect ratio
pub fn fit_within(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    if image.width() > max_dimension || image.height() > max_dimension {
        image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        image
    }
}

/// Blend `foreground` over the canvas colour using `mask` as its alpha
pub fn composite(
    foreground: &RgbImage,
    mask: &GrayImage,
    canvas: CanvasColor,
) -> Result<RgbaImage, PhotoError> {
    if foreground.dimensions() != mask.dimensions() {
        return Err(PhotoError::ProcessingFailed(format!(
            "mask is {:?}, image is {:?}",
            mask.dimensions(),
            foreground.dimensions()
        )));
    }

    let [cr, cg, cb, ca] = canvas.rgba();
    let canvas_alpha = ca as f32 / 255.0;
    let canvas_rgb = [cr as f32, cg as f32, cb as f32];

    let (width, height) = foreground.dimensions();
    let mut out = RgbaImage::new(width, height);

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let fg = foreground.get_pixel(x, y).0;
        let alpha = mask.get_pixel(x, y).0[0] as f32 / 255.0;

        // Porter-Duff "over"
        let out_alpha = alpha + canvas_alpha * (1.0 - alpha);
        if out_alpha <= f32::EPSILON {
            pixel.0 = [0, 0, 0, 0];
            continue;
        }

        let mut rgba = [0u8; 4];
        for c in 0..3 {
            let value =
                (fg[c] as f32 * alpha + canvas_rgb[c] * canvas_alpha * (1.0 - alpha)) / out_alpha;
            rgba[c] = value.round().clamp(0.0, 255.0) as u8;
        }
        rgba[3] = (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
        pixel.0 = rgba;
    }

    Ok(out)
}

/// Encode as PNG
pub fn encode_png(image: DynamicImage) -> Result<Vec<u8>, PhotoError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| PhotoError::ProcessingFailed(format!("encode failed: {}", e)))?;
    Ok(buffer)
}

/// Run the full cleaning steps synchronously
pub fn clean_photo(
    input: &[u8],
    options: &ProcessOptions,
    segmenter: &dyn Segmenter,
) -> Result<Vec<u8>, PhotoError> {
    let decoded = decode(input)?;
    let bounded = fit_within(decoded, options.max_dimension);
    let rgb = bounded.into_rgb8();

    let mask = segmenter.alpha_mask(&rgb)?;
    let composited = composite(&rgb, &mask, options.canvas_color)?;
    drop(mask);
    drop(rgb);

    encode_png(DynamicImage::ImageRgba8(composited))
}

/// Check bytes produced elsewhere: must decode, must respect the bound, must be PNG.
/// Already-conforming PNGs are returned untouched.
pub fn normalize_output(output: Vec<u8>, options: &ProcessOptions) -> Result<Vec<u8>, PhotoError> {
    let format = image::guess_format(&output)
        .map_err(|e| PhotoError::ProcessingFailed(format!("worker output unrecognised: {}", e)))?;

    let (width, height) = image::ImageReader::with_format(Cursor::new(&output), format)
        .into_dimensions()
        .map_err(|e| PhotoError::ProcessingFailed(format!("worker output unreadable: {}", e)))?;

    let within_bound = width <= options.max_dimension && height <= options.max_dimension;
    if format == ImageFormat::Png && within_bound {
        return Ok(output);
    }

    let decoded = decode(&output)?;
    drop(output);
    encode_png(fit_within(decoded, options.max_dimension))
}
