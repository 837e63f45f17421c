//! Raster image codecs backed by the `image` crate.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{Codec, CodecError, ProgressFn, ProgressStage};

/// Default JPEG quality when the payload does not set one.
const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Output encoding of an [`ImageCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormatKind {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormatKind {
    pub fn task_kind(&self) -> &'static str {
        match self {
            ImageFormatKind::Png => "png",
            ImageFormatKind::Jpeg => "jpeg",
            ImageFormatKind::Webp => "webp",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ImageFormatKind::Png => "png",
            ImageFormatKind::Jpeg => "jpg",
            ImageFormatKind::Webp => "webp",
        }
    }
}

/// Payload accepted by the image codecs.
#[derive(Debug, Clone, Deserialize)]
pub struct ImagePayload {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub options: ImageOptions,
    #[serde(default)]
    pub process_options: ProcessOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageOptions {
    /// JPEG quality, 1-100.
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessOptions {
    pub resize_width: Option<u32>,
    pub resize_height: Option<u32>,
}

/// Result returned by the image codecs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionReport {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub input_size: u64,
    pub output_size: u64,
    /// `(input_size - output_size) / input_size`, two decimals.
    pub compression_rate: f64,
    pub width: u32,
    pub height: u32,
}

/// Re-encodes an image file into one output format.
#[derive(Debug, Clone)]
pub struct ImageCodec {
    format: ImageFormatKind,
}

impl ImageCodec {
    pub fn new(format: ImageFormatKind) -> Self {
        Self { format }
    }

    fn encode(
        &self,
        image: &DynamicImage,
        options: &ImageOptions,
        out: &mut BufWriter<File>,
    ) -> Result<(), CodecError> {
        match self.format {
            ImageFormatKind::Png => {
                let encoder =
                    PngEncoder::new_with_quality(out, CompressionType::Best, PngFilter::Adaptive);
                image.write_with_encoder(encoder)?;
            }
            ImageFormatKind::Jpeg => {
                let quality = options.quality.unwrap_or(DEFAULT_JPEG_QUALITY).clamp(1, 100);
                let encoder = JpegEncoder::new_with_quality(out, quality);
                DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
            }
            ImageFormatKind::Webp => {
                let encoder = WebPEncoder::new_lossless(out);
                if image.color().has_alpha() {
                    DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder)?;
                } else {
                    DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
                }
            }
        }
        Ok(())
    }
}

impl Codec for ImageCodec {
    fn kind(&self) -> &str {
        self.format.task_kind()
    }

    fn execute(
        &self,
        payload: &Value,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Value, CodecError> {
        let payload: ImagePayload = serde_json::from_value(payload.clone())
            .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;

        progress(ProgressStage::Reading, Some(0));
        let input_size = std::fs::metadata(&payload.input_path)?.len();
        let mut image = image::open(&payload.input_path)?;

        progress(ProgressStage::Processing, Some(30));
        if let Some((width, height)) = fit_within(
            image.dimensions(),
            payload.process_options.resize_width,
            payload.process_options.resize_height,
        ) {
            image = image.resize(width, height, FilterType::Lanczos3);
        }

        let output_path = payload
            .output_path
            .clone()
            .unwrap_or_else(|| default_output_path(&payload.input_path, self.format));

        progress(ProgressStage::Writing, Some(70));
        let mut out = BufWriter::new(File::create(&output_path)?);
        self.encode(&image, &payload.options, &mut out)?;
        out.flush()?;
        drop(out);

        let output_size = std::fs::metadata(&output_path)?.len();
        let (width, height) = image.dimensions();
        progress(ProgressStage::Completed, Some(100));

        let report = CompressionReport {
            input_path: payload.input_path,
            output_path,
            input_size,
            output_size,
            compression_rate: compression_rate(input_size, output_size),
            width,
            height,
        };
        serde_json::to_value(report).map_err(|e| CodecError::Failed(e.to_string()))
    }
}

/// Target size for a downscale, or `None` when the image already fits.
fn fit_within(
    (width, height): (u32, u32),
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> Option<(u32, u32)> {
    let max_width = max_width.filter(|w| *w > 0).unwrap_or(width);
    let max_height = max_height.filter(|h| *h > 0).unwrap_or(height);
    if width <= max_width && height <= max_height {
        return None;
    }
    Some((max_width, max_height))
}

/// `<dir>/<stem>.min.<ext>` next to the input.
fn default_output_path(input: &Path, format: ImageFormatKind) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{}.min.{}", stem, format.extension()))
}

fn compression_rate(input_size: u64, output_size: u64) -> f64 {
    if input_size == 0 {
        return 0.0;
    }
    let rate = (input_size as f64 - output_size as f64) / input_size as f64;
    (rate * 100.0).round() / 100.0
}
