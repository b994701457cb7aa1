//! Still-frame encoder: raw RGBA/BGRA → downscaled JPEG or PNG.
//!
//! # Steps
//!
//! ```text
//! RawFrame (row stride may include padding)
//!   → tightly packed RGBA
//!   → resize (Triangle filter) to width/divisor × height/divisor
//!   → JPEG (RGB, fixed quality) | PNG (RGBA)
//! ```

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Rgba, RgbaImage};
use sharecast_core::{CaptureError, EngineConfig, ImageFormat, PixelFormat, RawFrame};
use tracing::trace;

/// Encoded output of one frame, before it is stamped with a sequence number.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data:   Bytes,
    pub format: ImageFormat,
    pub width:  u32,
    pub height: u32,
}

/// Downscales and compresses raw frames. Cheap to copy into worker closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEncoder {
    format:        ImageFormat,
    quality:       u8,
    scale_divisor: u32,
}

impl FrameEncoder {
    pub fn new(format: ImageFormat, quality: u8, scale_divisor: u32) -> Self {
        Self {
            format,
            quality: quality.clamp(1, 100),
            scale_divisor: scale_divisor.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.image_format, config.jpeg_quality, config.scale_divisor)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Output dimensions for a `width`×`height` frame; never below 1×1.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            (width / self.scale_divisor).max(1),
            (height / self.scale_divisor).max(1),
        )
    }

    pub fn encode(&self, frame: &RawFrame) -> Result<EncodedImage, CaptureError> {
        let rgba = to_rgba_image(frame)?;
        let (out_w, out_h) = self.output_size(frame.width, frame.height);

        let scaled = if (out_w, out_h) == (frame.width, frame.height) {
            rgba
        } else {
            image::imageops::resize(&rgba, out_w, out_h, FilterType::Triangle)
        };

        let mut out: Vec<u8> = Vec::new();
        match self.format {
            ImageFormat::Jpeg => {
                let rgb = image::DynamicImage::ImageRgba8(scaled).to_rgb8();
                let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
                encoder
                    .encode_image(&rgb)
                    .map_err(|e| encode_failed(format!("JPEG: {e}")))?;
            }
            ImageFormat::Png => {
                PngEncoder::new(&mut out)
                    .write_image(scaled.as_raw(), out_w, out_h, ExtendedColorType::Rgba8)
                    .map_err(|e| encode_failed(format!("PNG: {e}")))?;
            }
        }

        trace!(
            "Encoded {}x{} → {}x{} {} ({} bytes)",
            frame.width, frame.height, out_w, out_h, self.format, out.len()
        );

        Ok(EncodedImage { data: Bytes::from(out), format: self.format, width: out_w, height: out_h })
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

fn encode_failed(reason: impl Into<String>) -> CaptureError {
    CaptureError::EncodeFailed { reason: reason.into() }
}

/// Copy the visible pixels of `frame` into a tightly packed RGBA image,
/// dropping row padding and swapping channels for BGRA sources.
fn to_rgba_image(frame: &RawFrame) -> Result<RgbaImage, CaptureError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(encode_failed(format!("empty frame {}x{}", frame.width, frame.height)));
    }
    let bpp = frame.format.bytes_per_pixel();
    if frame.pixel_stride != bpp {
        return Err(encode_failed(format!(
            "unsupported pixel stride {} for {:?}",
            frame.pixel_stride, frame.format
        )));
    }
    if frame.row_stride < frame.width * bpp {
        return Err(encode_failed(format!(
            "row stride {} shorter than {} pixels",
            frame.row_stride, frame.width
        )));
    }
    if frame.data.len() < frame.required_len() {
        return Err(encode_failed(format!(
            "buffer too small: expected {} bytes, got {}",
            frame.required_len(),
            frame.data.len()
        )));
    }

    let row_bytes = (frame.width * bpp) as usize;
    let mut packed = Vec::with_capacity(row_bytes * frame.height as usize);
    for y in 0..frame.height as usize {
        let start = y * frame.row_stride as usize;
        let row = &frame.data[start..start + row_bytes];
        match frame.format {
            PixelFormat::Rgba8888 => packed.extend_from_slice(row),
            PixelFormat::Bgra8888 => {
                for px in row.chunks_exact(4) {
                    packed.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
        }
    }

    ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(frame.width, frame.height, packed)
        .ok_or_else(|| encode_failed("failed to create image buffer"))
}
