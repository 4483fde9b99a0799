use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use img_parts::Bytes;
use img_parts::jpeg::Jpeg;
use std::io::Cursor;
use std::path::Path;

const APP1: u8 = 0xE1;
const APP15: u8 = 0xEF;
const COM: u8 = 0xFE;

/// Longest side of the copy sent to the model when nothing else is configured.
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// JPEG quality of the resized copy when nothing else is configured.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Decode `path` and re-encode it as a JPEG whose longer side is at most
/// `max_dimension`. Aspect ratio is preserved and images are never upscaled.
pub fn resize(path: &Path, max_dimension: u32, jpeg_quality: u8) -> Result<Vec<u8>> {
    if max_dimension == 0 {
        anyhow::bail!("Maximum dimension must be at least 1 pixel");
    }

    let image = ImageReader::open(path)
        .context("Failed to open image file")?
        .with_guessed_format()
        .context("Failed to detect image format")?
        .decode()
        .context("Failed to decode image")?;

    let (width, height) = image.dimensions();
    let image = if width.max(height) > max_dimension {
        log::debug!(
            "Resizing {} from {width}x{height} to fit {max_dimension}px",
            path.display()
        );
        image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        image
    };

    encode_jpeg(&image, jpeg_quality)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)
        .context("Failed to encode JPEG")?;
    Ok(buffer.into_inner())
}

/// Remove embedded metadata (EXIF, XMP, IPTC, ICC and other application
/// segments, plus comments) from JPEG bytes. JFIF (APP0) is kept.
pub fn strip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse JPEG: {e}"))?;

    let before = jpeg.segments().len();
    jpeg.segments_mut().retain(|segment| {
        let marker = segment.marker();
        !((APP1..=APP15).contains(&marker) || marker == COM)
    });
    log::debug!(
        "Stripped {} metadata segment(s)",
        before - jpeg.segments().len()
    );

    Ok(jpeg.encoder().bytes().to_vec())
}
