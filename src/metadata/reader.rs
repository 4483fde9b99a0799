use anyhow::{Context, Result};
use img_parts::Bytes;
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use nom_exif::*;
use serde::Serialize;
use std::path::Path;

use super::{PhotoKind, iptc, xmp};

/// Caption and keyword context already stored in a photo.
///
/// The caption is the first non-empty value among IPTC Caption-Abstract,
/// XMP `dc:description` and EXIF `ImageDescription`. Keywords come from IPTC
/// Keywords, or XMP `dc:subject` when the IPTC list is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhotoContext {
    pub caption: Option<String>,
    pub keywords: Vec<String>,
}

impl PhotoContext {
    /// `true` when there is nothing worth adding to the prompt.
    pub fn is_empty(&self) -> bool {
        self.caption.is_none() && self.keywords.is_empty()
    }
}

/// Embedded metadata blocks pulled out of the container.
#[derive(Default)]
struct Embedded {
    iptc: Option<Vec<u8>>,
    xmp: Option<String>,
}

/// Read existing caption and keyword context from a photo.
///
/// Never fails: unreadable files or metadata produce an empty context.
pub fn read_tags(path: &Path) -> PhotoContext {
    match try_read_tags(path) {
        Ok(context) => context,
        Err(e) => {
            log::warn!("Could not read metadata from {}: {e:#}", path.display());
            PhotoContext::default()
        }
    }
}

fn try_read_tags(path: &Path) -> Result<PhotoContext> {
    let bytes = std::fs::read(path).context("Failed to read image file")?;
    let embedded = match PhotoKind::from_path(path) {
        Some(PhotoKind::Jpeg) => jpeg_blocks(bytes)?,
        Some(PhotoKind::Png) => png_blocks(bytes)?,
        None => Embedded::default(),
    };

    let iptc_caption = embedded.iptc.as_deref().and_then(iptc::caption);
    let xmp_description = embedded.xmp.as_deref().and_then(xmp::description);

    let caption = iptc_caption
        .or(xmp_description)
        .or_else(|| read_image_description(path));

    let mut keywords = embedded
        .iptc
        .as_deref()
        .map(iptc::keywords)
        .unwrap_or_default();
    if keywords.is_empty() {
        keywords = embedded.xmp.as_deref().map(xmp::subjects).unwrap_or_default();
    }

    Ok(PhotoContext { caption, keywords })
}

fn jpeg_blocks(bytes: Vec<u8>) -> Result<Embedded> {
    let jpeg = Jpeg::from_bytes(Bytes::from(bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse JPEG: {e}"))?;

    let mut embedded = Embedded::default();
    for segment in jpeg.segments() {
        let contents = segment.contents();
        match segment.marker() {
            0xED if contents.starts_with(iptc::IPTC_HEADER) => {
                embedded.iptc = Some(contents.to_vec());
            }
            0xE1 if contents.starts_with(xmp::JPEG_XMP_HEADER) => {
                let packet = &contents[xmp::JPEG_XMP_HEADER.len()..];
                embedded.xmp = Some(String::from_utf8_lossy(packet).to_string());
            }
            _ => {}
        }
    }
    Ok(embedded)
}

fn png_blocks(bytes: Vec<u8>) -> Result<Embedded> {
    let png = Png::from_bytes(Bytes::from(bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse PNG: {e}"))?;

    let xmp = png
        .chunks()
        .iter()
        .find_map(|chunk| xmp::from_png_chunk(chunk.kind(), chunk.contents()));

    Ok(Embedded { iptc: None, xmp })
}

/// EXIF `ImageDescription`, if the file has one.
fn read_image_description(path: &Path) -> Option<String> {
    let mut parser = MediaParser::new();
    let ms = MediaSource::file_path(path).ok()?;

    let iter: ExifIter = match parser.parse(ms) {
        Ok(iter) => iter,
        Err(_) => {
            log::debug!("No EXIF data found in {}", path.display());
            return None;
        }
    };
    let exif: Exif = iter.into();

    exif.get(ExifTag::ImageDescription).and_then(entry_to_string)
}

/// Convert an EntryValue to an Option<String>.
fn entry_to_string(val: &EntryValue) -> Option<String> {
    let s = val.to_string();
    let s = s.trim().trim_matches('"').trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}
