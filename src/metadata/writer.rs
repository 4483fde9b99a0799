use anyhow::{Context, Result};
use img_parts::jpeg::{Jpeg, JpegSegment};
use img_parts::png::{Png, PngChunk};
use img_parts::{Bytes, ImageEXIF};
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{PhotoKind, iptc, xmp};

const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;
const TIFF_FORMAT_ASCII: u16 = 2;

// little_exif as_u8_vec(JPEG) returns: [APP1 marker 2B][length 2B][Exif\0\0 6B][TIFF data]
// img-parts set_exif() expects just the TIFF data (after Exif\0\0)
const JPEG_EXIF_OVERHEAD: usize = 10; // 2 + 2 + 6

/// Write `caption` into a copy of `source` placed in `output_dir` under the
/// same file name. Returns the path of the copy.
///
/// JPEG copies get the caption in EXIF `ImageDescription`, XMP
/// `dc:description` and IPTC Caption-Abstract. PNG has no IPTC block, so PNG
/// copies get EXIF and XMP only. The source file is left as it was.
pub fn write_caption_and_relocate(
    source: &Path,
    caption: &str,
    output_dir: &Path,
) -> Result<PathBuf> {
    write_caption_unless_cancelled(source, caption, output_dir, &AtomicBool::new(false))
}

/// [`write_caption_and_relocate`] that gives up, leaving the destination
/// alone, if `cancelled` is set before the copy is moved into place.
pub(crate) fn write_caption_unless_cancelled(
    source: &Path,
    caption: &str,
    output_dir: &Path,
    cancelled: &AtomicBool,
) -> Result<PathBuf> {
    let kind = PhotoKind::from_path(source)
        .with_context(|| format!("Unsupported image type: {}", source.display()))?;
    let file_name = source
        .file_name()
        .with_context(|| format!("No file name in {}", source.display()))?;

    let original = std::fs::read(source).context("Failed to read image file")?;
    let captioned = match kind {
        PhotoKind::Jpeg => caption_jpeg(source, original, caption)?,
        PhotoKind::Png => caption_png(source, original, caption)?,
    };

    std::fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory {}", output_dir.display())
    })?;
    let destination = output_dir.join(file_name);

    // Unique per write, so same-named photos never share a staging file.
    // Dropped (and deleted) on every early return.
    let mut staging = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name.to_string_lossy()))
        .suffix(".partial")
        .tempfile_in(output_dir)
        .context("Failed to create staging file")?;
    staging
        .write_all(&captioned)
        .context("Failed to write captioned image")?;

    if cancelled.load(Ordering::SeqCst) {
        anyhow::bail!(
            "Cancelled before the captioned copy was moved to {}",
            destination.display()
        );
    }
    staging.persist(&destination).map_err(|e| e.error).with_context(|| {
        format!("Failed to move captioned image to {}", destination.display())
    })?;

    log::debug!("Captioned copy written to {}", destination.display());
    Ok(destination)
}

fn caption_jpeg(source: &Path, bytes: Vec<u8>, caption: &str) -> Result<Vec<u8>> {
    let mut jpeg = Jpeg::from_bytes(Bytes::from(bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse JPEG: {e}"))?;

    // Remember where the EXIF segment was originally positioned
    let orig_exif_pos = find_segment(&jpeg, 0xE1, b"Exif\0\0");
    let original_exif = jpeg.exif().unwrap_or_default();
    let tiff = exif_with_description(source, &original_exif, caption)?;
    jpeg.set_exif(Some(Bytes::from(tiff)));

    // set_exif() inserts at position 3, which may be after XMP APP1.
    // Keep EXIF ahead of XMP, where many parsers expect it.
    if let Some(new_pos) = find_segment(&jpeg, 0xE1, b"Exif\0\0") {
        let target_pos = orig_exif_pos.unwrap_or(1); // default: right after APP0
        if target_pos < new_pos {
            let segments = jpeg.segments_mut();
            let seg = segments.remove(new_pos);
            segments.insert(target_pos, seg);
        }
    }

    // XMP dc:description
    let xmp_pos = find_segment(&jpeg, 0xE1, xmp::JPEG_XMP_HEADER);
    let existing_xmp = xmp_pos.map(|pos| {
        let contents = jpeg.segments()[pos].contents();
        String::from_utf8_lossy(&contents[xmp::JPEG_XMP_HEADER.len()..]).to_string()
    });
    let packet = xmp::with_description(existing_xmp.as_deref(), caption);
    let mut contents = Vec::with_capacity(xmp::JPEG_XMP_HEADER.len() + packet.len());
    contents.extend_from_slice(xmp::JPEG_XMP_HEADER);
    contents.extend_from_slice(packet.as_bytes());
    let xmp_segment = JpegSegment::new_with_contents(0xE1, Bytes::from(contents));

    let segments = jpeg.segments_mut();
    match xmp_pos {
        Some(pos) => segments[pos] = xmp_segment,
        None => {
            let insert_pos = segments
                .iter()
                .position(|s| s.marker() == 0xE1 && s.contents().starts_with(b"Exif\0\0"))
                .map(|p| p + 1)
                .unwrap_or(2)
                .min(segments.len());
            segments.insert(insert_pos, xmp_segment);
        }
    }

    // IPTC Caption-Abstract
    let iptc_pos = find_segment(&jpeg, 0xED, iptc::IPTC_HEADER);
    let existing_iptc = iptc_pos.map(|pos| jpeg.segments()[pos].contents().to_vec());
    let app13 = iptc::with_caption(existing_iptc.as_deref(), caption);
    let iptc_segment = JpegSegment::new_with_contents(0xED, Bytes::from(app13));

    let segments = jpeg.segments_mut();
    match iptc_pos {
        Some(pos) => segments[pos] = iptc_segment,
        None => {
            let insert_pos = segments.len().min(4);
            segments.insert(insert_pos, iptc_segment);
        }
    }

    Ok(jpeg.encoder().bytes().to_vec())
}

fn caption_png(source: &Path, bytes: Vec<u8>, caption: &str) -> Result<Vec<u8>> {
    let mut png = Png::from_bytes(Bytes::from(bytes))
        .map_err(|e| anyhow::anyhow!("Failed to parse PNG: {e}"))?;

    let original_exif = png.exif().unwrap_or_default();
    let tiff = exif_with_description(source, &original_exif, caption)?;
    png.set_exif(Some(Bytes::from(tiff)));

    let xmp_pos = png
        .chunks()
        .iter()
        .position(|c| xmp::from_png_chunk(c.kind(), c.contents()).is_some());
    let existing_xmp = xmp_pos.and_then(|pos| {
        let chunk = &png.chunks()[pos];
        xmp::from_png_chunk(chunk.kind(), chunk.contents())
    });
    let packet = xmp::with_description(existing_xmp.as_deref(), caption);
    let chunk = PngChunk::new(xmp::PNG_ITXT, Bytes::from(xmp::png_chunk_contents(&packet)));

    let chunks = png.chunks_mut();
    match xmp_pos {
        Some(pos) => chunks[pos] = chunk,
        // Right after IHDR
        None => chunks.insert(1usize.min(chunks.len()), chunk),
    }

    Ok(png.encoder().bytes().to_vec())
}

fn find_segment(jpeg: &Jpeg, marker: u8, prefix: &[u8]) -> Option<usize> {
    jpeg.segments()
        .iter()
        .position(|s| s.marker() == marker && s.contents().starts_with(prefix))
}

/// Build TIFF-structured EXIF data with `ImageDescription` set to `caption`,
/// keeping the tags already present in `original`.
fn exif_with_description(source: &Path, original: &[u8], caption: &str) -> Result<Vec<u8>> {
    if original.is_empty() {
        let mut metadata = Metadata::new();
        metadata.set_tag(ExifTag::ImageDescription(caption.to_string()));
        return tiff_from_metadata(&metadata);
    }

    if let Some(mut metadata) = load_existing_metadata(source) {
        log::debug!("little_exif parsed existing EXIF, using merge strategy");
        metadata.set_tag(ExifTag::ImageDescription(caption.to_string()));
        if let Ok(tiff) = tiff_from_metadata(&metadata) {
            return Ok(tiff);
        }
    }

    log::debug!("Using raw TIFF injection to preserve original EXIF");
    inject_description_into_tiff(original, caption)
}

fn tiff_from_metadata(metadata: &Metadata) -> Result<Vec<u8>> {
    let exif_bytes = metadata.as_u8_vec(FileExtension::JPEG);
    if exif_bytes.len() <= JPEG_EXIF_OVERHEAD {
        anyhow::bail!("little_exif produced no EXIF data");
    }
    Ok(exif_bytes[JPEG_EXIF_OVERHEAD..].to_vec())
}

/// Load existing EXIF metadata from a file path using little_exif.
/// Returns None if it can't parse (instead of losing data).
///
/// Runs on several threads at once, so the process panic hook is left alone;
/// a little_exif panic is still reported by it before being caught here.
fn load_existing_metadata(path: &Path) -> Option<Metadata> {
    let path_owned = path.to_path_buf();
    let result = std::panic::catch_unwind(move || Metadata::new_from_path(&path_owned));

    match result {
        Ok(Ok(m)) if !m.data().is_empty() => {
            log::debug!("little_exif loaded {} existing EXIF tags", m.data().len());
            Some(m)
        }
        Ok(Ok(_)) => {
            log::debug!("little_exif loaded empty metadata");
            None
        }
        Ok(Err(e)) => {
            log::debug!("little_exif could not parse EXIF: {e}");
            None
        }
        Err(_) => {
            log::debug!("little_exif panicked parsing EXIF");
            None
        }
    }
}

/// Rewrite IFD0 of raw TIFF data with `ImageDescription` set to `caption`.
///
/// The new IFD0 and the string are appended at the end of the data and the
/// header is pointed at them. Every original entry keeps its offsets, so the
/// sub-IFDs and thumbnails it references stay valid.
fn inject_description_into_tiff(original: &[u8], caption: &str) -> Result<Vec<u8>> {
    if original.len() < 8 {
        anyhow::bail!("Original TIFF data too short");
    }

    let big_endian = match &original[0..2] {
        b"MM" => true,
        b"II" => false,
        _ => anyhow::bail!("Invalid TIFF byte order"),
    };

    let read_u16 = |data: &[u8], offset: usize| -> u16 {
        if big_endian {
            u16::from_be_bytes([data[offset], data[offset + 1]])
        } else {
            u16::from_le_bytes([data[offset], data[offset + 1]])
        }
    };
    let read_u32 = |data: &[u8], offset: usize| -> u32 {
        let b = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
        if big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) }
    };
    let encode_u16 = |val: u16| -> [u8; 2] {
        if big_endian { val.to_be_bytes() } else { val.to_le_bytes() }
    };
    let encode_u32 = |val: u32| -> [u8; 4] {
        if big_endian { val.to_be_bytes() } else { val.to_le_bytes() }
    };

    let ifd0_offset = read_u32(original, 4) as usize;
    if ifd0_offset + 2 > original.len() {
        anyhow::bail!("IFD0 offset out of bounds");
    }
    let ifd0_count = read_u16(original, ifd0_offset) as usize;
    let ifd0_start = ifd0_offset + 2;
    let ifd0_end = ifd0_start + ifd0_count * 12;
    if ifd0_end + 4 > original.len() {
        anyhow::bail!("IFD0 entries extend beyond TIFF data");
    }
    let ifd0_next = read_u32(original, ifd0_end);

    // Entries are (tag, raw 12 bytes); the description entry is filled below
    let mut entries: Vec<(u16, [u8; 12])> = (0..ifd0_count)
        .map(|i| {
            let off = ifd0_start + i * 12;
            let mut raw = [0u8; 12];
            raw.copy_from_slice(&original[off..off + 12]);
            (read_u16(original, off), raw)
        })
        .filter(|(tag, _)| *tag != TAG_IMAGE_DESCRIPTION)
        .collect();

    let mut result = original.to_vec();
    // Word-align appended data
    if result.len() % 2 != 0 {
        result.push(0);
    }

    let mut value = caption.as_bytes().to_vec();
    value.push(0);
    let value_offset = result.len() as u32;
    result.extend_from_slice(&value);
    if result.len() % 2 != 0 {
        result.push(0);
    }

    let mut description = [0u8; 12];
    description[0..2].copy_from_slice(&encode_u16(TAG_IMAGE_DESCRIPTION));
    description[2..4].copy_from_slice(&encode_u16(TIFF_FORMAT_ASCII));
    description[4..8].copy_from_slice(&encode_u32(value.len() as u32));
    if value.len() <= 4 {
        description[8..8 + value.len()].copy_from_slice(&value);
    } else {
        description[8..12].copy_from_slice(&encode_u32(value_offset));
    }
    entries.push((TAG_IMAGE_DESCRIPTION, description));
    // IFD entries must be sorted by tag
    entries.sort_by_key(|(tag, _)| *tag);

    let new_ifd0_start = result.len() as u32;
    result.extend_from_slice(&encode_u16(entries.len() as u16));
    for (_, raw) in &entries {
        result.extend_from_slice(raw);
    }
    result.extend_from_slice(&encode_u32(ifd0_next));

    // Point the header at the new IFD0
    result[4..8].copy_from_slice(&encode_u32(new_ifd0_start));

    Ok(result)
}
