//! Image and metadata handling for captioning.
//!
//! - [`resize`] / [`strip`]: produce the small, metadata-free JPEG sent to the model
//! - [`read_tags`]: best-effort read of existing caption and keyword context
//! - [`write_caption_and_relocate`]: write the caption into a copy of the photo in the
//!   output directory
//!
//! Captions are written to three places so that every common tool finds them:
//! EXIF `ImageDescription`, XMP `dc:description` and IPTC Caption-Abstract.

mod iptc;
mod reader;
mod resize;
mod writer;
mod xmp;

pub use reader::{PhotoContext, read_tags};
pub use resize::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_DIMENSION, resize, strip};
pub use writer::write_caption_and_relocate;
pub(crate) use writer::write_caption_unless_cancelled;

use std::path::Path;

/// Photo formats the captioner reads and writes.
///
/// # Example
///
/// ```rust
/// use photo_captioner::metadata::PhotoKind;
/// use std::path::Path;
///
/// assert_eq!(PhotoKind::from_path(Path::new("IMG_0001.JPG")), Some(PhotoKind::Jpeg));
/// assert_eq!(PhotoKind::from_path(Path::new("notes.txt")), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoKind {
    /// JPEG: EXIF + XMP + IPTC
    Jpeg,
    /// PNG: EXIF (eXIf chunk) + XMP (iTXt chunk)
    Png,
}

impl PhotoKind {
    /// Determine the photo kind from a file path extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }
}
