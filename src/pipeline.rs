use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::caption::{self, CaptionService};
use crate::config::Config;
use crate::metadata::{self, PhotoContext, PhotoKind};
use crate::runner::{BatchRunner, ItemTimedOut, Outcome};

/// MIME type of the resized copy sent to the model.
const UPLOAD_MIME_TYPE: &str = "image/jpeg";

/// Everything a single photo needs besides its path. Shared by reference
/// across all in-flight photos of a batch.
pub struct PipelineContext {
    pub captioner: Arc<dyn CaptionService>,
    pub output_dir: PathBuf,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl PipelineContext {
    pub fn new(captioner: Arc<dyn CaptionService>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            captioner,
            output_dir: output_dir.into(),
            max_dimension: metadata::DEFAULT_MAX_DIMENSION,
            jpeg_quality: metadata::DEFAULT_JPEG_QUALITY,
        }
    }

    /// Context for the configured output directory and image settings.
    pub fn from_config(captioner: Arc<dyn CaptionService>, config: &Config) -> Self {
        Self {
            captioner,
            output_dir: config.paths.output_dir.clone(),
            max_dimension: config.processing.max_dimension,
            jpeg_quality: config.processing.jpeg_quality,
        }
    }
}

/// A photo that was captioned and copied to the output directory.
#[derive(Debug, Clone)]
pub struct CaptionedPhoto {
    pub source: PathBuf,
    pub output: PathBuf,
    pub caption: String,
    /// Caption and keywords the photo carried before this run.
    pub context: PhotoContext,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

/// Why a photo could not be captioned, and how long it took to find out.
#[derive(Debug)]
pub struct PhotoFailure {
    pub error: anyhow::Error,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for PhotoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for PhotoFailure {}

impl From<ItemTimedOut> for PhotoFailure {
    fn from(timeout: ItemTimedOut) -> Self {
        Self {
            elapsed: timeout.limit(),
            finished_at: Utc::now(),
            error: anyhow::Error::new(timeout),
        }
    }
}

/// Collect the photos to caption from `input_dir`.
///
/// Only the top level is scanned unless `recursive` is set. Results are
/// sorted by path so runs are reproducible. A missing input directory is an
/// error; an empty one is not.
///
/// # Example
///
/// ```rust,no_run
/// use photo_captioner::pipeline::collect_photos;
///
/// let photos = collect_photos("./input".as_ref(), false).unwrap();
/// println!("Found {} photos", photos.len());
/// ```
pub fn collect_photos(input_dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !input_dir.is_dir() {
        anyhow::bail!("Input directory not found: {}", input_dir.display());
    }

    let walker = WalkDir::new(input_dir).follow_links(true);
    let walker = if recursive { walker } else { walker.max_depth(1) };

    let mut photos: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("Skipping unreadable entry: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| PhotoKind::from_path(path).is_some())
        .collect();

    photos.sort();
    Ok(photos)
}

/// Caption one photo: read its existing tags, upload a small stripped copy,
/// and write the returned caption into a copy in the output directory.
pub async fn caption_photo(
    path: &Path,
    context: &PipelineContext,
) -> Result<CaptionedPhoto, PhotoFailure> {
    let started = Instant::now();
    match try_caption_photo(path, context).await {
        Ok((caption, output, existing)) => Ok(CaptionedPhoto {
            source: path.to_path_buf(),
            output,
            caption,
            context: existing,
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        }),
        Err(error) => Err(PhotoFailure {
            error,
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        }),
    }
}

/// Sets its flag when dropped. Dropped early only when the photo's future is
/// abandoned (item timeout), which stops a detached write from landing.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn try_caption_photo(
    path: &Path,
    context: &PipelineContext,
) -> Result<(String, PathBuf, PhotoContext)> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let _cancel_on_drop = CancelOnDrop(cancelled.clone());

    let source = path.to_path_buf();
    let (max_dimension, jpeg_quality) = (context.max_dimension, context.jpeg_quality);
    let (existing, upload) = tokio::task::spawn_blocking(move || -> Result<_> {
        let existing = metadata::read_tags(&source);
        let resized = metadata::resize(&source, max_dimension, jpeg_quality)?;
        let upload = metadata::strip(&resized)?;
        Ok((existing, upload))
    })
    .await
    .context("Image preparation task failed")??;

    log::debug!(
        "Prepared {} ({} bytes to upload)",
        path.display(),
        upload.len()
    );

    let prompt = caption::build_prompt(&existing);
    let image_base64 = base64::engine::general_purpose::STANDARD.encode(&upload);
    let caption = context
        .captioner
        .caption(&image_base64, UPLOAD_MIME_TYPE, &prompt)
        .await
        .with_context(|| format!("{} captioning failed", context.captioner.name()))?;

    let source = path.to_path_buf();
    let output_dir = context.output_dir.clone();
    let text = caption.clone();
    let output = tokio::task::spawn_blocking(move || {
        metadata::write_caption_unless_cancelled(&source, &text, &output_dir, &cancelled)
    })
    .await
    .context("Metadata write task failed")??;

    Ok((caption, output, existing))
}

/// Caption every photo with at most `runner.concurrency()` in flight.
/// Outcomes are in the same order as `photos`.
pub async fn caption_batch(
    photos: &[PathBuf],
    context: &PipelineContext,
    runner: &BatchRunner,
) -> Vec<Outcome<CaptionedPhoto, PhotoFailure>> {
    log::debug!(
        "Captioning {} photo(s), {} at a time",
        photos.len(),
        runner.concurrency()
    );
    runner
        .process(photos, |path| caption_photo(path, context))
        .await
}
