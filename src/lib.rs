//! # photo-captioner
//!
//! Batch photo captioner: sends a small, metadata-free copy of every photo in a
//! folder to a vision model, then writes the returned caption into a copy of the
//! photo (EXIF, XMP and IPTC) in an output folder. Photos are processed with a
//! bounded number in flight, and every run is recorded as a JSON log.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use photo_captioner::config::Config;
//! use photo_captioner::pipeline::{PipelineContext, caption_batch, collect_photos};
//! use photo_captioner::runlog::RunLog;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load(Some("config.json".as_ref()))?;
//!     config.apply_env()?;
//!     config.validate()?;
//!
//!     let photos = collect_photos(&config.paths.input_dir, config.paths.recursive)?;
//!     let context = PipelineContext::from_config(Arc::new(config.captioner()), &config);
//!     let outcomes = caption_batch(&photos, &context, &config.runner()?).await;
//!
//!     let mut log = RunLog::new(&config.paths.logs_dir);
//!     for (path, outcome) in photos.iter().zip(&outcomes) {
//!         match outcome.success() {
//!             Some(photo) => log.record_success(photo),
//!             None => {
//!                 if let Some(failure) = outcome.failure() {
//!                     log.record_failure(path, failure);
//!                 }
//!             }
//!         }
//!     }
//!     println!("Log: {}", log.save()?.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`runner`]: Bounded-concurrency batch runner with ordered outcomes
//! - [`metadata`]: Resize/strip for upload, tag reading, caption writing
//! - [`caption`]: Prompt building and the vision model client
//! - [`runlog`]: JSON run log
//! - [`pipeline`]: Photo discovery and the per-photo captioning flow
//! - [`config`]: Configuration loading, environment overrides, validation

pub mod caption;
pub mod config;
pub mod metadata;
pub mod pipeline;
pub mod runlog;
pub mod runner;
