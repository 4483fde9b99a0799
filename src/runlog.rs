//! Structured JSON record of a captioning run.
//!
//! One [`LogEntry`] per photo, in the order they are recorded, plus a
//! [`RunSummary`] computed at save time.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::metadata::PhotoContext;
use crate::pipeline::{CaptionedPhoto, PhotoFailure};

/// One processed photo.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// When the photo finished, not when it was recorded.
    pub timestamp: DateTime<Utc>,
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<PhotoContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl LogEntry {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Totals over every recorded entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Mean over all entries, successes and failures alike. 0 for an empty run.
    pub average_duration_ms: u64,
}

#[derive(Serialize)]
struct RunFile<'a> {
    run_started: DateTime<Utc>,
    run_finished: DateTime<Utc>,
    summary: RunSummary,
    entries: &'a [LogEntry],
}

/// Accumulates entries for one run and writes them to the logs directory.
///
/// # Example
///
/// ```rust,no_run
/// use photo_captioner::runlog::RunLog;
///
/// let log = RunLog::new("logs");
/// // ... record_success / record_failure for each photo ...
/// let path = log.save().unwrap();
/// println!("Run log: {}", path.display());
/// ```
#[derive(Debug)]
pub struct RunLog {
    logs_dir: PathBuf,
    started: DateTime<Utc>,
    entries: Vec<LogEntry>,
}

impl RunLog {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            started: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn record_success(&mut self, photo: &CaptionedPhoto) {
        self.entries.push(LogEntry {
            timestamp: photo.finished_at,
            file: photo.source.clone(),
            caption: Some(photo.caption.clone()),
            output: Some(photo.output.clone()),
            context: (!photo.context.is_empty()).then(|| photo.context.clone()),
            error: None,
            duration_ms: millis(photo.elapsed),
        });
    }

    pub fn record_failure(&mut self, file: &Path, failure: &PhotoFailure) {
        self.entries.push(LogEntry {
            timestamp: failure.finished_at,
            file: file.to_path_buf(),
            caption: None,
            output: None,
            context: None,
            error: Some(format!("{:#}", failure.error)),
            duration_ms: millis(failure.elapsed),
        });
    }

    pub fn summary(&self) -> RunSummary {
        let total = self.entries.len();
        let successful = self.entries.iter().filter(|e| e.is_success()).count();
        let average_duration_ms = if total == 0 {
            0
        } else {
            self.entries.iter().map(|e| e.duration_ms).sum::<u64>() / total as u64
        };
        RunSummary {
            total,
            successful,
            failed: total - successful,
            average_duration_ms,
        }
    }

    /// Write the run to `caption-run-<YYYYmmdd-HHMMSS>.json` in the logs
    /// directory, creating the directory if needed.
    pub fn save(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.logs_dir).with_context(|| {
            format!("Failed to create logs directory {}", self.logs_dir.display())
        })?;

        let path = self.logs_dir.join(format!(
            "caption-run-{}.json",
            self.started.format("%Y%m%d-%H%M%S")
        ));

        let file = RunFile {
            run_started: self.started,
            run_finished: Utc::now(),
            summary: self.summary(),
            entries: &self.entries,
        };
        let contents = serde_json::to_string_pretty(&file).context("Failed to serialize run log")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write run log {}", path.display()))?;

        log::debug!("Run log written to {}", path.display());
        Ok(path)
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
