use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use photo_captioner::caption::CaptionService;
use photo_captioner::config::Config;
use photo_captioner::pipeline::{self, PipelineContext};
use photo_captioner::runlog::RunLog;

#[derive(Parser, Debug)]
#[command(
    name = "photo-captioner",
    version,
    about = "Caption a folder of photos with a vision model and write the captions into their metadata"
)]
struct Cli {
    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Folder of photos to caption
    #[arg(short, long, value_name = "DIR")]
    input: Option<PathBuf>,

    /// Folder for captioned copies
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Folder for run logs
    #[arg(long, value_name = "DIR")]
    logs: Option<PathBuf>,

    /// Number of photos captioned at the same time
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Include photos in subfolders
    #[arg(short, long)]
    recursive: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    // File, then environment, then flags
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env()?;
    if let Some(input) = cli.input {
        config.paths.input_dir = input;
    }
    if let Some(output) = cli.output {
        config.paths.output_dir = output;
    }
    if let Some(logs) = cli.logs {
        config.paths.logs_dir = logs;
    }
    if let Some(concurrency) = cli.concurrency {
        config.processing.concurrency = concurrency;
    }
    if cli.recursive {
        config.paths.recursive = true;
    }
    config.validate()?;

    let photos = pipeline::collect_photos(&config.paths.input_dir, config.paths.recursive)?;
    if photos.is_empty() {
        log::warn!(
            "No supported photos (.jpg, .jpeg, .png) found in {}",
            config.paths.input_dir.display()
        );
        return Ok(());
    }

    let runner = config.runner()?;
    let captioner = config.captioner();
    log::info!(
        "Found {} photo(s) in {}; captioning with {} ({}), {} at a time",
        photos.len(),
        config.paths.input_dir.display(),
        captioner.name(),
        config.openai.model,
        runner.concurrency()
    );

    let context = PipelineContext::from_config(Arc::new(captioner), &config);
    let outcomes = pipeline::caption_batch(&photos, &context, &runner).await;

    let mut run_log = RunLog::new(&config.paths.logs_dir);
    let total = photos.len();
    for (i, (path, outcome)) in photos.iter().zip(&outcomes).enumerate() {
        log::info!("[{}/{}] {}", i + 1, total, path.display());
        if let Some(photo) = outcome.success() {
            log::info!("  Caption: {}", photo.caption);
            log::info!("  Saved: {}", photo.output.display());
            run_log.record_success(photo);
        } else if let Some(failure) = outcome.failure() {
            log::error!("  Error: {failure}");
            run_log.record_failure(path, failure);
        }
    }

    // JSON output
    if cli.json {
        let json_results: Vec<serde_json::Value> = photos
            .iter()
            .zip(&outcomes)
            .map(|(path, outcome)| {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "caption": outcome.success().map(|p| p.caption.clone()),
                    "output": outcome.success().map(|p| p.output.display().to_string()),
                    "context": outcome.success().map(|p| &p.context),
                    "error": outcome.failure().map(|f| f.to_string()),
                    "duration_ms": outcome
                        .success()
                        .map(|p| p.elapsed)
                        .or_else(|| outcome.failure().map(|f| f.elapsed))
                        .map(|d| d.as_millis() as u64),
                })
            })
            .collect();

        println!("{}", serde_json::to_string_pretty(&json_results)?);
    }

    // Summary
    let summary = run_log.summary();
    log::info!(
        "Done: {} succeeded, {} failed out of {} photos (avg {} ms)",
        summary.successful,
        summary.failed,
        summary.total,
        summary.average_duration_ms
    );

    let log_path = run_log.save()?;
    log::info!("Run log: {}", log_path.display());

    Ok(())
}
