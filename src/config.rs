use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::caption::OpenAiCaptioner;
use crate::metadata::{DEFAULT_JPEG_QUALITY, DEFAULT_MAX_DIMENSION};
use crate::runner::{BatchRunner, DEFAULT_CONCURRENCY};

/// Top-level configuration for the photo captioner.
///
/// # Loading
///
/// ```rust,no_run
/// use photo_captioner::config::Config;
///
/// // From a JSON file, then environment overrides
/// let mut config = Config::load(Some("config.json".as_ref())).unwrap();
/// config.apply_env().unwrap();
/// config.validate().unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.openai.api_key = "sk-...".into();
/// config.processing.concurrency = 8;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openai: OpenAiConfig,
    pub paths: PathsConfig,
    pub processing: ProcessingConfig,
}

/// OpenAI chat-completions settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    /// Base URL of an OpenAI-compatible API.
    pub api_base: String,
    pub max_tokens: u32,
}

/// Where photos are read from and where results go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Descend into subdirectories of `input_dir`.
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Photos captioned at the same time.
    pub concurrency: usize,
    /// Longest side, in pixels, of the copy sent to the model.
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    /// Per-photo time limit. `None` waits indefinitely.
    pub item_timeout_secs: Option<u64>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            api_base: crate::caption::DEFAULT_API_BASE.to_string(),
            max_tokens: 300,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            logs_dir: PathBuf::from("logs"),
            recursive: false,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_dimension: DEFAULT_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            item_timeout_secs: None,
        }
    }
}

impl Config {
    /// Resolve the config file path, next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Apply `OPENAI_API_KEY` and `CONCURRENCY` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to resolve variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.openai.api_key = key;
        }
        if let Some(raw) = lookup("CONCURRENCY") {
            let concurrency: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("CONCURRENCY must be a positive integer, got {raw:?}"))?;
            if concurrency == 0 {
                anyhow::bail!("CONCURRENCY must be a positive integer, got 0");
            }
            self.processing.concurrency = concurrency;
        }
        Ok(())
    }

    /// Check everything a run needs before any photo is touched.
    pub fn validate(&self) -> Result<()> {
        if self.openai.api_key.trim().is_empty() {
            anyhow::bail!(
                "No OpenAI API key configured. Set OPENAI_API_KEY or add it to the config file (`photo-captioner --init` creates one)."
            );
        }
        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }
        if self.processing.max_dimension == 0 {
            anyhow::bail!("max_dimension must be at least 1 pixel");
        }
        Ok(())
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.processing.item_timeout_secs.map(Duration::from_secs)
    }

    /// Build the runner described by the `processing` section.
    pub fn runner(&self) -> Result<BatchRunner> {
        let runner = BatchRunner::new(self.processing.concurrency)?;
        Ok(match self.item_timeout() {
            Some(limit) => runner.with_item_timeout(limit),
            None => runner,
        })
    }

    /// Build the OpenAI captioner described by the `openai` section.
    pub fn captioner(&self) -> OpenAiCaptioner {
        OpenAiCaptioner::new(self.openai.api_key.clone(), self.openai.model.clone())
            .with_api_base(self.openai.api_base.clone())
            .with_max_tokens(self.openai.max_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.openai.max_tokens, 300);
        assert_eq!(config.paths.input_dir, PathBuf::from("input"));
        assert_eq!(config.paths.output_dir, PathBuf::from("output"));
        assert_eq!(config.paths.logs_dir, PathBuf::from("logs"));
        assert!(!config.paths.recursive);
        assert_eq!(config.processing.concurrency, 4);
        assert_eq!(config.processing.max_dimension, 1024);
        assert_eq!(config.processing.jpeg_quality, 85);
        assert!(config.item_timeout().is_none());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(dir.path().join("absent.json").as_path())).unwrap();
        assert_eq!(config.processing.concurrency, 4);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "openai": { "api_key": "sk-file" },
                "processing": { "concurrency": 2, "item_timeout_secs": 30 }
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.openai.api_key, "sk-file");
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.processing.concurrency, 2);
        assert_eq!(config.processing.max_dimension, 1024);
        assert_eq!(config.item_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.paths.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(Some(path.as_path())).is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.paths.recursive = true;
        config.processing.concurrency = 7;
        config.save(Some(path.as_path())).unwrap();

        let loaded = Config::load(Some(path.as_path())).unwrap();
        assert!(loaded.paths.recursive);
        assert_eq!(loaded.processing.concurrency, 7);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config.openai.api_key = "sk-file".into();
        config
            .apply_env_from(env(&[("OPENAI_API_KEY", "sk-env"), ("CONCURRENCY", " 6 ")]))
            .unwrap();
        assert_eq!(config.openai.api_key, "sk-env");
        assert_eq!(config.processing.concurrency, 6);
    }

    #[test]
    fn blank_env_key_ignored() {
        let mut config = Config::default();
        config.openai.api_key = "sk-file".into();
        config.apply_env_from(env(&[("OPENAI_API_KEY", "  ")])).unwrap();
        assert_eq!(config.openai.api_key, "sk-file");
    }

    #[test]
    fn bad_concurrency_env_rejected() {
        let mut config = Config::default();
        assert!(config.apply_env_from(env(&[("CONCURRENCY", "0")])).is_err());
        assert!(config.apply_env_from(env(&[("CONCURRENCY", "-3")])).is_err());
        assert!(config.apply_env_from(env(&[("CONCURRENCY", "many")])).is_err());
        assert_eq!(config.processing.concurrency, 4);
    }

    #[test]
    fn validate_requires_api_key() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.openai.api_key = "sk-test".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.openai.api_key = "sk-test".into();
        config.processing.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn runner_from_processing_section() {
        let mut config = Config::default();
        config.processing.concurrency = 3;
        config.processing.item_timeout_secs = Some(12);
        let runner = config.runner().unwrap();
        assert_eq!(runner.concurrency(), 3);
        assert_eq!(runner.item_timeout(), Some(Duration::from_secs(12)));
    }
}
