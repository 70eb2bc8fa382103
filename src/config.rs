//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` and `[server]` has defaults, so a minimal
//! file only needs a database path and a bind address:
//!
//! ```toml
//! [db]
//! path = "./data/synopsis.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:5000"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub summaries: SummariesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long SQLite itself waits on a locked database before returning
    /// `SQLITE_BUSY` to the store's retry loop.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Attempts for a SQLite write that keeps hitting a locked database.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    20
}

/// Job scheduling limits.
///
/// At most `workers` pipelines run at once. Accepted jobs wait in a channel
/// of `queue_capacity` slots; when it is full, up to `overflow_capacity`
/// further jobs wait for a slot in the background. Past that, submissions
/// are refused with `503 unavailable` and the new summary is marked
/// `failed`.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_overflow_capacity")]
    pub overflow_capacity: usize,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            overflow_capacity: default_overflow_capacity(),
            max_chunk_tokens: default_max_chunk_tokens(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_overflow_capacity() -> usize {
    1024
}
fn default_max_chunk_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummariesConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_supported_languages")]
    pub supported_languages: Vec<String>,
    /// Sources with fewer words are accepted with a warning.
    #[serde(default = "default_min_words_source")]
    pub min_words_source: usize,
    /// Below this confidence a detected language is not trusted and the
    /// default language is assumed.
    #[serde(default = "default_language_confidence_threshold")]
    pub language_confidence_threshold: f64,
}

impl Default for SummariesConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            models: default_models(),
            supported_languages: default_supported_languages(),
            min_words_source: default_min_words_source(),
            language_confidence_threshold: default_language_confidence_threshold(),
        }
    }
}

impl SummariesConfig {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.supported_languages.iter().any(|l| l == language)
    }

    /// The language assumed when none is given and detection is unsure.
    pub fn default_language(&self) -> &str {
        self.supported_languages
            .first()
            .map(String::as_str)
            .unwrap_or("en")
    }
}

fn default_model() -> String {
    "t5".to_string()
}
fn default_models() -> Vec<String> {
    vec!["t5".to_string()]
}
fn default_supported_languages() -> Vec<String> {
    vec!["en".to_string()]
}
fn default_min_words_source() -> usize {
    20
}
fn default_language_confidence_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// In-memory configuration that needs no file on disk.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig::new("./data/synopsis.sqlite"),
            server: ServerConfig {
                bind: "127.0.0.1:5000".to_string(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                ..StoreConfig::default()
            },
            pipeline: PipelineConfig::default(),
            summaries: SummariesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }
    if config.pipeline.queue_capacity == 0 {
        anyhow::bail!("pipeline.queue_capacity must be > 0");
    }
    if config.pipeline.max_chunk_tokens == 0 {
        anyhow::bail!("pipeline.max_chunk_tokens must be > 0");
    }
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }
    if config.store.max_retries == 0 {
        anyhow::bail!("store.max_retries must be >= 1");
    }

    let summaries = &config.summaries;
    if summaries.models.is_empty() {
        anyhow::bail!("summaries.models must list at least one model");
    }
    if !summaries.supports_model(&summaries.default_model) {
        anyhow::bail!(
            "summaries.default_model '{}' is not listed in summaries.models",
            summaries.default_model
        );
    }
    if summaries.supported_languages.is_empty() {
        anyhow::bail!("summaries.supported_languages must not be empty");
    }
    if !(0.0..=1.0).contains(&summaries.language_confidence_threshold) {
        anyhow::bail!("summaries.language_confidence_threshold must be in [0.0, 1.0]");
    }

    Ok(())
}
