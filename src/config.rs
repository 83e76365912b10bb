use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub content: ContentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub versions: VersionsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    /// Directory holding one sub-directory per collection (`posts/`, `pages/`).
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.markdown".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Documents fetched per backfill call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent provider calls within one backfill batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Characters of `title + content` sent to the provider.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 10,
            concurrency: 4,
            max_input_chars: 8000,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    4
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VersionsConfig {
    /// Initial value of the retention toggle. The server can flip it at runtime.
    #[serde(default = "default_versions_enabled")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 3,
            purge_interval_secs: 3600,
        }
    }
}

fn default_versions_enabled() -> bool {
    true
}
fn default_retention_days() -> i64 {
    3
}
fn default_purge_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Lines buffered between a running step and its reader before the
    /// step is made to wait.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_stream_buffer() -> usize {
    64
}

impl Config {
    /// A config with defaults everywhere and relative paths, for tests and
    /// in-process embedding.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/csync.sqlite"),
            },
            content: ContentConfig {
                root: PathBuf::from("./content"),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            embedding: EmbeddingConfig::default(),
            versions: VersionsConfig::default(),
            server: ServerConfig::default(),
            runner: RunnerConfig::default(),
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

fn validate(config: &Config) -> Result<()> {
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }
    if config.embedding.max_input_chars == 0 {
        anyhow::bail!("embedding.max_input_chars must be > 0");
    }
    if config.versions.retention_days < 1 {
        anyhow::bail!("versions.retention_days must be >= 1");
    }
    if config.runner.stream_buffer == 0 {
        anyhow::bail!("runner.stream_buffer must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}
