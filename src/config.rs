use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,
    /// Issues per detail-fetch request.
    #[serde(default = "default_tracker_batch_size")]
    pub batch_size: usize,
    /// Comments fetched per issue.
    #[serde(default = "default_comment_limit")]
    pub comment_limit: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            graphql_url: default_graphql_url(),
            batch_size: default_tracker_batch_size(),
            comment_limit: default_comment_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_graphql_url() -> String {
    "https://api.github.com/graphql".to_string()
}
fn default_tracker_batch_size() -> usize {
    100
}
fn default_comment_limit() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// The service's native maximum dimensionality. Vectors requested at this
    /// dimension are assumed pre-scaled and are not unit-normalized.
    #[serde(default = "default_native_dims")]
    pub native_dims: usize,
    /// Texts per embed call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rate-limit retry attempts per batch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Token budget for the canonical text of a single issue.
    #[serde(default = "default_max_token_limit")]
    pub max_token_limit: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: default_dims(),
            native_dims: default_native_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_token_limit: default_max_token_limit(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_native_dims() -> usize {
    3072
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_token_limit() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Character budget applied before exact token counting.
    pub fn max_chars(&self) -> usize {
        self.max_token_limit * 6
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.db.url.trim().is_empty() {
        anyhow::bail!("db.url must not be empty");
    }

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    if config.tracker.batch_size == 0 {
        anyhow::bail!("tracker.batch_size must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims == 0 {
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
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if config.embedding.max_token_limit == 0 {
            anyhow::bail!("embedding.max_token_limit must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "gemini" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or gemini.",
            other
        ),
    }

    Ok(config)
}
