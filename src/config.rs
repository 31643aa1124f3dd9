use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::MAX_WRITE_CHUNK;
use crate::retry::RetryPolicy;
use crate::scheduler::BatchConfig;

/// Upper bound for any configured retry delay (one day).
const MAX_RETRY_DELAY_SECS: f64 = 86_400.0;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
            search_limit: default_search_limit(),
            page_size: default_page_size(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.spotify.com/v1".to_string()
}
fn default_token_env() -> String {
    "CATALOG_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_search_limit() -> usize {
    10
}
fn default_page_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs_f64(self.base_delay_secs),
            max_delay: Duration::from_secs_f64(self.max_delay_secs),
            backoff_factor: self.backoff_factor,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_secs() -> f64 {
    1.0
}
fn default_max_delay_secs() -> f64 {
    60.0
}
fn default_backoff_factor() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}
fn default_max_age_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
        }
    }
}

impl BatchSection {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_workers: self.max_workers,
            batch_size: self.batch_size,
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
        }
    }
}

fn default_max_workers() -> usize {
    2
}
fn default_batch_size() -> usize {
    5
}
fn default_inter_batch_delay_ms() -> u64 {
    2500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
    #[serde(default)]
    pub audit_path: Option<PathBuf>,
    /// Loaded at start and flushed at the end of a run when set.
    #[serde(default)]
    pub memo_path: Option<PathBuf>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            write_chunk_size: default_write_chunk_size(),
            audit_path: None,
            memo_path: None,
        }
    }
}

fn default_write_chunk_size() -> usize {
    MAX_WRITE_CHUNK
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate catalog
    if config.catalog.base_url.trim().is_empty() {
        anyhow::bail!("catalog.base_url must not be empty");
    }
    if !(1..=50).contains(&config.catalog.search_limit) {
        anyhow::bail!("catalog.search_limit must be in [1, 50]");
    }
    if !(1..=100).contains(&config.catalog.page_size) {
        anyhow::bail!("catalog.page_size must be in [1, 100]");
    }

    // Validate retry
    // NaN fails every range check below.
    if !(config.retry.backoff_factor.is_finite() && config.retry.backoff_factor >= 1.0) {
        anyhow::bail!("retry.backoff_factor must be a finite number >= 1.0");
    }
    if !(0.0..=MAX_RETRY_DELAY_SECS).contains(&config.retry.base_delay_secs) {
        anyhow::bail!(
            "retry.base_delay_secs must be in [0, {}]",
            MAX_RETRY_DELAY_SECS
        );
    }
    if !(0.0..=MAX_RETRY_DELAY_SECS).contains(&config.retry.max_delay_secs) {
        anyhow::bail!(
            "retry.max_delay_secs must be in [0, {}]",
            MAX_RETRY_DELAY_SECS
        );
    }
    if config.retry.max_delay_secs < config.retry.base_delay_secs {
        anyhow::bail!("retry.max_delay_secs must be >= retry.base_delay_secs");
    }

    // Validate batch
    if config.batch.max_workers == 0 {
        anyhow::bail!("batch.max_workers must be >= 1");
    }
    if config.batch.batch_size == 0 {
        anyhow::bail!("batch.batch_size must be >= 1");
    }

    // Validate reconcile
    if !(1..=MAX_WRITE_CHUNK).contains(&config.reconcile.write_chunk_size) {
        anyhow::bail!(
            "reconcile.write_chunk_size must be in [1, {}]",
            MAX_WRITE_CHUNK
        );
    }

    Ok(())
}
