/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Newsdigest.

This file provides:
- Core configuration data structures (deserialized from TOML)
- An async loader with default-file / override-file merging
- A helper to initialize an SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsdigest.db")
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/newsdigest.db".to_string(),
        }
    }
}

/// Pipeline concurrency and budget configuration.
///
/// The parallelism caps are per-request; process-wide protection is the
/// concern of the surrounding HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max concurrent feed fetches per request
    pub feed_parallelism: usize,
    /// Max concurrent article extractions per request
    pub article_parallelism: usize,
    /// Max concurrent LLM calls per request
    pub llm_parallelism: usize,
    /// Per-feed fetch budget in seconds
    pub fetch_timeout_secs: u64,
    /// Per-article extraction budget in seconds
    pub extract_timeout_secs: u64,
    /// Per-summary LLM budget in seconds
    pub llm_timeout_secs: u64,
    /// End-to-end request budget in seconds
    pub request_deadline_secs: u64,
    /// Absolute article cap regardless of what the caller asks for
    pub max_articles_hard: usize,
    /// Request-replay cache lifetime in seconds
    pub idempotency_window_secs: u64,
    /// Request-replay cache capacity
    pub idempotency_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feed_parallelism: 8,
            article_parallelism: 6,
            llm_parallelism: 3,
            fetch_timeout_secs: 15,
            extract_timeout_secs: 20,
            llm_timeout_secs: 60,
            request_deadline_secs: 300,
            max_articles_hard: 50,
            idempotency_window_secs: 60,
            idempotency_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

/// LLM configuration (model, prompt-size caps)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier passed through to the LLM client
    pub model: String,
    /// Soft truncation boundary for LLM input, in characters.
    /// Truncation backtracks to a sentence boundary at or before this point.
    pub body_soft_cap: usize,
    /// Hard truncation for LLM input, in characters
    pub body_hard_cap: usize,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            body_soft_cap: 4000,
            body_hard_cap: 6000,
            max_tokens: 500,
            temperature: 0.3,
        }
    }
}

/// Article extraction configuration (C3 content-selection policy inputs)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Body selectors tried, in order, after the `<article>` element.
    pub body_selectors: Vec<String>,
    /// Substring patterns marking ad containers; elements whose class
    /// attribute matches any of these are dropped during text collection.
    pub ad_class_patterns: Vec<String>,
    /// Minimum normalized body length for an extraction to count as successful
    pub min_body_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            body_selectors: vec![
                "div#articleBody".to_string(),
                "div.article_body".to_string(),
                "div#articleBodyContents".to_string(),
                "div#newsEndContents".to_string(),
                "div.article_view".to_string(),
                "div#articeBody".to_string(),
                "div#news_body_area".to_string(),
                "div#content".to_string(),
                "div.news_content".to_string(),
            ],
            ad_class_patterns: vec![
                "ad_".to_string(),
                "-ad".to_string(),
                "advert".to_string(),
                "banner".to_string(),
                "promotion".to_string(),
                "sponsor".to_string(),
                "related_news".to_string(),
                "copyright".to_string(),
            ],
            min_body_chars: 100,
        }
    }
}

/// Recommender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    /// History look-back window in days
    pub window_days: i64,
    /// Entries taken per source for the trending fallback
    pub trending_per_source: usize,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            trending_per_source: 2,
        }
    }
}

/// A curated feed source entry as it appears in config TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSourceConfig {
    pub name: String,
    pub category: String,
    pub rss_url: String,
}

/// Top-level core configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub extraction: ExtractionConfig,
    pub recommend: RecommendConfig,
    /// Extra feed sources merged into the built-in registry
    pub feeds: Vec<FeedSourceConfig>,
}

impl CoreConfig {
    /// Load configuration from a TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: CoreConfig = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: CoreConfig = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary, ensures the DB file exists,
/// and returns a configured `SqlitePool` in WAL mode. Pass `":memory:"` for
/// an in-memory database (used by tests).
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    let url = if path == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create DB parent directory: {}", parent.display())
                })?;
            }
        }
        format!("sqlite://{}", path)
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    // An in-memory database exists per connection, so the pool must not
    // fan out across connections there.
    let max_connections = if path == ":memory:" { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
