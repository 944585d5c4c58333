/*!
common/src/lib.rs

Shared configuration types for Feedscope.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default file with an override file
- The feed-configuration source consumed by the worker loop
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default worker cycle length (15 minutes).
pub const DEFAULT_WORKER_INTERVAL_SECS: u64 = 15 * 60;
/// Worker cycles never run more often than this.
pub const MIN_WORKER_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_RETENTION_DAYS: u32 = 5;
pub const DEFAULT_FEED_SNAPSHOT_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_USER_AGENT: &str = "Feedscope/0.1.0";

/// Storage backend configuration section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the local store; one JSON document per table (default "data")
    pub local_dir: Option<String>,
    /// Name of the env var holding the remote table-service connection string.
    /// When the variable is set and non-empty the remote backend is used.
    pub remote_connection_string_env: Option<String>,
    pub feeds_table: Option<String>,
    pub items_table: Option<String>,
}

/// Worker loop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub interval_seconds: Option<u64>,
}

/// Feed fetching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub feed_snapshot_ttl_seconds: Option<u64>,
}

/// Remote LLM config (OpenAI-compatible chat completion endpoint)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    /// Total tries per request, the first one included.
    pub max_attempts: Option<u32>,
}

/// Simple feed descriptor used in the configured feed list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub title: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Worker cycle length, clamped to the 10 second floor.
    pub fn worker_interval(&self) -> Duration {
        let secs = self.worker.interval_seconds.unwrap_or(DEFAULT_WORKER_INTERVAL_SECS);
        Duration::from_secs(secs.max(MIN_WORKER_INTERVAL_SECS))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_seconds.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS))
    }

    pub fn user_agent(&self) -> String {
        self.fetch.user_agent.clone().unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn retention_days(&self) -> u32 {
        self.retention.days.unwrap_or(DEFAULT_RETENTION_DAYS)
    }

    pub fn feed_snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.feed_snapshot_ttl_seconds.unwrap_or(DEFAULT_FEED_SNAPSHOT_TTL_SECS))
    }

    /// Remote connection string, if the configured env var is set and non-empty.
    pub fn remote_connection_string(&self) -> Option<String> {
        let var = self.storage.remote_connection_string_env.as_deref()?;
        std::env::var(var).ok().filter(|s| !s.trim().is_empty())
    }

    pub fn local_store_dir(&self) -> PathBuf {
        PathBuf::from(self.storage.local_dir.as_deref().unwrap_or("data"))
    }

    pub fn feeds_table(&self) -> String {
        self.storage.feeds_table.clone().unwrap_or_else(|| "feeds".to_string())
    }

    pub fn items_table(&self) -> String {
        self.storage.items_table.clone().unwrap_or_else(|| "feeditems".to_string())
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

/// Source of the feed list the worker refreshes each cycle.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn feed_configs(&self) -> Result<Vec<FeedConfig>>;
}

/// Feed list fixed at startup.
pub struct StaticFeedSource {
    feeds: Vec<FeedConfig>,
}

impl StaticFeedSource {
    pub fn new(feeds: Vec<FeedConfig>) -> Self {
        Self { feeds }
    }
}

#[async_trait::async_trait]
impl FeedSource for StaticFeedSource {
    async fn feed_configs(&self) -> Result<Vec<FeedConfig>> {
        Ok(self.feeds.clone())
    }
}

/// Re-reads `[[feeds]]` from a TOML file on every call, so edits are picked
/// up on the next worker cycle without a restart.
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl FeedSource for FileFeedSource {
    async fn feed_configs(&self) -> Result<Vec<FeedConfig>> {
        let cfg = Config::from_file(&self.path).await?;
        Ok(cfg.feeds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_string_with_defaults() {
        let toml = r#"
            [worker]
            interval_seconds = 3

            [[feeds]]
            url = "https://example.com/feed.xml"
            title = "Example"
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.feeds.len(), 1);
        assert_eq!(cfg.feeds[0].url, "https://example.com/feed.xml");
        // below the floor
        assert_eq!(cfg.worker_interval(), Duration::from_secs(MIN_WORKER_INTERVAL_SECS));
        assert_eq!(cfg.fetch_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.retention_days(), 5);
        assert!(cfg.llm.is_none());
    }

    #[test]
    fn llm_section_reads_attempt_count() {
        let toml = r#"
            [llm]
            api_url = "http://localhost/v1/chat/completions"
            max_attempts = 2
        "#;
        let cfg: Config = toml::from_str(toml).expect("parse llm config");
        let llm = cfg.llm.expect("llm section");
        assert_eq!(llm.max_attempts, Some(2));
        assert_eq!(llm.max_tokens, None);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").expect("parse empty config");
        assert_eq!(cfg.worker_interval(), Duration::from_secs(DEFAULT_WORKER_INTERVAL_SECS));
        assert_eq!(cfg.feed_snapshot_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.local_store_dir(), PathBuf::from("data"));
        assert_eq!(cfg.items_table(), "feeditems");
        assert!(cfg.remote_connection_string().is_none());
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");

        tokio::fs::write(&default_path, "[fetch]\ntimeout_seconds = 20\nuser_agent = \"a\"\n")
            .await
            .unwrap();
        tokio::fs::write(&override_path, "[fetch]\ntimeout_seconds = 5\n")
            .await
            .unwrap();

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");
        assert_eq!(cfg.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.user_agent(), "a");
    }

    #[tokio::test]
    async fn file_feed_source_rereads_feeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feeds.toml");
        tokio::fs::write(&path, "[[feeds]]\nurl = \"http://a/feed\"\n").await.unwrap();

        let source = FileFeedSource::new(&path);
        assert_eq!(source.feed_configs().await.unwrap().len(), 1);

        tokio::fs::write(&path, "[[feeds]]\nurl = \"http://a/feed\"\n[[feeds]]\nurl = \"http://b/feed\"\n")
            .await
            .unwrap();
        let feeds = source.feed_configs().await.unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[1].url, "http://b/feed");
    }
}
