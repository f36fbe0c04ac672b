use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DEFAULT_GROUP_PREFIX, DEFAULT_USER_AGENT, SCRAPE_REQUESTS_TOPIC, SCRAPE_RESULTS_TOPIC,
};
use crate::error::{Result, ScraperError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelConfig,
    pub kafka: KafkaConfig,
    pub storage: StorageConfig,
    pub scraper: ScraperConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelBackend {
    Memory,
    Sqlite,
    Kafka,
}

impl std::str::FromStr for ChannelBackend {
    type Err = ScraperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(ChannelBackend::Memory),
            "sqlite" => Ok(ChannelBackend::Sqlite),
            "kafka" => Ok(ChannelBackend::Kafka),
            other => Err(ScraperError::Config(format!("unknown channel backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub backend: ChannelBackend,
    /// SQLite file for the `sqlite` backend
    pub path: String,
    pub partitions: u32,
    pub requests_topic: String,
    pub results_topic: String,
    pub group_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backend: ChannelBackend::Sqlite,
            path: "channel.db".to_string(),
            partitions: 4,
            requests_topic: SCRAPE_REQUESTS_TOPIC.to_string(),
            results_topic: SCRAPE_RESULTS_TOPIC.to_string(),
            group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub session_timeout_ms: u64,
    pub message_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            username: None,
            password: None,
            session_timeout_ms: 6000,
            message_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://parts.db".to_string(),
            max_connections: 10,
            max_lifetime_secs: 60 * 60,
            idle_timeout_secs: 30 * 60,
            busy_timeout_ms: 5000,
        }
    }
}

impl StorageConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_pages: usize,
    pub concurrency: usize,
    pub requests_per_min: Option<u64>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_seconds: 30,
            max_pages: 500,
            concurrency: 4,
            requests_per_min: Some(120),
        }
    }
}

impl ScraperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn traversal_limits(&self) -> crate::pipeline::traversal::TraversalLimits {
        crate::pipeline::traversal::TraversalLimits {
            max_pages: self.max_pages,
            concurrency: self.concurrency,
        }
    }

    /// Fetch limits; in-flight requests are capped at the traversal concurrency.
    pub fn fetch_limits(&self) -> crate::infra::Limits {
        crate::infra::Limits {
            requests_per_min: self.requests_per_min,
            concurrency: Some(self.concurrency.max(1) as u32),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub scrape_workers: usize,
    pub ingest_workers: usize,
    pub poll_timeout_ms: u64,
    pub empty_poll_backoff_ms: u64,
    pub commit_policy: crate::pipeline::CommitPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scrape_workers: 1,
            ingest_workers: 1,
            poll_timeout_ms: 100,
            empty_poll_backoff_ms: 500,
            commit_policy: crate::pipeline::CommitPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn empty_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_poll_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub directory: String,
    pub file_prefix: String,
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "parts_finder=info,info".to_string(),
            directory: "logs".to_string(),
            file_prefix: "parts_finder.log".to_string(),
            file_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener address; no exporter when unset
    pub addr: Option<String>,
}

impl Config {
    /// Load `path` if it exists, otherwise start from defaults, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                ScraperError::Config(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from environment-style lookups.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(backend) = lookup("CHANNEL_BACKEND") {
            self.channel.backend = backend.parse()?;
        }
        if let Some(path) = lookup("CHANNEL_PATH") {
            self.channel.path = path;
        }
        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            self.kafka.brokers = brokers;
        }
        if let Some(username) = lookup("KAFKA_USERNAME") {
            self.kafka.username = Some(username);
        }
        if let Some(password) = lookup("KAFKA_PASSWORD") {
            self.kafka.password = Some(password);
        }
        if let Some(addr) = lookup("METRICS_ADDR") {
            self.metrics.addr = Some(addr);
        }
        Ok(())
    }

    pub fn requests_group(&self) -> String {
        crate::constants::group_id(&self.channel.group_prefix, &self.channel.requests_topic)
    }

    pub fn results_group(&self) -> String {
        crate::constants::group_id(&self.channel.group_prefix, &self.channel.results_topic)
    }
}
