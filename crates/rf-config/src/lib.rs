//! # rf-config
//!
//! Layered settings: built-in defaults, then an optional
//! `config/rusty-forum.{toml,yaml,json}`, then `RF__SECTION__KEY`
//! environment variables. `.env` is read into the environment first.

use std::time::Duration;

use config::{Config, Environment, File};
use rf_core::jobs::{Backoff, JobKind, JobOptions};
use secrecy::SecretString;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "RF";
pub const DEFAULT_CONFIG_FILE: &str = "config/rusty-forum";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Jobs survive restarts in the `jobs` table
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_format: LogFormat,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub queues: QueueSettings,
    pub classifier: ServiceSettings,
    pub summarizer: ServiceSettings,
    pub webhook: WebhookSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub redis_url: Option<SecretString>,
    pub list_ttl_secs: u64,
    pub detail_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub moderation: String,
    pub summary: String,
    pub notification: String,
    pub moderation_concurrency: usize,
    pub summary_concurrency: usize,
    pub notification_concurrency: usize,
    pub default_attempts: u32,
    pub backoff_ms: u64,
    pub notification_retry_limit: u32,
    pub notification_backoff_ms: u64,
    pub poll_interval_ms: u64,
}

/// Outbound AI service (classifier or summarizer).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// No URL means notification jobs complete without delivery
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:rusty_forum.db".into(),
            max_connections: 5,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: None,
            list_ttl_secs: 60,
            detail_ttl_secs: 45,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            moderation: JobKind::Moderation.default_queue().into(),
            summary: JobKind::Summary.default_queue().into(),
            notification: JobKind::Notification.default_queue().into(),
            moderation_concurrency: 5,
            summary_concurrency: 2,
            notification_concurrency: 3,
            default_attempts: 3,
            backoff_ms: 2_000,
            notification_retry_limit: 5,
            notification_backoff_ms: 5_000,
            poll_interval_ms: 500,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            model: String::new(),
            timeout_ms: 10_000,
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self { url: None, timeout_ms: 5_000 }
    }
}

impl Settings {
    /// Loads `.env`, the optional config file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_sources(DEFAULT_CONFIG_FILE, Environment::with_prefix(ENV_PREFIX))
    }

    /// Builds settings from an explicit file stem and environment source.
    pub fn from_sources(file: &str, env: Environment) -> Result<Self, ConfigError> {
        // Per-service defaults live here: a partially configured section
        // would otherwise fall back to the generic struct default.
        let settings: Settings = Config::builder()
            .set_default("classifier.endpoint", "https://api.openai.com/v1/moderations")?
            .set_default("classifier.model", "omni-moderation-latest")?
            .set_default("summarizer.endpoint", "https://api.openai.com/v1/responses")?
            .set_default("summarizer.model", "gpt-4o-mini")?
            .set_default("summarizer.timeout_ms", 20_000)?
            .add_source(File::with_name(file).required(false))
            .add_source(env.prefix_separator("__").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queues;
        if q.moderation_concurrency == 0 || q.summary_concurrency == 0 || q.notification_concurrency == 0 {
            return Err(ConfigError::Invalid("queue concurrency must be at least 1".into()));
        }
        if q.default_attempts == 0 || q.notification_retry_limit == 0 {
            return Err(ConfigError::Invalid("job attempts must be at least 1".into()));
        }
        if [&q.moderation, &q.summary, &q.notification].iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid("queue names cannot be empty".into()));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(ConfigError::Invalid("cache.redis_url is required for the redis backend".into()));
        }
        Ok(())
    }
}

impl CacheSettings {
    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_ttl_secs)
    }
}

impl QueueSettings {
    pub fn name(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Moderation => &self.moderation,
            JobKind::Summary => &self.summary,
            JobKind::Notification => &self.notification,
        }
    }

    pub fn concurrency(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Moderation => self.moderation_concurrency,
            JobKind::Summary => self.summary_concurrency,
            JobKind::Notification => self.notification_concurrency,
        }
    }

    /// Enqueue options per kind. Notifications carry their own retry limit.
    pub fn job_options(&self, kind: JobKind) -> JobOptions {
        match kind {
            JobKind::Notification => JobOptions {
                attempts: self.notification_retry_limit,
                backoff: Backoff::Exponential { delay_ms: self.notification_backoff_ms },
                remove_on_complete: true,
            },
            _ => JobOptions {
                attempts: self.default_attempts,
                backoff: Backoff::Exponential { delay_ms: self.backoff_ms },
                remove_on_complete: true,
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ServiceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WebhookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
