//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Background ingestion timer
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Upstream fetch behavior
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Default circuit breaker policy
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Cache tier TTLs
    #[serde(default)]
    pub cache: CacheConfig,

    /// Embedded database settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Feed document defaults
    #[serde(default)]
    pub feed: FeedConfig,

    /// New-content notifications
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Look up a source by id.
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            return Err(AppError::validation("scheduler.interval_secs must be > 0"));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(AppError::validation("fetch.timeout_secs must be > 0"));
        }
        if self.fetch.max_concurrent == 0 {
            return Err(AppError::validation("fetch.max_concurrent must be > 0"));
        }
        if self.fetch.user_agent.trim().is_empty() {
            return Err(AppError::validation("fetch.user_agent is empty"));
        }
        self.breaker.validate("breaker")?;
        if self.cache.output_ttl_secs == 0 || self.cache.metadata_ttl_secs == 0 {
            return Err(AppError::validation("cache TTLs must be > 0"));
        }
        if self.feed.max_limit == 0 {
            return Err(AppError::validation("feed.max_limit must be > 0"));
        }
        if self.feed.default_limit == 0 || self.feed.default_limit > self.feed.max_limit {
            return Err(AppError::validation(
                "feed.default_limit must be between 1 and feed.max_limit",
            ));
        }
        url::Url::parse(&self.feed.link)?;
        if let Some(webhook) = &self.notify.webhook_url {
            url::Url::parse(webhook)?;
        }

        let id_pattern =
            Regex::new(SOURCE_ID_PATTERN).map_err(|e| AppError::config(e.to_string()))?;
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !id_pattern.is_match(&source.id) {
                return Err(AppError::validation(format!(
                    "source id '{}' may only contain letters, digits, '.', '_' and '-'",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            url::Url::parse(&source.url)?;
            if let Some(base) = &source.base_url {
                url::Url::parse(base)?;
            }
            if let Some(breaker) = &source.breaker {
                breaker.validate(&format!("sources.{}.breaker", source.id))?;
            }
        }
        Ok(())
    }
}

// Source ids become cache-key segments, so ':' must never appear in them.
const SOURCE_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

/// Background scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduled ingestion runs
    #[serde(default = "defaults::interval")]
    pub interval_secs: u64,

    /// Run once immediately when the scheduler starts
    #[serde(default = "defaults::run_on_start")]
    pub run_on_start: bool,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::interval(),
            run_on_start: defaults::run_on_start(),
        }
    }
}

/// Upstream fetch behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-call timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Maximum sources fetched at the same time
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            max_concurrent: defaults::max_concurrent(),
        }
    }
}

/// How the cooldown grows after repeated failed trial calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CooldownPolicy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Circuit breaker policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before allowing a trial
    #[serde(default = "defaults::cooldown")]
    pub cooldown_secs: u64,

    /// Growth of the cooldown after failed trials
    #[serde(default)]
    pub cooldown_policy: CooldownPolicy,

    /// Upper bound for a grown cooldown
    #[serde(default = "defaults::max_cooldown")]
    pub max_cooldown_secs: u64,
}

impl BreakerConfig {
    fn validate(&self, path: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(AppError::validation(format!(
                "{path}.failure_threshold must be > 0"
            )));
        }
        if self.max_cooldown_secs < self.cooldown_secs {
            return Err(AppError::validation(format!(
                "{path}.max_cooldown_secs must be >= cooldown_secs"
            )));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            cooldown_secs: defaults::cooldown(),
            cooldown_policy: CooldownPolicy::default(),
            max_cooldown_secs: defaults::max_cooldown(),
        }
    }
}

/// Cache tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of upstream metadata such as version tokens
    #[serde(default = "defaults::metadata_ttl")]
    pub metadata_ttl_secs: u64,

    /// TTL of rendered feed documents
    #[serde(default = "defaults::output_ttl")]
    pub output_ttl_secs: u64,

    /// Interval of the expired-entry sweeper (0 disables it)
    #[serde(default = "defaults::sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn output_ttl(&self) -> Duration {
        Duration::from_secs(self.output_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: defaults::metadata_ttl(),
            output_ttl_secs: defaults::output_ttl(),
            sweep_interval_secs: defaults::sweep_interval(),
        }
    }
}

/// Embedded database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "defaults::database_path")]
    pub database_path: String,

    /// Connection pool size
    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: defaults::database_path(),
            max_connections: defaults::max_connections(),
        }
    }
}

/// Feed document defaults, used when a source does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "defaults::feed_title")]
    pub title: String,

    /// Channel link, also the base for relative item links
    #[serde(default = "defaults::feed_link")]
    pub link: String,

    #[serde(default = "defaults::feed_description")]
    pub description: String,

    #[serde(default)]
    pub language: Option<String>,

    /// Items returned when the caller does not ask for a count
    #[serde(default = "defaults::default_limit")]
    pub default_limit: usize,

    /// Hard cap on items per document
    #[serde(default = "defaults::max_limit")]
    pub max_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            title: defaults::feed_title(),
            link: defaults::feed_link(),
            description: defaults::feed_description(),
            language: None,
            default_limit: defaults::default_limit(),
            max_limit: defaults::max_limit(),
        }
    }
}

/// New-content notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// POST a JSON payload here when a source gains new items
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "defaults::notify_timeout")]
    pub timeout_secs: u64,

    /// Attempts per notification, including the first
    #[serde(default = "defaults::notify_retries")]
    pub max_retries: u8,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: defaults::notify_timeout(),
            max_retries: defaults::notify_retries(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// One upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier, e.g. a locale such as "en-us"
    pub id: String,

    /// Item endpoint; `{version}` is replaced with the version token
    pub url: String,

    /// Endpoint returning the upstream version token as plain text
    #[serde(default)]
    pub version_url: Option<String>,

    /// Base for resolving relative item links
    #[serde(default)]
    pub base_url: Option<String>,

    /// Feed title override
    #[serde(default)]
    pub title: Option<String>,

    /// Feed description override
    #[serde(default)]
    pub description: Option<String>,

    /// Feed language, e.g. "en-US"
    #[serde(default)]
    pub language: Option<String>,

    /// Breaker policy override
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            version_url: None,
            base_url: None,
            title: None,
            description: None,
            language: None,
            breaker: None,
        }
    }
}

mod defaults {
    // Scheduler defaults
    pub fn interval() -> u64 {
        900
    }
    pub fn run_on_start() -> bool {
        true
    }

    // Fetch defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; feedhub/0.1)".into()
    }
    pub fn timeout() -> u64 {
        20
    }
    pub fn max_concurrent() -> usize {
        4
    }

    // Breaker defaults
    pub fn failure_threshold() -> u32 {
        3
    }
    pub fn cooldown() -> u64 {
        300
    }
    pub fn max_cooldown() -> u64 {
        3600
    }

    // Cache defaults
    pub fn metadata_ttl() -> u64 {
        3600
    }
    pub fn output_ttl() -> u64 {
        300
    }
    pub fn sweep_interval() -> u64 {
        60
    }

    // Storage defaults
    pub fn database_path() -> String {
        "data/feedhub.db".into()
    }
    pub fn max_connections() -> u32 {
        5
    }

    // Feed defaults
    pub fn feed_title() -> String {
        "feedhub".into()
    }
    pub fn feed_link() -> String {
        "http://localhost/".into()
    }
    pub fn feed_description() -> String {
        "Aggregated content feed".into()
    }
    pub fn default_limit() -> usize {
        50
    }
    pub fn max_limit() -> usize {
        200
    }

    // Notify defaults
    pub fn notify_timeout() -> u64 {
        5
    }
    pub fn notify_retries() -> u8 {
        3
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
