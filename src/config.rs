//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default, config/local)
//! 3. Environment variables (override)
//!
//! Environment variables are split on `_`, so `API_WRITER_BATCH_SIZE`
//! lands on `api.writer.batch.size`. Only the `API_`, `DB_` and `LOG_`
//! families are read.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub db: DbConfig,
    pub log: LogConfig,
}

/// Everything under `API_*`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub http: HttpConfig,
    /// Internal source-management API port
    pub port: u16,
    pub writer: WriterConfig,
    pub queue: QueueConfig,
    pub callback: CallbackConfig,
    pub actor: ActorConfig,
    pub key: KeyConfig,
    pub source: SourceConfig,
}

/// Public HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Public host name of this bridge (e.g., "activitypub.example.com")
    pub host: String,
    /// Listen port
    pub port: u16,
}

/// Internal bus writer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    pub uri: String,
    /// Total retry budget for a single write
    #[serde(deserialize_with = "deserialize_duration")]
    pub backoff: Duration,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
}

/// Internal bus queue configuration. An empty `uri` disables the consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub uri: String,
    pub name: String,
    pub subj: String,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub size: u32,
}

/// LRU capacity plus entry lifetime
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    pub topic: TopicConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Accepted `hub.topic` prefix
    pub prefix: String,
}

/// Shared actor identity
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// preferredUsername of the shared actor
    pub name: String,
}

/// PEM keys used by every local actor
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    pub public: String,
    pub private: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub cache: CacheConfig,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub uri: String,
    pub table: TableConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error (or -4, 0, 4, 8)
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl HttpConfig {
    /// Get the base URL for the bridge
    ///
    /// # Returns
    /// Full URL like "https://activitypub.example.com"
    pub fn base_url(&self) -> String {
        format!("https://{}", self.host)
    }
}

impl LogConfig {
    /// Translate the configured level into an `EnvFilter` directive.
    ///
    /// Numeric levels follow the slog convention.
    pub fn filter_directive(&self) -> &'static str {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" | "-4" => "debug",
            "warn" | "warning" | "4" => "warn",
            "error" | "8" => "error",
            _ => "info",
        }
    }
}

const ENV_FAMILIES: [&str; 3] = ["API_", "DB_", "LOG_"];

impl AppConfig {
    /// Load configuration from files and the process environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (API_*, DB_*, LOG_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        Self::load_from(std::env::vars())
    }

    /// Same as [`AppConfig::load`] with an explicit set of variables.
    pub fn load_from<I>(vars: I) -> Result<Self, crate::error::AppError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        use config::{Config, Environment, File};

        let env: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| ENV_FAMILIES.iter().any(|p| k.starts_with(p)))
            .collect();

        let config = Config::builder()
            // Start with default values
            .set_default("api.http.host", "localhost")?
            .set_default("api.http.port", 8080)?
            .set_default("api.port", 50051)?
            .set_default("api.writer.uri", "ws://writer:50051/v1")?
            .set_default("api.writer.backoff", "10s")?
            .set_default("api.writer.batch.size", 16)?
            .set_default("api.writer.cache.size", 1024)?
            .set_default("api.writer.cache.ttl", "24h")?
            .set_default("api.queue.uri", "")?
            .set_default("api.queue.name", "int-activitypub")?
            .set_default("api.queue.subj", "follow-notifications")?
            .set_default("api.queue.batch.size", 16)?
            .set_default("api.callback.topic.prefix", "https://localhost/v1/sub/")?
            .set_default("api.actor.name", "bridge")?
            .set_default("api.source.cache.size", 1000)?
            .set_default("api.source.cache.ttl", "1m")?
            .set_default("db.uri", "sqlite://int-activitypub.db?mode=rwc")?
            .set_default("db.table.name", "sources")?
            .set_default("log.level", "info")?
            .set_default("log.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .source(Some(env)),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.api.http.host.trim().is_empty() {
            return Err(AppError::Config("api.http.host must not be empty".to_string()));
        }

        if !is_identifier(&self.db.table.name) {
            return Err(AppError::Config(format!(
                "db.table.name {:?} is not a valid identifier",
                self.db.table.name
            )));
        }

        if self.api.writer.cache.size == 0 || self.api.source.cache.size == 0 {
            return Err(AppError::Config(
                "cache sizes must be greater than 0".to_string(),
            ));
        }

        if self.api.writer.batch.size == 0 || self.api.queue.batch.size == 0 {
            return Err(AppError::Config(
                "batch sizes must be greater than 0".to_string(),
            ));
        }

        if self.api.key.public.trim().is_empty() || self.api.key.private.trim().is_empty() {
            return Err(AppError::Config(
                "api.key.public and api.key.private are required".to_string(),
            ));
        }

        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse durations like `100ms`, `10s`, `1m30s` or `24h`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return None,
        };
        total += part;
        rest = &rest[unit..];
    }
    Some(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {text:?}"))),
    }
}
