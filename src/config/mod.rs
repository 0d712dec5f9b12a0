//! Application configuration.
//!
//! One `Config` struct covering the store client, repositories,
//! subscriptions and reconnect backoff. Loaded from YAML files and
//! `TESSERA__`-prefixed environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::client::PersistentSettings;
use crate::repository::DeleteMode;
use crate::subscription::DEFAULT_BUFFER_SIZE;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TESSERA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TESSERA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TESSERA_LOG";

/// Default soft-delete method name.
pub const DEFAULT_SOFT_DELETE_METHOD: &str = "mark_as_deleted";

/// Smallest accepted persistent message timeout.
pub const MIN_MESSAGE_TIMEOUT_SECS: u64 = 10;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub repository: RepositoryConfig,
    pub subscription: SubscriptionConfig,
    pub retry: RetryConfig,
}

/// Which store client to build.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Client type: `memory` or `eventstoredb`.
    pub store_type: String,
    /// EventStoreDB-specific configuration.
    pub eventstoredb: EventStoreDbConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: "memory".to_string(),
            eventstoredb: EventStoreDbConfig::default(),
        }
    }
}

/// EventStoreDB-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventStoreDbConfig {
    /// EventStoreDB connection string.
    pub connection_string: String,
}

impl Default for EventStoreDbConfig {
    fn default() -> Self {
        Self {
            connection_string: "esdb://localhost:2113?tls=false".to_string(),
        }
    }
}

/// Per-repository settings, supplied at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Stream category; defaults to the aggregate's type name.
    pub category: Option<String>,
    pub delete_mode: DeleteMode,
    /// Name of the soft-delete operation the aggregate must provide.
    pub soft_delete_method: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            category: None,
            delete_mode: DeleteMode::default(),
            soft_delete_method: DEFAULT_SOFT_DELETE_METHOD.to_string(),
        }
    }
}

/// Subscription and consumer group settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub consumer_group: Option<String>,
    pub min_checkpoint_count: u32,
    pub max_checkpoint_count: u32,
    pub message_timeout_secs: u64,
    pub max_retry_count: u32,
    pub buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        let settings = PersistentSettings::default();
        Self {
            consumer_group: None,
            min_checkpoint_count: settings.min_checkpoint_count,
            max_checkpoint_count: settings.max_checkpoint_count,
            message_timeout_secs: settings.message_timeout.as_secs(),
            max_retry_count: settings.max_retry_count,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl SubscriptionConfig {
    pub fn persistent_settings(&self) -> PersistentSettings {
        PersistentSettings {
            start_from: 0,
            min_checkpoint_count: self.min_checkpoint_count,
            max_checkpoint_count: self.max_checkpoint_count,
            message_timeout: Duration::from_secs(self.message_timeout_secs),
            max_retry_count: self.max_retry_count,
        }
    }
}

/// Reconnect backoff for subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before a subscription gives up.
    pub max_times: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            max_times: 30,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that break the ack protocol.
    ///
    /// Checkpoint batching must be exactly one: batched acks that were queued
    /// but never flushed are indistinguishable from lost deliveries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sub = &self.subscription;
        if sub.min_checkpoint_count != 1 || sub.max_checkpoint_count != 1 {
            return Err(ConfigError::Invalid(format!(
                "checkpoint counts must be 1 (got min {}, max {})",
                sub.min_checkpoint_count, sub.max_checkpoint_count
            )));
        }
        if sub.message_timeout_secs < MIN_MESSAGE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "message_timeout_secs must be at least {MIN_MESSAGE_TIMEOUT_SECS} (got {})",
                sub.message_timeout_secs
            )));
        }
        if sub.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".to_string()));
        }
        if self.repository.delete_mode == DeleteMode::Soft
            && self.repository.soft_delete_method.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "soft delete requires soft_delete_method".to_string(),
            ));
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry min_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}
