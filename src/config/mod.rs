//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod delivery;
mod messaging;
mod storage;

pub use delivery::{DispatchConfig, OutboxConfig, MIN_POLL_INTERVAL};
pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};
pub use storage::{StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relaybus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAYBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAYBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAYBUS_LOG";

use serde::Deserialize;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Service identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service-level queue name; broker queue names derive from it.
    pub queue_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_name: "relaybus".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Queue holding messages that exhausted their deliveries.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead-letter", self.queue_name)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub messaging: MessagingConfig,
    pub outbox: OutboxConfig,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relaybus.yaml` in current directory (if exists)
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

    /// Reject values the bus cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service.queue_name is empty".into()));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size must be > 0".into()));
        }
        if self.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid("outbox.max_attempts must be > 0".into()));
        }
        if self.dispatch.max_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_deliveries must be > 0".into(),
            ));
        }
        if self.messaging.amqp.consumer_channels == 0 {
            return Err(ConfigError::Invalid(
                "messaging.amqp.consumer_channels must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Create config for testing: in-memory storage, fast relay.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.url = ":memory:".to_string();
        config.outbox.poll_interval_ms = 200;
        config.outbox.backoff_base_ms = 10;
        config.outbox.backoff_max_ms = 50;
        config.outbox.publish_timeout_ms = 1000;
        config.dispatch.shutdown_grace_ms = 1000;
        config
    }
}
