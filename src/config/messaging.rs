//! Messaging and broker configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependencies).
    #[default]
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Topic exchange integration events are published to.
    pub exchange: String,
    /// Number of parallel consumption channels.
    pub consumer_channels: usize,
    /// Unacknowledged deliveries allowed per channel.
    pub prefetch: u16,
    /// Bound on waiting for a publisher confirm.
    pub publish_timeout_ms: u64,
    /// First reconnect delay.
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "relaybus.events".to_string(),
            consumer_channels: 1,
            prefetch: 16,
            publish_timeout_ms: 5000,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl AmqpConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
