//! Outbox relay and dispatcher tuning.

use std::time::Duration;

use serde::Deserialize;

/// Lower bound on the relay poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outbox relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Interval between drains when no commit wakes the relay.
    pub poll_interval_ms: u64,
    /// Records fetched per drain.
    pub batch_size: u32,
    /// Publish attempts before a record is marked Failed.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt.
    pub backoff_base_ms: u64,
    /// Backoff cap.
    pub backoff_max_ms: u64,
    /// Bound on a single publish attempt.
    pub publish_timeout_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 100,
            max_attempts: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            publish_timeout_ms: 5000,
        }
    }
}

impl OutboxConfig {
    /// Poll interval, never below `MIN_POLL_INTERVAL`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deliveries (including the first) before a failing message is
    /// dead-lettered.
    pub max_deliveries: u32,
    /// Bound on one handler invocation.
    pub handler_timeout_ms: u64,
    /// Time in-flight handlers get to finish at shutdown.
    pub shutdown_grace_ms: u64,
    /// Remove the broker binding when the last handler unsubscribes.
    pub teardown_unused_bindings: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            handler_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            teardown_unused_bindings: false,
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// How long an inbox claim blocks other consumers before it counts as
    /// abandoned. Handlers run concurrently and each is bounded by
    /// `handler_timeout`, so a live claim never gets this old.
    pub fn claim_lease(&self) -> Duration {
        self.handler_timeout() * 2
    }
}
