//! Retry utilities: backoff builders for relay and broker reconnects.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::OutboxConfig;

/// Backoff between publish attempts of one outbox record.
///
/// - Min delay: `outbox.backoff_base_ms`
/// - Max delay: `outbox.backoff_max_ms`
/// - Jitter enabled
pub fn relay_backoff(config: &OutboxConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.backoff_base())
        .with_max_delay(config.backoff_max())
        .with_jitter()
}

/// Backoff for broker reconnects. Never gives up.
///
/// - Min delay: `base` (1s by default)
/// - Max delay: `max` (30s by default)
/// - Jitter enabled
pub fn reconnect_backoff(base: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(max)
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Backoff for connecting to storage at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Delay to wait after the `attempt`-th failure (1-based).
pub fn delay_for_attempt(builder: ExponentialBuilder, attempt: u32, cap: Duration) -> Duration {
    let attempt = attempt.max(1) as usize;
    builder
        .with_max_times(attempt)
        .build()
        .nth(attempt - 1)
        .unwrap_or(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_delay_grows_and_caps() {
        let config = OutboxConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            ..OutboxConfig::default()
        };
        let cap = config.backoff_max();

        let first = delay_for_attempt(relay_backoff(&config), 1, cap);
        assert!(first >= Duration::from_millis(100));
        assert!(first < Duration::from_millis(200));

        // Jitter adds at most the current delay again.
        let late = delay_for_attempt(relay_backoff(&config), 20, cap);
        assert!(late >= Duration::from_millis(1000));
        assert!(late <= Duration::from_millis(2000));
    }

    #[test]
    fn test_reconnect_backoff_unbounded() {
        let mut delays = reconnect_backoff(Duration::from_millis(1), Duration::from_millis(4)).build();
        for _ in 0..100 {
            assert!(delays.next().is_some());
        }
    }
}
