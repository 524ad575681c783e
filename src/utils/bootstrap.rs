//! Bootstrap utilities for relaybus binaries.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with RELAYBUS_LOG environment variable.
///
/// Defaults to "info" level if RELAYBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run `connect` until it succeeds, backing off between attempts.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "storage", "broker")
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error once the backoff is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(service_name: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                tracing::info!("Connected to {}", service_name);
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        "Failed to connect to {} (attempt {}): {}. Retrying in {:?}...",
                        service_name, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        "Failed to connect to {} after {} attempts: {}",
                        service_name,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}

/// Resolves when the process receives Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
