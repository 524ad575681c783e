//! Durable outbox and inbox storage.
//!
//! The outbox is written inside the caller's transaction (see `UnitOfWork`)
//! and drained by the relay through `OutboxStore`. The inbox records which
//! events a consumer has fully processed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::StorageConfig;
use crate::event::{EventId, InboxRecord, OutboxRecord, OutboxState};

pub mod schema;
pub mod sql;
mod unit_of_work;

pub use unit_of_work::UnitOfWork;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay-side access to outbox records.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Create tables and indexes if missing.
    async fn init_schema(&self) -> Result<()>;

    /// Pending records in insertion order (`sequence`), due or not.
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxRecord>>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>>;

    /// Pending -> Sent after broker acknowledgement.
    async fn mark_sent(&self, id: EventId) -> Result<()>;

    /// Count a failed attempt and defer the record until `next_attempt_at`.
    async fn record_failed_attempt(
        &self,
        id: EventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Pending -> Failed once attempts are exhausted.
    async fn mark_failed(&self, id: EventId, error: &str) -> Result<()>;

    async fn count(&self, state: OutboxState) -> Result<u64>;

    /// Retention hook: delete Sent records last attempted before `cutoff`.
    async fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Result of trying to take an event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxClaim {
    /// The caller owns the event until it records or releases it.
    Claimed,
    /// Handlers already completed for this event.
    Processed,
    /// Another consumer holds a live claim.
    InProgress,
}

/// Consumer-side deduplication records.
///
/// A row is inserted as `Processing` when a consumer claims an event and
/// becomes `Processed` once every handler succeeded. The claim is the only
/// gate in front of the handlers, so concurrent deliveries of one event
/// cannot both run them.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn init_schema(&self) -> Result<()>;

    /// Whether the event was fully processed. Live claims do not count.
    async fn contains(&self, id: EventId) -> Result<bool>;

    /// Atomically claim `id`. A `Processing` claim taken before
    /// `stale_before` belongs to a consumer that died and is taken over.
    async fn claim(
        &self,
        id: EventId,
        event_name: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<InboxClaim>;

    /// Mark the event processed, claimed or not. Returns false when it was
    /// already processed.
    async fn record(&self, record: &InboxRecord) -> Result<bool>;

    /// Drop an unfinished claim so a redelivery can take it.
    async fn release(&self, id: EventId) -> Result<()>;

    /// Retention hook: delete records processed before `cutoff`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Open a SQLite pool for the configured path, creating the file if needed.
#[cfg(feature = "sqlite")]
pub async fn connect_sqlite(config: &StorageConfig) -> Result<sqlx::SqlitePool> {
    info!("Storage: sqlite at {}", config.url);

    if config.url == ":memory:" {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = std::path::Path::new(&config.url).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&format!("sqlite:{}?mode=rwc", config.url))
        .await?;
    Ok(pool)
}

/// Open a PostgreSQL pool.
#[cfg(feature = "postgres")]
pub async fn connect_postgres(config: &StorageConfig) -> Result<sqlx::PgPool> {
    info!("Storage: postgres");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    Ok(pool)
}
