//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! Timestamps are stored as microseconds since the Unix epoch so ordering
//! comparisons behave identically on every backend.

use sea_query::Iden;

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    #[iden = "integration_outbox"]
    Table,
    #[iden = "seq"]
    Seq,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "type_tag"]
    TypeTag,
    #[iden = "payload"]
    Payload,
    #[iden = "state"]
    State,
    #[iden = "attempt_count"]
    AttemptCount,
    #[iden = "occurred_at"]
    OccurredAt,
    #[iden = "last_attempt_at"]
    LastAttemptAt,
    #[iden = "next_attempt_at"]
    NextAttemptAt,
    #[iden = "last_error"]
    LastError,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "partition_key"]
    PartitionKey,
}

/// Every outbox column, in the order rows are read back.
pub const OUTBOX_COLUMNS: [Outbox; 13] = [
    Outbox::Seq,
    Outbox::Id,
    Outbox::Name,
    Outbox::TypeTag,
    Outbox::Payload,
    Outbox::State,
    Outbox::AttemptCount,
    Outbox::OccurredAt,
    Outbox::LastAttemptAt,
    Outbox::NextAttemptAt,
    Outbox::LastError,
    Outbox::CorrelationId,
    Outbox::PartitionKey,
];

/// Inbox (consumer deduplication) table schema.
#[derive(Iden)]
pub enum Inbox {
    #[iden = "integration_inbox"]
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_name"]
    EventName,
    #[iden = "state"]
    State,
    #[iden = "claimed_at"]
    ClaimedAt,
    #[iden = "processed_at"]
    ProcessedAt,
}

/// SQLite DDL for the outbox table.
pub const SQLITE_OUTBOX_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS integration_outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    type_tag TEXT NOT NULL,
    payload BLOB NOT NULL,
    state TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    occurred_at INTEGER NOT NULL,
    last_attempt_at INTEGER,
    next_attempt_at INTEGER NOT NULL,
    last_error TEXT,
    correlation_id TEXT,
    partition_key TEXT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_integration_outbox_pending ON integration_outbox(state, seq)",
];

/// PostgreSQL DDL for the outbox table.
pub const POSTGRES_OUTBOX_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS integration_outbox (
    seq BIGSERIAL PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    type_tag TEXT NOT NULL,
    payload BYTEA NOT NULL,
    state TEXT NOT NULL,
    attempt_count BIGINT NOT NULL DEFAULT 0,
    occurred_at BIGINT NOT NULL,
    last_attempt_at BIGINT,
    next_attempt_at BIGINT NOT NULL,
    last_error TEXT,
    correlation_id TEXT,
    partition_key TEXT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_integration_outbox_pending ON integration_outbox(state, seq)",
];

/// Inbox DDL; identical on both backends. `processed_at` stays NULL while
/// a consumer holds the claim.
pub const INBOX_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS integration_inbox (
    event_id TEXT PRIMARY KEY,
    event_name TEXT NOT NULL,
    state TEXT NOT NULL,
    claimed_at BIGINT NOT NULL,
    processed_at BIGINT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_integration_inbox_processed ON integration_inbox(processed_at)",
];
