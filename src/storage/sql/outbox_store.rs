//! Unified SQL outbox store.
//!
//! Uses a macro to generate implementations for each SQL backend,
//! eliminating code duplication while maintaining type safety. Statement
//! construction is shared; only row decoding and execution are per backend.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use sea_query::{Expr, InsertStatement, Order, Query, SelectStatement, UpdateStatement};

use super::{PoolOf, SqlDatabase, TransactionOf};
use crate::codec::TypeTag;
use crate::event::{EventId, IntegrationEvent, OutboxRecord, OutboxState};
use crate::storage::schema::{Outbox, OUTBOX_COLUMNS};
use crate::storage::{Result, StoreError};

/// Backend able to write outbox records inside a caller's transaction.
#[async_trait::async_trait]
pub trait OutboxWriter: SqlDatabase {
    /// Insert `events` as Pending records using `tx`. Nothing is visible to
    /// the relay until the transaction commits.
    async fn write_outbox(tx: &mut TransactionOf<Self>, events: &[IntegrationEvent]) -> Result<()>;
}

/// SQL-based implementation of `OutboxStore`.
///
/// This generic implementation works with any SQL database that implements
/// the `SqlDatabase` trait (PostgreSQL, SQLite).
pub struct SqlOutboxStore<DB: SqlDatabase> {
    pool: PoolOf<DB>,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlOutboxStore<DB> {
    /// Create a new SQL outbox store with the given pool.
    pub fn new(pool: PoolOf<DB>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &PoolOf<DB> {
        &self.pool
    }
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(column: &str, micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("{} out of range: {}", column, micros)))
}

fn insert_statement(events: &[IntegrationEvent]) -> InsertStatement {
    let mut stmt = Query::insert()
        .into_table(Outbox::Table)
        .columns([
            Outbox::Id,
            Outbox::Name,
            Outbox::TypeTag,
            Outbox::Payload,
            Outbox::State,
            Outbox::AttemptCount,
            Outbox::OccurredAt,
            Outbox::NextAttemptAt,
            Outbox::CorrelationId,
            Outbox::PartitionKey,
        ])
        .to_owned();

    for event in events {
        stmt.values_panic([
            event.id.to_string().into(),
            event.name.clone().into(),
            event.type_tag.as_str().into(),
            event.payload.clone().into(),
            OutboxState::Pending.as_str().into(),
            0i64.into(),
            to_micros(event.occurred_at).into(),
            to_micros(event.occurred_at).into(),
            event.correlation_id.clone().into(),
            event.partition_key.clone().into(),
        ]);
    }

    stmt
}

fn pending_query(limit: u32) -> SelectStatement {
    Query::select()
        .columns(OUTBOX_COLUMNS)
        .from(Outbox::Table)
        .and_where(Expr::col(Outbox::State).eq(OutboxState::Pending.as_str()))
        .order_by(Outbox::Seq, Order::Asc)
        .limit(u64::from(limit))
        .to_owned()
}

fn get_query(id: EventId) -> SelectStatement {
    Query::select()
        .columns(OUTBOX_COLUMNS)
        .from(Outbox::Table)
        .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
        .to_owned()
}

fn count_query(state: OutboxState) -> SelectStatement {
    Query::select()
        .expr(Expr::col(Outbox::Seq).count())
        .from(Outbox::Table)
        .and_where(Expr::col(Outbox::State).eq(state.as_str()))
        .to_owned()
}

/// Transition a Pending record, counting the attempt that caused it.
fn attempt_update(
    id: EventId,
    state: OutboxState,
    error: Option<&str>,
    next_attempt_at: Option<DateTime<Utc>>,
) -> UpdateStatement {
    let now = Utc::now();
    let mut stmt = Query::update()
        .table(Outbox::Table)
        .value(Outbox::State, state.as_str())
        .value(Outbox::AttemptCount, Expr::col(Outbox::AttemptCount).add(1))
        .value(Outbox::LastAttemptAt, to_micros(now))
        .value(Outbox::LastError, error.map(str::to_string))
        .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
        .and_where(Expr::col(Outbox::State).eq(OutboxState::Pending.as_str()))
        .to_owned();

    if let Some(next) = next_attempt_at {
        stmt.value(Outbox::NextAttemptAt, to_micros(next));
    }

    stmt
}

/// Raw column values of one outbox row.
pub(crate) struct OutboxRow {
    pub seq: i64,
    pub id: String,
    pub name: String,
    pub type_tag: String,
    pub payload: Vec<u8>,
    pub state: String,
    pub attempt_count: i64,
    pub occurred_at: i64,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
}

impl OutboxRow {
    fn into_record(self) -> Result<OutboxRecord> {
        let id: EventId = self
            .id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("outbox id '{}': {}", self.id, e)))?;
        let state: OutboxState = self.state.parse().map_err(StoreError::Corrupt)?;
        let attempt_count = u32::try_from(self.attempt_count).map_err(|_| {
            StoreError::Corrupt(format!("attempt_count out of range: {}", self.attempt_count))
        })?;

        Ok(OutboxRecord {
            event: IntegrationEvent {
                id,
                name: self.name,
                type_tag: TypeTag::new(self.type_tag),
                occurred_at: from_micros("occurred_at", self.occurred_at)?,
                payload: self.payload,
                correlation_id: self.correlation_id,
                partition_key: self.partition_key,
            },
            state,
            attempt_count,
            last_attempt_at: self
                .last_attempt_at
                .map(|micros| from_micros("last_attempt_at", micros))
                .transpose()?,
            next_attempt_at: from_micros("next_attempt_at", self.next_attempt_at)?,
            last_error: self.last_error,
            sequence: self.seq,
        })
    }
}

/// Macro to implement the outbox traits for a specific SQL backend.
///
/// This eliminates duplication between PostgreSQL and SQLite implementations
/// while maintaining full type safety.
macro_rules! impl_outbox_store {
    ($db_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl OutboxWriter for $db_type {
            async fn write_outbox(
                tx: &mut TransactionOf<Self>,
                events: &[IntegrationEvent],
            ) -> Result<()> {
                if events.is_empty() {
                    return Ok(());
                }

                let sql = <$db_type>::build_insert(insert_statement(events));
                sqlx::query(&sql).execute(&mut **tx).await?;
                Ok(())
            }
        }

        #[cfg(feature = $feature)]
        impl SqlOutboxStore<$db_type> {
            fn decode_row(
                row: &<<$db_type as SqlDatabase>::Database as sqlx::Database>::Row,
            ) -> Result<OutboxRecord> {
                use sqlx::Row;

                OutboxRow {
                    seq: row.try_get("seq")?,
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    type_tag: row.try_get("type_tag")?,
                    payload: row.try_get("payload")?,
                    state: row.try_get("state")?,
                    attempt_count: row.try_get("attempt_count")?,
                    occurred_at: row.try_get("occurred_at")?,
                    last_attempt_at: row.try_get("last_attempt_at")?,
                    next_attempt_at: row.try_get("next_attempt_at")?,
                    last_error: row.try_get("last_error")?,
                    correlation_id: row.try_get("correlation_id")?,
                    partition_key: row.try_get("partition_key")?,
                }
                .into_record()
            }

            /// Runs an already rendered update. sea-query statements are not
            /// `Send`, so they never live across an await.
            async fn execute_update(&self, sql: String) -> Result<()> {
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::storage::OutboxStore for SqlOutboxStore<$db_type> {
            async fn init_schema(&self) -> Result<()> {
                for stmt in <$db_type as SqlDatabase>::OUTBOX_SCHEMA {
                    sqlx::query(stmt).execute(&self.pool).await?;
                }
                Ok(())
            }

            async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
                let sql = <$db_type>::build_select(pending_query(limit));
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::decode_row).collect()
            }

            async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>> {
                let sql = <$db_type>::build_select(get_query(id));
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.as_ref().map(Self::decode_row).transpose()
            }

            async fn mark_sent(&self, id: EventId) -> Result<()> {
                let sql = <$db_type>::build_update(attempt_update(id, OutboxState::Sent, None, None));
                self.execute_update(sql).await
            }

            async fn record_failed_attempt(
                &self,
                id: EventId,
                error: &str,
                next_attempt_at: DateTime<Utc>,
            ) -> Result<()> {
                let sql = <$db_type>::build_update(attempt_update(
                    id,
                    OutboxState::Pending,
                    Some(error),
                    Some(next_attempt_at),
                ));
                self.execute_update(sql).await
            }

            async fn mark_failed(&self, id: EventId, error: &str) -> Result<()> {
                let sql =
                    <$db_type>::build_update(attempt_update(id, OutboxState::Failed, Some(error), None));
                self.execute_update(sql).await
            }

            async fn count(&self, state: OutboxState) -> Result<u64> {
                use sqlx::Row;

                let sql = <$db_type>::build_select(count_query(state));
                let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
                let count: i64 = row.try_get(0)?;
                Ok(count.max(0) as u64)
            }

            async fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
                let stmt = Query::delete()
                    .from_table(Outbox::Table)
                    .and_where(Expr::col(Outbox::State).eq(OutboxState::Sent.as_str()))
                    .and_where(Expr::col(Outbox::LastAttemptAt).lt(to_micros(cutoff)))
                    .to_owned();

                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }
        }
    };
}

// Generate implementations for each SQL backend
impl_outbox_store!(super::postgres::Postgres, "postgres");
impl_outbox_store!(super::sqlite::Sqlite, "sqlite");
