//! Unified SQL inbox store.
//!
//! Claims are plain rows: the insert that wins the primary key owns the
//! event. Everything else reads the row's state to decide between a
//! duplicate and a delivery that is still running elsewhere.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use sea_query::{Expr, InsertStatement, OnConflict, Query, SelectStatement, UpdateStatement};

use super::outbox_store::to_micros;
use super::{PoolOf, SqlDatabase};
use crate::event::{EventId, InboxRecord, InboxState};
use crate::storage::schema::Inbox;
use crate::storage::{InboxClaim, Result, StoreError};

/// SQL-based implementation of `InboxStore`.
pub struct SqlInboxStore<DB: SqlDatabase> {
    pool: PoolOf<DB>,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlInboxStore<DB> {
    /// Create a new SQL inbox store with the given pool.
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

fn claim_insert(id: EventId, event_name: &str, now: DateTime<Utc>) -> InsertStatement {
    Query::insert()
        .into_table(Inbox::Table)
        .columns([Inbox::EventId, Inbox::EventName, Inbox::State, Inbox::ClaimedAt])
        .values_panic([
            id.to_string().into(),
            event_name.into(),
            InboxState::Processing.as_str().into(),
            to_micros(now).into(),
        ])
        .on_conflict(OnConflict::column(Inbox::EventId).do_nothing().to_owned())
        .to_owned()
}

/// Refresh a `Processing` claim older than `stale_before`.
fn claim_takeover(id: EventId, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> UpdateStatement {
    Query::update()
        .table(Inbox::Table)
        .value(Inbox::ClaimedAt, to_micros(now))
        .and_where(Expr::col(Inbox::EventId).eq(id.to_string()))
        .and_where(Expr::col(Inbox::State).eq(InboxState::Processing.as_str()))
        .and_where(Expr::col(Inbox::ClaimedAt).lt(to_micros(stale_before)))
        .to_owned()
}

fn state_query(id: EventId) -> SelectStatement {
    Query::select()
        .column(Inbox::State)
        .from(Inbox::Table)
        .and_where(Expr::col(Inbox::EventId).eq(id.to_string()))
        .to_owned()
}

/// Insert as processed, or promote an existing claim. Already processed
/// rows are left alone so the write reports zero rows.
fn record_upsert(record: &InboxRecord) -> InsertStatement {
    let processed_at = to_micros(record.processed_at);
    Query::insert()
        .into_table(Inbox::Table)
        .columns([
            Inbox::EventId,
            Inbox::EventName,
            Inbox::State,
            Inbox::ClaimedAt,
            Inbox::ProcessedAt,
        ])
        .values_panic([
            record.event_id.to_string().into(),
            record.event_name.clone().into(),
            InboxState::Processed.as_str().into(),
            processed_at.into(),
            processed_at.into(),
        ])
        .on_conflict(
            OnConflict::column(Inbox::EventId)
                .update_columns([Inbox::State, Inbox::ProcessedAt])
                .action_and_where(
                    Expr::col((Inbox::Table, Inbox::State)).eq(InboxState::Processing.as_str()),
                )
                .to_owned(),
        )
        .to_owned()
}

macro_rules! impl_inbox_store {
    ($db_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::storage::InboxStore for SqlInboxStore<$db_type> {
            async fn init_schema(&self) -> Result<()> {
                for stmt in <$db_type as SqlDatabase>::INBOX_SCHEMA {
                    sqlx::query(stmt).execute(&self.pool).await?;
                }
                Ok(())
            }

            async fn contains(&self, id: EventId) -> Result<bool> {
                let stmt = Query::select()
                    .column(Inbox::EventId)
                    .from(Inbox::Table)
                    .and_where(Expr::col(Inbox::EventId).eq(id.to_string()))
                    .and_where(Expr::col(Inbox::State).eq(InboxState::Processed.as_str()))
                    .to_owned();

                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                Ok(row.is_some())
            }

            async fn claim(
                &self,
                id: EventId,
                event_name: &str,
                stale_before: DateTime<Utc>,
            ) -> Result<InboxClaim> {
                use sqlx::Row;

                let now = Utc::now();

                let sql = <$db_type>::build_insert(claim_insert(id, event_name, now));
                if sqlx::query(&sql).execute(&self.pool).await?.rows_affected() > 0 {
                    return Ok(InboxClaim::Claimed);
                }

                let sql = <$db_type>::build_update(claim_takeover(id, now, stale_before));
                if sqlx::query(&sql).execute(&self.pool).await?.rows_affected() > 0 {
                    tracing::warn!(event_id = %id, "Took over stale inbox claim");
                    return Ok(InboxClaim::Claimed);
                }

                let sql = <$db_type>::build_select(state_query(id));
                let Some(row) = sqlx::query(&sql).fetch_optional(&self.pool).await? else {
                    // Released between the insert and the read; the next
                    // delivery claims it.
                    return Ok(InboxClaim::InProgress);
                };
                let state: String = row.try_get("state")?;
                match state.parse::<InboxState>().map_err(StoreError::Corrupt)? {
                    InboxState::Processed => Ok(InboxClaim::Processed),
                    InboxState::Processing => Ok(InboxClaim::InProgress),
                }
            }

            async fn record(&self, record: &InboxRecord) -> Result<bool> {
                let sql = <$db_type>::build_insert(record_upsert(record));
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected() > 0)
            }

            async fn release(&self, id: EventId) -> Result<()> {
                let stmt = Query::delete()
                    .from_table(Inbox::Table)
                    .and_where(Expr::col(Inbox::EventId).eq(id.to_string()))
                    .and_where(Expr::col(Inbox::State).eq(InboxState::Processing.as_str()))
                    .to_owned();

                let sql = <$db_type>::build_delete(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
                let stmt = Query::delete()
                    .from_table(Inbox::Table)
                    .and_where(Expr::col(Inbox::State).eq(InboxState::Processed.as_str()))
                    .and_where(Expr::col(Inbox::ProcessedAt).lt(to_micros(cutoff)))
                    .to_owned();

                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }
        }
    };
}

// Generate implementations for each SQL backend
impl_inbox_store!(super::postgres::Postgres, "postgres");
impl_inbox_store!(super::sqlite::Sqlite, "sqlite");

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::storage::sql::sqlite::Sqlite;
    use crate::storage::InboxStore;
    use crate::test_utils::sqlite_memory_pool;
    use chrono::Duration;

    async fn store() -> SqlInboxStore<Sqlite> {
        let store = SqlInboxStore::<Sqlite>::new(sqlite_memory_pool().await);
        store.init_schema().await.unwrap();
        store
    }

    fn processed(id: EventId) -> InboxRecord {
        InboxRecord {
            event_id: id,
            event_name: "CategoryCreated".to_string(),
            processed_at: Utc::now(),
        }
    }

    fn long_ago() -> DateTime<Utc> {
        Utc::now() - Duration::hours(1)
    }

    #[tokio::test]
    async fn test_second_claim_sees_in_progress() {
        let store = store().await;
        let id = EventId::new();

        assert_eq!(
            store.claim(id, "CategoryCreated", long_ago()).await.unwrap(),
            InboxClaim::Claimed
        );
        assert_eq!(
            store.claim(id, "CategoryCreated", long_ago()).await.unwrap(),
            InboxClaim::InProgress
        );
        assert!(!store.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_completes_claim() {
        let store = store().await;
        let id = EventId::new();
        store.claim(id, "CategoryCreated", long_ago()).await.unwrap();

        assert!(store.record(&processed(id)).await.unwrap());
        assert!(store.contains(id).await.unwrap());
        assert_eq!(
            store.claim(id, "CategoryCreated", long_ago()).await.unwrap(),
            InboxClaim::Processed
        );

        // Already processed: nothing changes.
        assert!(!store.record(&processed(id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_claim() {
        let store = store().await;
        let id = EventId::new();
        store.claim(id, "CategoryCreated", long_ago()).await.unwrap();

        store.release(id).await.unwrap();
        assert_eq!(
            store.claim(id, "CategoryCreated", long_ago()).await.unwrap(),
            InboxClaim::Claimed
        );
    }

    #[tokio::test]
    async fn test_release_keeps_processed_record() {
        let store = store().await;
        let id = EventId::new();
        store.record(&processed(id)).await.unwrap();

        store.release(id).await.unwrap();
        assert!(store.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let store = store().await;
        let id = EventId::new();
        store.claim(id, "CategoryCreated", long_ago()).await.unwrap();

        let stale_before = Utc::now() + Duration::seconds(1);
        assert_eq!(
            store.claim(id, "CategoryCreated", stale_before).await.unwrap(),
            InboxClaim::Claimed
        );
        // The takeover refreshed the claim.
        assert_eq!(
            store.claim(id, "CategoryCreated", long_ago()).await.unwrap(),
            InboxClaim::InProgress
        );
    }

    #[tokio::test]
    async fn test_purge_skips_live_claims() {
        let store = store().await;
        let (done, running) = (EventId::new(), EventId::new());
        store.record(&processed(done)).await.unwrap();
        store.claim(running, "CategoryCreated", long_ago()).await.unwrap();

        let purged = store
            .purge_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(
            store.claim(running, "CategoryCreated", long_ago()).await.unwrap(),
            InboxClaim::InProgress
        );
    }
}
