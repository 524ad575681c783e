//! Unified SQL storage implementations.
//!
//! This module provides shared implementations for SQL-based storage backends
//! (PostgreSQL, SQLite). The implementations are parameterized by database type
//! using the `SqlDatabase` trait.

mod inbox_store;
mod outbox_store;
mod query;

pub use inbox_store::SqlInboxStore;
pub use outbox_store::{OutboxWriter, SqlOutboxStore};
pub use query::{PoolOf, SqlDatabase, TransactionOf};

#[cfg(feature = "postgres")]
pub mod postgres {
    //! PostgreSQL database backend.

    use sea_query::PostgresQueryBuilder;

    use crate::storage::schema::{INBOX_SCHEMA, POSTGRES_OUTBOX_SCHEMA};

    /// PostgreSQL database marker type.
    pub struct Postgres;

    impl super::SqlDatabase for Postgres {
        type Database = sqlx::Postgres;

        const OUTBOX_SCHEMA: &'static [&'static str] = POSTGRES_OUTBOX_SCHEMA;
        const INBOX_SCHEMA: &'static [&'static str] = INBOX_SCHEMA;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_update(stmt: sea_query::UpdateStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }
    }

    /// PostgreSQL outbox store.
    pub type PostgresOutboxStore = super::SqlOutboxStore<Postgres>;

    /// PostgreSQL inbox store.
    pub type PostgresInboxStore = super::SqlInboxStore<Postgres>;
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite database backend.

    use sea_query::SqliteQueryBuilder;

    use crate::storage::schema::{INBOX_SCHEMA, SQLITE_OUTBOX_SCHEMA};

    /// SQLite database marker type.
    pub struct Sqlite;

    impl super::SqlDatabase for Sqlite {
        type Database = sqlx::Sqlite;

        const OUTBOX_SCHEMA: &'static [&'static str] = SQLITE_OUTBOX_SCHEMA;
        const INBOX_SCHEMA: &'static [&'static str] = INBOX_SCHEMA;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_update(stmt: sea_query::UpdateStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }
    }

    /// SQLite outbox store.
    pub type SqliteOutboxStore = super::SqlOutboxStore<Sqlite>;

    /// SQLite inbox store.
    pub type SqliteInboxStore = super::SqlInboxStore<Sqlite>;
}
