//! SQL database abstraction trait.

/// Trait for SQL database backends.
///
/// This trait abstracts over different SQL databases (PostgreSQL, SQLite)
/// by providing the sqlx database type, the DDL and query building methods.
pub trait SqlDatabase: Send + Sync + 'static {
    /// The sqlx database driver for this backend.
    type Database: sqlx::Database;

    /// Statements creating the outbox table and indexes.
    const OUTBOX_SCHEMA: &'static [&'static str];

    /// Statements creating the inbox table and indexes.
    const INBOX_SCHEMA: &'static [&'static str];

    /// Build a SQL query string from a sea-query SELECT statement.
    fn build_select(stmt: sea_query::SelectStatement) -> String;

    /// Build a SQL query string from a sea-query INSERT statement.
    fn build_insert(stmt: sea_query::InsertStatement) -> String;

    /// Build a SQL query string from a sea-query UPDATE statement.
    fn build_update(stmt: sea_query::UpdateStatement) -> String;

    /// Build a SQL query string from a sea-query DELETE statement.
    fn build_delete(stmt: sea_query::DeleteStatement) -> String;
}

/// Connection pool for a backend.
pub type PoolOf<DB> = sqlx::Pool<<DB as SqlDatabase>::Database>;

/// Open transaction for a backend.
pub type TransactionOf<DB> = sqlx::Transaction<'static, <DB as SqlDatabase>::Database>;
