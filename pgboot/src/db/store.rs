//! Store traits
//!
//! The migration executor and the client only reach the database through
//! these traits. [`crate::db::connection::Database`] implements them over a
//! sqlx pool.

use async_trait::async_trait;

use crate::db::migrations::MigrationRecord;
use crate::error::Result;

/// A live handle to the store.
///
/// Implementations return errors that have already gone through
/// [`crate::db::normalize`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Check that the store accepts requests.
    async fn ping(&self) -> Result<()>;

    /// Execute a statement outside any transaction, returning rows affected.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Create the migration control table if it does not exist.
    async fn create_control_table(&self, table: &str) -> Result<()>;

    /// Every row of the control table, ordered by version.
    async fn applied_migrations(&self, table: &str) -> Result<Vec<MigrationRecord>>;

    /// Release the high-level handle.
    async fn close(&self);
}

/// An open transaction. Dropping it without [`commit`](Self::commit) discards
/// its work.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn insert_migration(&mut self, table: &str, record: &MigrationRecord) -> Result<()>;

    /// Remove a control-table row, returning rows affected.
    async fn delete_migration(&mut self, table: &str, version: i64) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// The raw connection pool underneath a [`Store`]. It is released separately
/// from the store handle; releasing only one of them leaks the other.
#[async_trait]
pub trait RawHandle: Send + Sync {
    async fn release(&self);
}
