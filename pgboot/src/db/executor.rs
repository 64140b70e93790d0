//! SQL executor
//!
//! Runs ordered statement batches against a [`Store`].

use crate::db::store::Store;
use crate::error::Result;

/// SQL executor for running statements in order
pub struct SqlExecutor<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> SqlExecutor<'a, S> {
    /// Create a new SQL executor
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Execute a single SQL statement
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        tracing::debug!(sql = sql, "Executing statement");
        self.store.execute(sql).await
    }

    /// Execute multiple SQL statements in order, stopping at the first failure
    pub async fn execute_batch(&self, statements: &[String]) -> Result<()> {
        for statement in statements {
            self.execute(statement).await?;
        }

        Ok(())
    }

    /// Get the underlying store
    pub fn store(&self) -> &S {
        self.store
    }
}
