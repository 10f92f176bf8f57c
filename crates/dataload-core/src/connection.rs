//! Connection trait and transaction handling

use crate::{QueryResult, Result, SavepointSupport, SchemaIntrospection, StatementResult, Value};
use async_trait::async_trait;
use std::sync::Arc;

/// Handle for cancelling a running statement from any thread.
///
/// The handle is safe to call from any thread and can be called multiple
/// times (subsequent calls are no-ops).
pub trait QueryCancelHandle: Send + Sync {
    /// Cancel the currently running statement on the associated connection.
    fn cancel(&self);
}

/// A database connection
///
/// Connections run in auto-commit mode until [`Connection::begin`] is called;
/// a transaction then stays open until [`Connection::commit`] or
/// [`Connection::rollback`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "postgresql", "mysql")
    fn driver_name(&self) -> &str;

    /// Get the dialect identifier for this connection (e.g., "sqlite", "postgresql")
    ///
    /// The import engine uses this to pick the DML strategy and the error
    /// classification rules. Returns None if the dialect is unknown.
    fn dialect_id(&self) -> Option<&'static str> {
        None
    }

    /// Execute a statement that modifies data (INSERT/UPDATE/DELETE/DDL)
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    /// Execute the same parameterized statement once per parameter row.
    ///
    /// Returns the affected row count of every execution. Drivers with a
    /// native batch protocol should override this; the default runs the rows
    /// one after another and stops at the first failure.
    async fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(rows.len());
        for params in rows {
            counts.push(self.execute(sql, params).await?.affected_rows);
        }
        Ok(counts)
    }

    /// Execute a query that returns rows (SELECT)
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Start a transaction, leaving auto-commit mode
    async fn begin(&self) -> Result<()>;

    /// Commit the current transaction. A no-op in auto-commit mode.
    async fn commit(&self) -> Result<()>;

    /// Roll back the current transaction. A no-op in auto-commit mode.
    async fn rollback(&self) -> Result<()>;

    /// Whether a transaction is currently open
    fn in_transaction(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get schema introspection interface if supported
    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        None
    }

    /// Get savepoint support if the connection can create savepoints
    fn as_savepoint_support(&self) -> Option<&dyn SavepointSupport> {
        None
    }

    /// Get a handle that can be used to cancel running statements.
    ///
    /// Returns `None` if the driver does not support cancellation.
    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        None
    }
}
