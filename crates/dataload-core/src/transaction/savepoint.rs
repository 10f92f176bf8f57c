//! Savepoint support for database transactions
//!
//! Savepoints are named points within a transaction that can be rolled back
//! to without aborting the entire transaction. The import engine wraps single
//! row operations in savepoints so that one bad row does not poison the rest
//! of the transaction.

use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// A savepoint within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    /// Create a new savepoint with the given name.
    ///
    /// Savepoint names should follow database-specific naming rules.
    /// Most databases allow alphanumeric names with underscores.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Get the name of the savepoint.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Trait for connections that support savepoints.
///
/// # Example
/// ```ignore
/// conn.begin().await?;
/// conn.execute("INSERT INTO users VALUES (1, 'Alice')", &[]).await?;
///
/// let sp = conn.as_savepoint_support().unwrap().savepoint("before_bob").await?;
/// conn.execute("INSERT INTO users VALUES (2, 'Bob')", &[]).await?;
///
/// // Undo just Bob's insert
/// conn.as_savepoint_support().unwrap().rollback_to_savepoint(&sp).await?;
/// conn.commit().await?;
/// ```
#[async_trait]
pub trait SavepointSupport: Send + Sync {
    /// Create a savepoint with the given name.
    async fn savepoint(&self, name: &str) -> Result<Savepoint>;

    /// Roll back to a previously created savepoint.
    ///
    /// All changes made after the savepoint was created are undone; the
    /// enclosing transaction stays open.
    async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()>;

    /// Release (delete) a savepoint.
    async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()>;
}

/// Generates unique savepoint names for one connection.
#[derive(Debug, Default)]
pub struct SavepointNames {
    counter: AtomicU64,
}

impl SavepointNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next name with the given prefix, e.g. `dl_row_17`
    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}", prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_new() {
        let sp = Savepoint::new("test_savepoint");
        assert_eq!(sp.name(), "test_savepoint");
    }

    #[test]
    fn test_savepoint_equality() {
        assert_eq!(Savepoint::new("same"), Savepoint::new("same"));
        assert_ne!(Savepoint::new("same"), Savepoint::new("different"));
    }

    #[test]
    fn test_savepoint_names_are_unique() {
        let names = SavepointNames::new();
        let a = names.next("dl_row");
        let b = names.next("dl_row");
        assert_eq!(a, "dl_row_1");
        assert_eq!(b, "dl_row_2");
    }
}
