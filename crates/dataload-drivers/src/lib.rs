//! Dataload Drivers - Database driver implementations
//!
//! This crate collects the concrete implementations of the driver traits
//! defined in `dataload-core` behind feature flags.

#[cfg(feature = "sqlite")]
pub use dataload_driver_sqlite as sqlite;

mod registry;

pub use registry::DriverRegistry;

/// Re-export commonly used types from dataload-core
pub use dataload_core::{
    Connection, ConnectionConfig, DataloadError, DatabaseDriver, DriverCapabilities, QueryResult,
    Result, Row, SchemaIntrospection, StatementResult, Value,
};

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_sqlite() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.has("sqlite"));
        assert!(registry.has("SQLite"));
        assert!(registry.get("oracle").is_none());
    }

    #[tokio::test]
    async fn test_connect_through_registry() {
        let registry = DriverRegistry::with_defaults();
        let conn = registry
            .connect(&ConnectionConfig::new_sqlite(":memory:"))
            .await
            .expect("Failed to open in-memory db");

        conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[])
            .await
            .expect("Failed to create table");
        conn.execute("INSERT INTO users (name) VALUES ('Alice')", &[])
            .await
            .expect("Failed to insert");

        let result = conn
            .query("SELECT * FROM users", &[])
            .await
            .expect("Failed to query");
        assert_eq!(result.rows.len(), 1);

        let schema = conn
            .as_schema_introspection()
            .expect("Should have schema introspection");
        let tables = schema.list_tables(None).await.expect("Failed to list tables");
        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_driver_is_not_found() {
        let registry = DriverRegistry::with_defaults();
        let err = registry
            .connect(&ConnectionConfig::new("nosuch"))
            .await
            .err()
            .expect("unknown driver");
        assert!(matches!(err, DataloadError::NotFound(_)));
    }
}
