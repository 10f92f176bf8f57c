//! SQLite driver implementation

use async_trait::async_trait;
use dataload_core::{
    Connection, ConnectionConfig, DataloadError, DatabaseDriver, DriverCapabilities, Result,
};
use std::sync::Arc;

use crate::{SqliteConnection, SqliteOpenOptions};

/// SQLite database driver
pub struct SqliteDriver;

impl SqliteDriver {
    /// Create a new SQLite driver instance
    pub fn new() -> Self {
        tracing::debug!("SQLite driver initialized");
        Self
    }

    fn open_options(config: &ConnectionConfig) -> Result<SqliteOpenOptions> {
        let mut options = SqliteOpenOptions::default();
        if let Some(fk) = config.get_bool("foreign_keys") {
            options.foreign_keys = fk;
        }
        if let Some(wal) = config.get_bool("wal") {
            options.wal = wal;
        }
        if let Some(ms) = config.get_string("busy_timeout_ms") {
            options.busy_timeout_ms = ms.parse().map_err(|_| {
                DataloadError::Configuration(format!("Invalid busy_timeout_ms: '{}'", ms))
            })?;
        }
        Ok(options)
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_transactions: true,
            supports_savepoints: true,
            supports_prepared_statements: true,
            supports_batch: false,
            supports_upsert: true,
            supports_foreign_keys: true,
            supports_cancellation: true,
            max_parameters: Some(999),
        }
    }

    #[tracing::instrument(skip(self, config), fields(path = config.get_string("path").as_deref()))]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let path = config.get_string("path").ok_or_else(|| {
            DataloadError::Configuration(
                "SQLite requires a 'path' or 'database' parameter, e.g. /path/to/database.db".into(),
            )
        })?;

        let options = Self::open_options(config)?;
        let conn = SqliteConnection::open_with(&path, &options).map_err(|e| {
            tracing::error!(error = %e, "failed to connect to SQLite database");
            e
        })?;

        tracing::info!(path = %path, "SQLite connection created");
        Ok(Arc::new(conn))
    }

    fn build_connection_string(&self, config: &ConnectionConfig) -> String {
        config
            .get_string("path")
            .unwrap_or_else(|| ":memory:".to_string())
    }
}
