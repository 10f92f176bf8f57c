//! Database driver trait definition

use crate::{Connection, DataloadError, DialectProfile, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Capabilities that a driver may support
#[derive(Debug, Clone, Default)]
pub struct DriverCapabilities {
    /// Supports transactions
    pub supports_transactions: bool,
    /// Supports savepoints
    pub supports_savepoints: bool,
    /// Supports prepared statements
    pub supports_prepared_statements: bool,
    /// Supports sending many parameter sets in one round trip
    pub supports_batch: bool,
    /// Supports UPSERT/ON CONFLICT
    pub supports_upsert: bool,
    /// Supports foreign keys
    pub supports_foreign_keys: bool,
    /// Supports query cancellation
    pub supports_cancellation: bool,
    /// Maximum parameters per statement (None = no limit)
    pub max_parameters: Option<usize>,
}

/// Core driver trait that all database drivers must implement
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Unique identifier for this driver (e.g., "postgres", "mysql", "sqlite")
    fn id(&self) -> &'static str {
        self.name()
    }

    /// Human-readable name (e.g., "PostgreSQL", "MySQL", "SQLite")
    fn name(&self) -> &'static str;

    /// Driver version
    fn version(&self) -> &'static str {
        "0.1.0"
    }

    /// Supported features/capabilities
    fn capabilities(&self) -> DriverCapabilities;

    /// Get the dialect profile for this driver
    ///
    /// By default, this looks up the profile in the global DIALECT_REGISTRY
    /// using the driver's id().
    fn dialect_profile(&self) -> Option<&'static DialectProfile> {
        crate::get_dialect_profile(self.id())
    }

    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>>;

    /// Test connection without keeping it open
    async fn test_connection(&self, config: &ConnectionConfig) -> Result<()> {
        let conn = self.connect(config).await?;
        conn.close().await
    }

    /// Parse a connection string into a configuration
    fn parse_connection_string(&self, _conn_str: &str) -> Result<ConnectionConfig> {
        Err(DataloadError::NotSupported(
            "Connection string parsing not implemented for this driver".into(),
        ))
    }

    /// Build a connection string from configuration
    fn build_connection_string(&self, config: &ConnectionConfig) -> String;
}

/// Connection configuration
///
/// The concurrent import engine opens one extra connection per worker from
/// the same configuration, so it must be complete on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Driver ID (e.g., "postgres", "mysql", "sqlite")
    pub driver: String,
    /// Host address (empty for file-based databases)
    pub host: String,
    /// Port number (0 for default or file-based)
    pub port: u16,
    /// Database name or file path
    pub database: Option<String>,
    /// Username
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Additional connection parameters
    pub params: HashMap<String, String>,
}

impl ConnectionConfig {
    /// Create a new configuration for the given driver
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            ..Default::default()
        }
    }

    /// Create a SQLite configuration
    pub fn new_sqlite(database_path: &str) -> Self {
        let mut config = Self::new("sqlite");
        config.database = Some(database_path.to_string());
        config
    }

    /// Set a connection parameter
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let val = value.into();
        let str_val = match val {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        self.params.insert(key.to_string(), str_val);
        self
    }

    /// Get a string parameter
    pub fn get_string(&self, key: &str) -> Option<String> {
        if let Some(val) = self.params.get(key) {
            return Some(val.clone());
        }
        match key {
            "host" => Some(self.host.clone()),
            "database" | "path" => self.database.clone(),
            "username" | "user" => self.username.clone(),
            "password" => self.password.clone(),
            _ => None,
        }
    }

    /// Get a boolean parameter ("true"/"1"/"yes"/"on")
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_params() {
        let config = ConnectionConfig::new_sqlite("/tmp/x.db")
            .with_param("busy_timeout_ms", 250)
            .with_param("wal", "on");
        assert_eq!(config.get_string("path").as_deref(), Some("/tmp/x.db"));
        assert_eq!(config.get_string("busy_timeout_ms").as_deref(), Some("250"));
        assert_eq!(config.get_bool("wal"), Some(true));
        assert_eq!(config.get_bool("missing"), None);
    }
}
