//! Driver registry for managing available database drivers

use dataload_core::{ConnectionConfig, Connection, DataloadError, DatabaseDriver, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available database drivers
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Create a registry with all built-in drivers registered
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(crate::sqlite::SqliteDriver::new()));

        registry
    }

    /// Register a new driver
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        let name = driver.id().to_string();
        tracing::debug!(driver = %name, "registering database driver");
        self.drivers.insert(name, driver);
    }

    /// Get a driver by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn DatabaseDriver>> {
        let driver = self.drivers.get(&name.to_ascii_lowercase()).cloned();
        if driver.is_none() {
            tracing::warn!(driver = %name, "driver not found in registry");
        }
        driver
    }

    /// List all registered driver names
    pub fn list(&self) -> Vec<&str> {
        self.drivers.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a driver is registered
    pub fn has(&self, name: &str) -> bool {
        self.drivers.contains_key(&name.to_ascii_lowercase())
    }

    /// Open a connection with the driver named in the configuration
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let driver = self.get(&config.driver).ok_or_else(|| {
            DataloadError::NotFound(format!("No driver registered for '{}'", config.driver))
        })?;
        driver.connect(config).await
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
