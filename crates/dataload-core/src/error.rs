//! Error types for dataload

use thiserror::Error;

/// Core error type shared by drivers and the import engine
#[derive(Error, Debug)]
pub enum DataloadError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    /// An error reported by the database itself.
    ///
    /// Drivers fill in the SQLSTATE and/or the vendor error code when they are
    /// available so that callers can classify the failure (e.g. unique key
    /// violations) without parsing the message text.
    #[error("Database error: {message}")]
    Database {
        message: String,
        sql_state: Option<String>,
        code: Option<i32>,
    },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl DataloadError {
    /// Build a database error carrying classification data.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        code: Option<i32>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            code,
        }
    }

    /// The SQLSTATE reported by the driver, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// The vendor error code reported by the driver, if any
    pub fn vendor_code(&self) -> Option<i32> {
        match self {
            Self::Database { code, .. } => *code,
            _ => None,
        }
    }
}

/// Result type alias for dataload operations
pub type Result<T> = std::result::Result<T, DataloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_exposes_classification_fields() {
        let err = DataloadError::database("duplicate", Some("23505".into()), Some(7));
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(err.vendor_code(), Some(7));
        assert_eq!(err.to_string(), "Database error: duplicate");
    }

    #[test]
    fn non_database_errors_have_no_codes() {
        let err = DataloadError::Query("boom".into());
        assert_eq!(err.sql_state(), None);
        assert_eq!(err.vendor_code(), None);
    }
}
