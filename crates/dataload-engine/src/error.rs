//! Errors raised by the import engine

use dataload_core::DataloadError;
use thiserror::Error;

/// Errors during import
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("No key columns available for table '{0}'")]
    NoKeyColumns(String),

    #[error("Table '{0}' has only key columns, nothing to update")]
    NoUpdateColumns(String),

    #[error("Cyclic foreign key dependency detected for table '{table}'")]
    DependencyCycle { table: String },

    #[error("Parse error in {source_name} at line {line}: {message}")]
    Parse {
        source_name: String,
        line: u64,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Statement failed: {0}")]
    Statement(String),

    #[error("Import aborted: {0}")]
    Aborted(String),

    #[error("Import cancelled")]
    Cancelled,

    #[error("Not enough memory to continue the import")]
    OutOfMemory,

    #[error("Memory is running low, import stopped")]
    LowMemory,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] DataloadError),
}

impl ImportError {
    /// Run-level fatal errors abort the import regardless of `continue_on_error`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ImportError::OutOfMemory
                | ImportError::LowMemory
                | ImportError::DependencyCycle { .. }
                | ImportError::Cancelled
        )
    }

    /// Errors that abandon the current table but may let the run continue
    pub fn is_table_level(&self) -> bool {
        matches!(
            self,
            ImportError::TableNotFound(_)
                | ImportError::ColumnNotFound { .. }
                | ImportError::NoKeyColumns(_)
                | ImportError::NoUpdateColumns(_)
        )
    }
}

impl From<toml::de::Error> for ImportError {
    fn from(e: toml::de::Error) -> Self {
        ImportError::Configuration(e.to_string())
    }
}
