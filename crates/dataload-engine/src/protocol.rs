//! Row producer / receiver protocol
//!
//! A producer (file reader, generator, ...) drives its own read loop and pushes
//! table-switch events and rows into a receiver (one of the import engines).
//! The receiver answers with row-range decisions and can end the producer
//! early through the shared [`ImportSignal`].
//!
//! Required callback order:
//!
//! ```text
//! begin_multi_table (only for more than one table)
//!   set_target_table -> process_row* -> table_import_finished | table_import_error
//!   ...
//! end_multi_table
//! import_finished | import_cancelled
//! ```

use async_trait::async_trait;
use dataload_core::{DialectProfile, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::ImportError;

const RUNNING: u8 = 0;
const STOPPED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared cancellation state of one import run.
///
/// `cancel` is an abnormal termination. `stop` is a requested early end
/// (e.g. the row limit was reached) and must not be reported as an error.
/// Whichever is requested first decides how the run ends. Both wake every
/// task waiting in [`ImportSignal::triggered`].
#[derive(Debug, Clone, Default)]
pub struct ImportSignal {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl ImportSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abnormal termination
    pub fn cancel(&self) {
        self.settle(CANCELLED);
    }

    /// Request a regular early end
    pub fn stop(&self) {
        self.settle(STOPPED);
    }

    fn settle(&self, outcome: u8) {
        if self
            .state
            .compare_exchange(RUNNING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("import signal already set");
        }
        self.token.cancel();
    }

    /// True once cancelled, unless a regular stop was requested first
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// True once a regular stop was requested before any cancel
    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    /// True after either `cancel` or `stop`
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when either `cancel` or `stop` is called
    pub fn triggered(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// A target table, resolved once per table-switch event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableIdentifier {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
}

impl TableIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Parse `name`, `schema.name` or `catalog.schema.name`
    pub fn parse(expression: &str) -> Self {
        let parts: Vec<&str> = expression.trim().split('.').collect();
        match parts.as_slice() {
            [catalog, schema, name] => Self {
                catalog: Some(catalog.to_string()),
                schema: Some(schema.to_string()),
                name: name.to_string(),
            },
            [schema, name] => Self::new(*name).with_schema(*schema),
            _ => Self::new(expression.trim()),
        }
    }

    /// Case-insensitive comparison of the unqualified name
    pub fn same_name(&self, other: &TableIdentifier) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }

    /// The table as a (quoted where needed) SQL expression
    pub fn expression(&self, profile: &DialectProfile) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(catalog) = self.catalog.as_deref().filter(|c| !c.is_empty()) {
            parts.push(profile.quote_if_needed(catalog));
        }
        if let Some(schema) = self.schema.as_deref().filter(|s| !s.is_empty()) {
            parts.push(profile.quote_if_needed(schema));
        }
        parts.push(profile.quote_if_needed(&self.name));
        parts.join(".")
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(schema) = &self.schema {
            write!(f, "{}.", schema)?;
        }
        write!(f, "{}", self.name)
    }
}

/// A source column as announced by the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnIdentifier {
    pub name: String,
}

impl ColumnIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// How a producer's read loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// All input was consumed
    Completed,
    /// The receiver asked for an early end
    Stopped,
}

/// Receiver side of the protocol, implemented by the import engines
#[async_trait]
pub trait RowDataReceiver: Send {
    /// Announce the full table list before the first table of a multi-table run
    async fn begin_multi_table(&mut self, tables: &[TableIdentifier]) -> Result<(), ImportError>;

    /// Switch to a new target table
    async fn set_target_table(
        &mut self,
        table: TableIdentifier,
        columns: Vec<ColumnIdentifier>,
        source_file: Option<PathBuf>,
    ) -> Result<(), ImportError>;

    /// Process one row. Values are positional, matching the announced columns.
    async fn process_row(&mut self, values: Vec<Value>) -> Result<(), ImportError>;

    /// The current table has no more rows
    async fn table_import_finished(&mut self) -> Result<(), ImportError>;

    /// The current table was abandoned after an error
    async fn table_import_error(&mut self);

    /// All tables of a multi-table run were processed
    async fn end_multi_table(&mut self) -> Result<(), ImportError>;

    /// The producer finished normally
    async fn import_finished(&mut self) -> Result<(), ImportError>;

    /// The producer was cancelled
    async fn import_cancelled(&mut self);

    /// Asked before each row; `false` means the producer must skip it
    fn should_process_next_row(&self) -> bool;

    /// Called exactly once for every row the producer does not forward
    fn next_row_skipped(&mut self);

    /// A row could not be converted or stored
    fn record_rejected(&mut self, raw_record: &str, row_number: u64, cause: &str);

    /// Whether table order must respect foreign keys
    fn check_dependencies(&self) -> bool {
        false
    }

    /// Insert order for `tables`, asked by producers when
    /// [`check_dependencies`](Self::check_dependencies) is set
    async fn dependency_order(
        &mut self,
        tables: &[TableIdentifier],
    ) -> Result<Vec<TableIdentifier>, ImportError> {
        Ok(tables.to_vec())
    }
}

/// Producer side of the protocol
#[async_trait]
pub trait RowDataProducer: Send {
    /// Run the read loop, feeding `receiver` until the input is exhausted,
    /// the run is cancelled or stopped, or an unrecoverable error occurs.
    async fn start(
        &mut self,
        receiver: &mut dyn RowDataReceiver,
    ) -> Result<ProducerOutcome, ImportError>;

    /// The signal shared with the receiver
    fn signal(&self) -> &ImportSignal;

    /// Abnormal termination
    fn cancel(&self) {
        self.signal().cancel();
    }

    /// Requested early end, not an error
    fn stop(&self) {
        self.signal().stop();
    }
}
