//! Bulk import of tabular data into relational databases
//!
//! A producer reads rows from some source and pushes them into a receiver
//! through the callbacks of [`RowDataReceiver`]. The receivers in this crate
//! write the rows into a target table using dialect-aware DML.
//!
//! # Architecture
//!
//! ```text
//! TextFileProducer ──rows──► DataImporter ──► TableWriter ──► Connection
//!                       └──► ParallelImporter ──queue──► ImportWorker × N
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let options = ImportOptions::from_toml_str(r#"mode = "insertUpdate""#)?;
//! let mut importer = DataImporter::new(connection, options)?;
//! let mut producer = TextFileProducer::new("data/person.csv");
//! let summary = importer.start_import(&mut producer).await?;
//! ```

mod constants;
mod dependency;
mod dml;
mod error;
mod importer;
mod memory;
mod messages;
mod options;
pub mod parallel;
mod protocol;
mod rejects;
mod summary;
mod table_setup;
mod table_writer;
mod text_producer;

#[cfg(test)]
mod test_support;

pub use constants::{
    ConstantColumn, ConstantColumnValues, ConstantValue, FileVariableContext, VAR_FILE_BASE,
    VAR_FILE_DIR, VAR_FILE_NAME, VAR_FILE_PATH,
};
pub use dependency::{
    DependencyNode, ReferenceLookup, SchemaReferences, StaticReferences, TableDependencySorter,
};
pub use dml::*;
pub use error::ImportError;
pub use importer::DataImporter;
pub use memory::{MemoryStatus, MemoryWatch, NoMemoryWatch, check_memory};
pub use messages::{MEMORY_WARNING, MessageBuffer, TOO_MANY_ERRORS};
pub use options::{ImportMode, ImportOptions};
pub use parallel::{ConnectionFactory, DriverConnectionFactory, ParallelImporter};
pub use protocol::{
    ColumnIdentifier, ImportSignal, ProducerOutcome, RowDataProducer, RowDataReceiver,
    TableIdentifier,
};
pub use rejects::{BadFileWriter, RejectSink, raw_record};
pub use summary::{ImportProgress, ImportProgressCallback, ImportSummary, TableSummary};
pub use table_setup::{
    ConstantSlot, ImportColumn, LobKind, PreparedStatements, TablePlan, TableSetup,
    adjust_sequences, delete_table_contents, resolve_insert_ignore, resolve_upsert,
    run_table_statement, table_statement_sql,
};
pub use table_writer::{RowFailure, TableWriter, WriteReport};
pub use text_producer::{TextFileProducer, TextFormat, split_record};
