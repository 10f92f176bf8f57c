//! Single-threaded import coordinator
//!
//! [`DataImporter`] is the default receiver. It keeps the per-table state
//! machine on one connection: a table switch prepares statements, rows are
//! dispatched in source order, and finishing a table flushes, runs the post
//! statement and commits.

use async_trait::async_trait;
use dataload_core::{Connection, DialectProfile, Value, dialect_profile_or_generic};
use std::path::PathBuf;
use std::sync::Arc;

use crate::ImportError;
use crate::constants::{ConstantColumnValues, FileVariableContext};
use crate::dependency::{SchemaReferences, TableDependencySorter};
use crate::memory::{MemoryWatch, NoMemoryWatch, check_memory};
use crate::messages::{MEMORY_WARNING, MessageBuffer};
use crate::options::ImportOptions;
use crate::protocol::{
    ColumnIdentifier, ImportSignal, ProducerOutcome, RowDataProducer, RowDataReceiver,
    TableIdentifier,
};
use crate::rejects::RejectSink;
use crate::summary::{ImportProgress, ImportProgressCallback, ImportSummary, TableSummary};
use crate::table_setup::{
    TablePlan, TableSetup, adjust_sequences, delete_table_contents, run_table_statement,
    table_statement_sql,
};
use crate::table_writer::{TableWriter, WriteReport};

/// Insert order of `tables` using the connection's catalog.
///
/// Without a catalog the given order is kept.
pub(crate) async fn insert_order(
    connection: &dyn Connection,
    tables: &[TableIdentifier],
) -> Result<Vec<TableIdentifier>, ImportError> {
    match connection.as_schema_introspection() {
        Some(catalog) => {
            let references = SchemaReferences::new(catalog);
            TableDependencySorter::new(&references)
                .sort_for_insert(tables)
                .await
        }
        None => Ok(tables.to_vec()),
    }
}

/// Delete the contents of every table, dependents first
pub(crate) async fn delete_in_dependency_order(
    connection: &dyn Connection,
    profile: &DialectProfile,
    tables: &[TableIdentifier],
    messages: &mut MessageBuffer,
) -> Result<(), ImportError> {
    let mut ordered = insert_order(connection, tables).await?;
    ordered.reverse();
    for table in &ordered {
        let deleted = delete_table_contents(connection, profile, table).await?;
        messages.info(format!("{} row(s) deleted from {}", deleted, table));
    }
    Ok(())
}

struct ActiveTable {
    writer: TableWriter,
    summary: TableSummary,
    /// Rows seen so far, including skipped ones
    row_number: u64,
    uncommitted: u64,
}

pub struct DataImporter {
    connection: Arc<dyn Connection>,
    profile: &'static DialectProfile,
    options: ImportOptions,
    constants: ConstantColumnValues,
    variables: FileVariableContext,
    progress: Option<ImportProgressCallback>,
    memory: Arc<dyn MemoryWatch>,
    signal: ImportSignal,
    messages: MessageBuffer,
    rejects: RejectSink,
    current: Option<ActiveTable>,
    /// Rows of an abandoned table are skipped until the next table switch
    skipping_table: bool,
    /// Row counter used while no writer exists
    skipped_rows: u64,
    finished: Vec<TableSummary>,
    targets_deleted: bool,
    /// `begin_multi_table` was called for this run
    multi_table: bool,
    failed: bool,
    cancelled: bool,
}

impl DataImporter {
    pub fn new(connection: Arc<dyn Connection>, options: ImportOptions) -> Result<Self, ImportError> {
        options.validate()?;
        let constants = ConstantColumnValues::parse(&options.constant_values)?;
        let profile = dialect_profile_or_generic(connection.dialect_id());
        Ok(Self {
            profile,
            constants,
            variables: FileVariableContext::with_variables(options.variables.clone()),
            progress: None,
            memory: Arc::new(NoMemoryWatch),
            signal: ImportSignal::new(),
            messages: MessageBuffer::new(options.max_error_messages),
            rejects: RejectSink::new(options.bad_file.as_deref()),
            current: None,
            skipping_table: false,
            skipped_rows: 0,
            finished: Vec::new(),
            targets_deleted: false,
            multi_table: false,
            failed: false,
            cancelled: false,
            connection,
            options,
        })
    }

    /// Use a dialect profile other than the one the connection reports
    pub fn with_dialect_profile(mut self, profile: &'static DialectProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_progress_callback(mut self, callback: ImportProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_memory_watch(mut self, watch: Arc<dyn MemoryWatch>) -> Self {
        self.memory = watch;
        self
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn messages(&self) -> &MessageBuffer {
        &self.messages
    }

    /// Run `producer` against this importer until it is exhausted
    #[tracing::instrument(skip(self, producer), fields(mode = %self.options.mode, dialect = self.profile.id))]
    pub async fn start_import(
        &mut self,
        producer: &mut dyn RowDataProducer,
    ) -> Result<ImportSummary, ImportError> {
        self.reset(producer.signal().clone());

        match producer.start(self).await {
            Ok(outcome) => {
                if self.current.is_some() {
                    self.finish_table().await?;
                }
                if outcome == ProducerOutcome::Stopped {
                    tracing::info!("import stopped before the end of the input");
                }
                let summary = self.summary();
                tracing::info!(
                    rows_inserted = summary.total_inserted,
                    rows_updated = summary.total_updated,
                    rows_rejected = summary.total_rejected,
                    success = summary.success,
                    "import finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.abort_run(&e).await;
                tracing::error!(error = %e, "import failed");
                Err(e)
            }
        }
    }

    /// Counters and messages of the current or last run
    pub fn summary(&self) -> ImportSummary {
        let mut tables = self.finished.clone();
        if let Some(active) = &self.current {
            tables.push(active.summary.clone());
        }
        let success = !self.failed && !self.cancelled && !self.messages.has_errors();
        ImportSummary::from_tables(tables, self.messages.messages().to_vec(), success)
    }

    fn reset(&mut self, signal: ImportSignal) {
        self.signal = signal;
        self.messages.clear();
        self.rejects = RejectSink::new(self.options.bad_file.as_deref());
        self.current = None;
        self.skipping_table = false;
        self.skipped_rows = 0;
        self.finished.clear();
        self.targets_deleted = false;
        self.multi_table = false;
        self.failed = false;
        self.cancelled = false;
    }

    fn transaction_control(&self) -> bool {
        self.options.transaction_control
    }

    async fn begin_if_needed(&self) -> Result<(), ImportError> {
        if self.transaction_control() && !self.connection.in_transaction() {
            self.connection.begin().await?;
        }
        Ok(())
    }

    async fn rollback_quietly(&self) {
        if self.transaction_control() && self.connection.in_transaction() {
            if let Err(e) = self.connection.rollback().await {
                tracing::error!(error = %e, "rollback failed");
            }
        }
    }

    async fn prepare_table(
        &mut self,
        table: TableIdentifier,
        columns: Vec<ColumnIdentifier>,
        source_file: Option<PathBuf>,
    ) -> Result<TablePlan, ImportError> {
        if let Some(path) = &source_file {
            self.variables.set_source_file(path);
        }
        let constants = self.constants.resolve(&self.variables);

        self.begin_if_needed().await?;
        let plan = TableSetup::new(
            self.connection.as_ref(),
            self.profile,
            &self.options,
            &constants,
        )
        .prepare(table, columns, source_file.as_deref())
        .await?;

        for warning in &plan.warnings {
            self.messages.warning(warning.clone());
        }

        if self.options.delete_target && !self.targets_deleted {
            let deleted =
                delete_table_contents(self.connection.as_ref(), self.profile, &plan.table).await?;
            self.messages
                .info(format!("{} row(s) deleted from {}", deleted, plan.table));
        }

        if let Some(template) = &self.options.pre_table_statement {
            let sql = table_statement_sql(template, &plan.table, self.profile);
            let warning = run_table_statement(
                self.connection.as_ref(),
                &sql,
                self.options.ignore_table_statement_errors,
            )
            .await?;
            if let Some(warning) = warning {
                self.messages.warning(warning);
            }
        }

        Ok(plan)
    }

    /// Record a table-level failure; `Ok` means the run goes on without the table
    async fn table_failed(
        &mut self,
        table: &TableIdentifier,
        error: ImportError,
    ) -> Result<(), ImportError> {
        tracing::error!(table = %table, error = %error, "table import failed");
        self.messages
            .error(format!("Error importing table {}: {}", table, error));
        self.rollback_quietly().await;

        let mut summary = TableSummary::new(table);
        summary.failed = true;
        self.finished.push(summary);

        if error.is_table_level() && self.options.continue_on_error {
            self.skipping_table = true;
            Ok(())
        } else {
            self.failed = true;
            Err(error)
        }
    }

    /// Fold a write report into the counters and reject failed rows
    fn apply_report(&mut self, report: WriteReport) -> Result<(), ImportError> {
        let Some(active) = self.current.as_mut() else {
            return Ok(());
        };
        active.summary.rows_inserted += report.inserted;
        active.summary.rows_updated += report.updated;

        let mut first_failure = None;
        for failure in report.failures {
            tracing::warn!(
                table = %active.summary.table,
                row = failure.row_number,
                error = %failure.cause,
                "row rejected"
            );
            self.rejects.reject(
                &mut self.messages,
                &failure.raw_record,
                failure.row_number,
                &failure.cause,
            );
            active.summary.rows_rejected += 1;
            first_failure.get_or_insert(failure);
        }

        match first_failure {
            Some(failure) if !self.options.continue_on_error => Err(ImportError::Statement(
                format!("row {}: {}", failure.row_number, failure.cause),
            )),
            _ => Ok(()),
        }
    }

    async fn commit_if_due(&mut self) -> Result<(), ImportError> {
        let every = self.options.commit_every;
        if !self.transaction_control() || every == 0 {
            return Ok(());
        }
        let due = self
            .current
            .as_ref()
            .is_some_and(|active| active.uncommitted >= every);
        if !due {
            return Ok(());
        }

        if let Some(active) = self.current.as_mut() {
            let report = active.writer.flush().await?;
            active.uncommitted = 0;
            self.apply_report(report)?;
        }
        self.connection.commit().await?;
        self.connection.begin().await?;
        tracing::debug!("intermediate commit");
        Ok(())
    }

    fn report_progress(&self) {
        let (Some(callback), Some(active)) = (&self.progress, &self.current) else {
            return;
        };
        let interval = self.options.progress_interval;
        if interval == 0 || active.summary.rows_processed % interval != 0 {
            return;
        }
        callback(ImportProgress {
            table: active.summary.table.clone(),
            rows_processed: active.summary.rows_processed,
            rows_inserted: active.summary.rows_inserted,
            rows_updated: active.summary.rows_updated,
            errors: self.messages.error_count(),
        });
    }

    fn check_memory(&mut self) -> Result<(), ImportError> {
        if let Err(e) = check_memory(self.memory.as_ref()) {
            self.messages.discard_for_memory();
            self.failed = true;
            tracing::error!(error = %e, "{}", MEMORY_WARNING);
            return Err(e);
        }
        Ok(())
    }

    /// Flush, post statement, commit and summary of the current table
    async fn finish_table(&mut self) -> Result<(), ImportError> {
        let Some(active) = self.current.as_mut() else {
            return Ok(());
        };
        let flushed = match active.writer.flush().await {
            Ok(report) => self.apply_report(report),
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            self.abandon_table().await;
            self.failed = true;
            return Err(e);
        }

        let Some(mut active) = self.current.take() else {
            return Ok(());
        };
        let table = active.writer.plan().table.clone();

        if let Some(template) = &self.options.post_table_statement {
            let sql = table_statement_sql(template, &table, self.profile);
            match run_table_statement(
                self.connection.as_ref(),
                &sql,
                self.options.ignore_table_statement_errors,
            )
            .await
            {
                Ok(Some(warning)) => self.messages.warning(warning),
                Ok(None) => {}
                Err(e) => {
                    self.rollback_quietly().await;
                    self.messages
                        .error(format!("Error importing table {}: {}", table, e));
                    active.summary.failed = true;
                    self.finished.push(active.summary);
                    self.failed = true;
                    return Err(e);
                }
            }
        }

        if self.transaction_control() && self.connection.in_transaction() {
            self.connection.commit().await?;
        }

        if self.options.adjust_sequences {
            let adjusted =
                adjust_sequences(self.connection.as_ref(), self.profile, active.writer.plan())
                    .await?;
            if adjusted > 0 {
                tracing::debug!(table = %table, columns = adjusted, "sequences adjusted");
            }
        }

        let summary = active.summary;
        tracing::info!(
            table = %table,
            rows_processed = summary.rows_processed,
            rows_inserted = summary.rows_inserted,
            rows_updated = summary.rows_updated,
            rows_rejected = summary.rows_rejected,
            "table imported"
        );
        self.messages.info(summary.message());
        self.finished.push(summary);
        Ok(())
    }

    /// Roll back and close the current table as failed
    async fn abandon_table(&mut self) {
        let Some(mut active) = self.current.take() else {
            return;
        };
        active.writer.discard_pending();
        self.rollback_quietly().await;

        if self.options.run_post_statement_on_error
            && let Some(template) = &self.options.post_table_statement
        {
            let sql = table_statement_sql(template, &active.writer.plan().table, self.profile);
            if let Err(e) = run_table_statement(self.connection.as_ref(), &sql, true).await {
                tracing::warn!(error = %e, "post table statement failed");
            }
        }

        active.summary.failed = true;
        tracing::warn!(table = %active.summary.table, "table import abandoned");
        self.finished.push(active.summary);
    }

    async fn abort_run(&mut self, error: &ImportError) {
        self.abandon_table().await;
        self.rollback_quietly().await;
        match error {
            ImportError::Cancelled => {
                self.cancelled = true;
                self.messages.warning("Import cancelled");
            }
            ImportError::LowMemory | ImportError::OutOfMemory => {
                self.failed = true;
            }
            other => {
                self.failed = true;
                if !self.messages.has_errors() {
                    self.messages.error(other.to_string());
                }
            }
        }
        self.rejects.finish(&mut self.messages);
    }
}

#[async_trait]
impl RowDataReceiver for DataImporter {
    async fn begin_multi_table(&mut self, tables: &[TableIdentifier]) -> Result<(), ImportError> {
        tracing::debug!(tables = tables.len(), "multi-table import");
        self.multi_table = true;
        if !self.options.delete_target {
            return Ok(());
        }

        self.begin_if_needed().await?;
        let deleted = delete_in_dependency_order(
            self.connection.as_ref(),
            self.profile,
            tables,
            &mut self.messages,
        )
        .await;
        if let Err(e) = deleted {
            self.rollback_quietly().await;
            self.failed = true;
            return Err(e);
        }
        self.targets_deleted = true;
        Ok(())
    }

    async fn set_target_table(
        &mut self,
        table: TableIdentifier,
        columns: Vec<ColumnIdentifier>,
        source_file: Option<PathBuf>,
    ) -> Result<(), ImportError> {
        if self.current.is_some() {
            self.finish_table().await?;
        }
        if self.signal.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        self.skipping_table = false;
        self.skipped_rows = 0;
        tracing::info!(table = %table, columns = columns.len(), "importing table");

        match self.prepare_table(table.clone(), columns, source_file).await {
            Ok(plan) => {
                let summary = TableSummary::new(&plan.table);
                let writer = TableWriter::new(
                    Arc::clone(&self.connection),
                    self.profile,
                    Arc::new(plan),
                    &self.options,
                );
                self.current = Some(ActiveTable {
                    writer,
                    summary,
                    row_number: 0,
                    uncommitted: 0,
                });
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                self.failed = true;
                self.rollback_quietly().await;
                Err(e)
            }
            Err(e) => self.table_failed(&table, e).await,
        }
    }

    async fn process_row(&mut self, values: Vec<Value>) -> Result<(), ImportError> {
        if self.signal.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        let Some(active) = self.current.as_mut() else {
            if self.skipping_table {
                self.skipped_rows += 1;
                return Ok(());
            }
            return Err(ImportError::Configuration(
                "Row received before a target table was set".into(),
            ));
        };

        active.row_number += 1;
        active.summary.rows_processed += 1;
        active.uncommitted += 1;
        let row_number = active.row_number;

        let report = active.writer.write_row(row_number, values).await?;
        self.apply_report(report)?;
        self.commit_if_due().await?;
        self.report_progress();
        self.check_memory()
    }

    async fn table_import_finished(&mut self) -> Result<(), ImportError> {
        if self.skipping_table {
            self.skipping_table = false;
            return Ok(());
        }
        self.finish_table().await
    }

    async fn table_import_error(&mut self) {
        self.skipping_table = false;
        self.abandon_table().await;
    }

    async fn end_multi_table(&mut self) -> Result<(), ImportError> {
        if self.current.is_some() {
            self.finish_table().await?;
        }
        if self.transaction_control() && self.connection.in_transaction() {
            self.connection.commit().await?;
        }
        Ok(())
    }

    async fn import_finished(&mut self) -> Result<(), ImportError> {
        if self.current.is_some() {
            self.finish_table().await?;
        }
        if self.transaction_control() && self.connection.in_transaction() {
            self.connection.commit().await?;
        }
        self.rejects.finish(&mut self.messages);
        Ok(())
    }

    async fn import_cancelled(&mut self) {
        self.abandon_table().await;
        self.cancelled = true;
    }

    fn should_process_next_row(&self) -> bool {
        if self.skipping_table {
            return false;
        }
        let next = self
            .current
            .as_ref()
            .map_or(self.skipped_rows, |active| active.row_number)
            + 1;
        if let Some(end) = self.options.end_row
            && next > end
        {
            // the range applies per table; only a single-table run ends here
            if !self.multi_table {
                self.signal.stop();
            }
            return false;
        }
        self.options.start_row.is_none_or(|start| next >= start)
    }

    fn next_row_skipped(&mut self) {
        match self.current.as_mut() {
            Some(active) => active.row_number += 1,
            None => self.skipped_rows += 1,
        }
    }

    fn record_rejected(&mut self, raw_record: &str, row_number: u64, cause: &str) {
        tracing::warn!(row = row_number, error = %cause, "row rejected by producer");
        self.rejects
            .reject(&mut self.messages, raw_record, row_number, cause);
        if let Some(active) = self.current.as_mut() {
            active.summary.rows_rejected += 1;
        }
    }

    fn check_dependencies(&self) -> bool {
        self.options.check_dependencies
    }

    async fn dependency_order(
        &mut self,
        tables: &[TableIdentifier],
    ) -> Result<Vec<TableIdentifier>, ImportError> {
        insert_order(self.connection.as_ref(), tables).await
    }
}
