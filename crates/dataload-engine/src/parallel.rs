//! Concurrent import engine
//!
//! [`ParallelImporter`] prepares each table once on the caller's connection
//! and fans its rows out to a fixed pool of workers through a bounded
//! [`StoppableQueue`]. Worker 0 writes through the caller's connection, every
//! other worker opens its own from the same [`ConnectionFactory`].
//!
//! Each worker commits on its own connection, so an import with more than one
//! worker is not atomic across workers. Row order is not preserved.

mod queue;
mod state;
mod worker;

pub use queue::StoppableQueue;
pub use state::SharedImportState;
pub use worker::{ImportRow, ImportWorker, SENTINEL_SEQUENCE, WorkerController, WorkerExit};

use async_trait::async_trait;
use dataload_core::{
    Connection, ConnectionConfig, DataloadError, DatabaseDriver, DialectProfile, Value,
    dialect_profile_or_generic,
};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::ImportError;
use crate::constants::{ConstantColumnValues, FileVariableContext};
use crate::importer::{delete_in_dependency_order, insert_order};
use crate::memory::{MemoryWatch, NoMemoryWatch};
use crate::messages::MessageBuffer;
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
use crate::table_writer::TableWriter;

/// Opens the connections of workers 1..n
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Connection>, DataloadError>;
}

/// Opens worker connections through a driver
pub struct DriverConnectionFactory {
    driver: Arc<dyn DatabaseDriver>,
    config: ConnectionConfig,
}

impl DriverConnectionFactory {
    pub fn new(driver: Arc<dyn DatabaseDriver>, config: ConnectionConfig) -> Self {
        Self { driver, config }
    }
}

#[async_trait]
impl ConnectionFactory for DriverConnectionFactory {
    async fn open(&self) -> Result<Arc<dyn Connection>, DataloadError> {
        self.driver.connect(&self.config).await
    }
}

struct RunningTable {
    plan: Arc<TablePlan>,
    summary: TableSummary,
    controller: Arc<WorkerController>,
    workers: Vec<JoinHandle<WorkerExit>>,
    submitted: u64,
    /// Rows seen so far, including skipped ones
    row_number: u64,
}

pub struct ParallelImporter {
    connection: Arc<dyn Connection>,
    factory: Arc<dyn ConnectionFactory>,
    profile: &'static DialectProfile,
    options: ImportOptions,
    constants: ConstantColumnValues,
    variables: FileVariableContext,
    progress: Option<ImportProgressCallback>,
    memory: Arc<dyn MemoryWatch>,
    signal: ImportSignal,
    state: Arc<SharedImportState>,
    /// Index 0 is the caller's connection
    connections: Vec<Arc<dyn Connection>>,
    current: Option<RunningTable>,
    skipping_table: bool,
    skipped_rows: u64,
    finished: Vec<TableSummary>,
    targets_deleted: bool,
    /// `begin_multi_table` was called for this run
    multi_table: bool,
    failed: bool,
    cancelled: bool,
}

impl ParallelImporter {
    pub fn new(
        connection: Arc<dyn Connection>,
        factory: Arc<dyn ConnectionFactory>,
        options: ImportOptions,
    ) -> Result<Self, ImportError> {
        options.validate()?;
        let constants = ConstantColumnValues::parse(&options.constant_values)?;
        let profile = dialect_profile_or_generic(connection.dialect_id());
        Ok(Self {
            factory,
            profile,
            constants,
            variables: FileVariableContext::with_variables(options.variables.clone()),
            progress: None,
            memory: Arc::new(NoMemoryWatch),
            signal: ImportSignal::new(),
            state: Self::fresh_state(&options),
            connections: Vec::new(),
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

    /// Worker connections are opened through `driver` with `config`
    pub fn with_driver(
        connection: Arc<dyn Connection>,
        driver: Arc<dyn DatabaseDriver>,
        config: ConnectionConfig,
        options: ImportOptions,
    ) -> Result<Self, ImportError> {
        Self::new(
            connection,
            Arc::new(DriverConnectionFactory::new(driver, config)),
            options,
        )
    }

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

    pub fn worker_count(&self) -> usize {
        self.options.worker_count
    }

    fn fresh_state(options: &ImportOptions) -> Arc<SharedImportState> {
        Arc::new(SharedImportState::new(
            MessageBuffer::new(options.max_error_messages),
            RejectSink::new(options.bad_file.as_deref()),
        ))
    }

    #[tracing::instrument(skip(self, producer), fields(mode = %self.options.mode, workers = self.options.worker_count))]
    pub async fn start_import(
        &mut self,
        producer: &mut dyn RowDataProducer,
    ) -> Result<ImportSummary, ImportError> {
        self.signal = producer.signal().clone();
        self.state = Self::fresh_state(&self.options);
        self.current = None;
        self.skipping_table = false;
        self.skipped_rows = 0;
        self.finished.clear();
        self.targets_deleted = false;
        self.multi_table = false;
        self.failed = false;
        self.cancelled = false;

        let result = match producer.start(self).await {
            Ok(outcome) => self.finish_table().await.map(|()| outcome),
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => {
                self.close_worker_connections().await;
                if outcome == ProducerOutcome::Stopped {
                    tracing::info!("import stopped before the end of the input");
                }
                let summary = self.summary();
                tracing::info!(
                    rows_inserted = summary.total_inserted,
                    rows_updated = summary.total_updated,
                    rows_rejected = summary.total_rejected,
                    success = summary.success,
                    "parallel import finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.abandon_table(false).await;
                match &e {
                    ImportError::Cancelled => {
                        self.cancelled = true;
                        self.state.warning("Import cancelled");
                    }
                    other => {
                        self.failed = true;
                        if !self.state.has_errors() && !other.is_fatal() {
                            self.state.error(other.to_string());
                        }
                    }
                }
                self.state.finish_rejects();
                self.close_worker_connections().await;
                tracing::error!(error = %e, "parallel import failed");
                Err(e)
            }
        }
    }

    pub fn summary(&self) -> ImportSummary {
        let mut tables = self.finished.clone();
        if let Some(running) = &self.current {
            tables.push(running.summary.clone());
        }
        let success =
            !self.failed && !self.cancelled && !self.state.is_failed() && !self.state.has_errors();
        ImportSummary::from_tables(tables, self.state.messages(), success)
    }

    async fn open_connections(&mut self) -> Result<(), ImportError> {
        if self.connections.is_empty() {
            self.connections.push(Arc::clone(&self.connection));
        }
        while self.connections.len() < self.options.worker_count {
            let connection = self.factory.open().await?;
            tracing::debug!(worker = self.connections.len(), "worker connection opened");
            self.connections.push(connection);
        }
        Ok(())
    }

    async fn close_worker_connections(&mut self) {
        for connection in self.connections.drain(..).skip(1) {
            if let Err(e) = connection.close().await {
                tracing::warn!(error = %e, "could not close worker connection");
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
        let connection = Arc::clone(&self.connection);

        if self.options.transaction_control && !connection.in_transaction() {
            connection.begin().await?;
        }
        let plan = TableSetup::new(connection.as_ref(), self.profile, &self.options, &constants)
            .prepare(table, columns, source_file.as_deref())
            .await?;
        for warning in &plan.warnings {
            self.state.warning(warning.clone());
        }

        if self.options.delete_target && !self.targets_deleted {
            let deleted = delete_table_contents(connection.as_ref(), self.profile, &plan.table).await?;
            self.state
                .info(format!("{} row(s) deleted from {}", deleted, plan.table));
        }
        if let Some(template) = &self.options.pre_table_statement {
            let sql = table_statement_sql(template, &plan.table, self.profile);
            if let Some(warning) = run_table_statement(
                connection.as_ref(),
                &sql,
                self.options.ignore_table_statement_errors,
            )
            .await?
            {
                self.state.warning(warning);
            }
        }

        // other workers must see the table set up before they write
        if self.options.transaction_control && connection.in_transaction() {
            connection.commit().await?;
        }
        Ok(plan)
    }

    async fn start_workers(&mut self, plan: TablePlan) -> Result<(), ImportError> {
        self.open_connections().await?;

        let plan = Arc::new(plan);
        let workers = self.options.worker_count;
        let queue = Arc::new(StoppableQueue::new(self.options.queue_size));
        let controller = Arc::new(WorkerController::new(
            queue,
            Arc::clone(&self.state),
            self.signal.clone(),
            workers,
        ));

        let mut handles = Vec::with_capacity(workers);
        for (id, connection) in self.connections.iter().take(workers).enumerate() {
            if self.options.transaction_control && !connection.in_transaction() {
                connection.begin().await?;
            }
            let writer = TableWriter::new(
                Arc::clone(connection),
                self.profile,
                Arc::clone(&plan),
                &self.options,
            );
            let worker = ImportWorker::new(
                id,
                writer,
                Arc::clone(&controller),
                Arc::clone(&self.memory),
                &self.options,
            );
            handles.push(tokio::spawn(worker.run()));
        }
        tracing::debug!(table = %plan.table, workers, "workers started");

        self.current = Some(RunningTable {
            summary: TableSummary::new(&plan.table),
            plan,
            controller,
            workers: handles,
            submitted: 0,
            row_number: 0,
        });
        Ok(())
    }

    /// Wait for every worker and return the first failure
    async fn join_workers(workers: Vec<JoinHandle<WorkerExit>>) -> Option<ImportError> {
        let mut first_error = None;
        for exit in join_all(workers).await {
            let error = match exit {
                Ok(WorkerExit::Failed(e)) => e,
                Ok(WorkerExit::Finished | WorkerExit::Stopped) => continue,
                Err(e) => ImportError::Aborted(format!("worker task ended abnormally: {}", e)),
            };
            first_error.get_or_insert(error);
        }
        first_error
    }

    /// Roll back the caller's connection, logging a failed rollback
    async fn rollback_quietly(&self) {
        if self.connection.in_transaction()
            && let Err(e) = self.connection.rollback().await
        {
            tracing::error!(error = %e, "rollback failed");
        }
    }

    async fn end_transactions(&self, commit: bool) -> Result<(), ImportError> {
        if !self.options.transaction_control {
            return Ok(());
        }
        for connection in &self.connections {
            if !connection.in_transaction() {
                continue;
            }
            if commit {
                connection.commit().await?;
            } else if let Err(e) = connection.rollback().await {
                tracing::error!(error = %e, "rollback failed");
            }
        }
        Ok(())
    }

    /// Drain the queue, wait for the workers and commit their connections
    async fn finish_table(&mut self) -> Result<(), ImportError> {
        let Some(running) = self.current.take() else {
            return Ok(());
        };
        running.controller.finish();
        let failure = Self::join_workers(running.workers).await;
        let mut summary = running.summary;
        self.state.take_table_counters(&mut summary);

        if let Some(error) = failure.or_else(|| {
            self.state
                .is_failed()
                .then(|| ImportError::Aborted(format!("import of {} failed", summary.table)))
        }) {
            self.end_transactions(false).await?;
            self.run_post_statement_on_error(&running.plan.table).await;
            summary.failed = true;
            self.finished.push(summary);
            self.failed = true;
            return Err(error);
        }

        // one commit per worker connection, not atomic across workers
        self.end_transactions(true).await?;

        if let Some(template) = &self.options.post_table_statement {
            let sql = table_statement_sql(template, &running.plan.table, self.profile);
            match run_table_statement(
                self.connection.as_ref(),
                &sql,
                self.options.ignore_table_statement_errors,
            )
            .await
            {
                Ok(Some(warning)) => self.state.warning(warning),
                Ok(None) => {}
                Err(e) => {
                    self.state.error(format!("Error importing table {}: {}", summary.table, e));
                    summary.failed = true;
                    self.finished.push(summary);
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        if self.options.adjust_sequences {
            adjust_sequences(self.connection.as_ref(), self.profile, &running.plan).await?;
        }

        tracing::info!(
            table = %summary.table,
            rows_processed = summary.rows_processed,
            rows_inserted = summary.rows_inserted,
            rows_updated = summary.rows_updated,
            rows_rejected = summary.rows_rejected,
            "table imported"
        );
        self.state.info(summary.message());
        self.finished.push(summary);
        Ok(())
    }

    async fn run_post_statement_on_error(&self, table: &TableIdentifier) {
        if !self.options.run_post_statement_on_error {
            return;
        }
        if let Some(template) = &self.options.post_table_statement {
            let sql = table_statement_sql(template, table, self.profile);
            if let Err(e) = run_table_statement(self.connection.as_ref(), &sql, true).await {
                tracing::warn!(error = %e, "post table statement failed");
            }
        }
    }

    /// Stop the workers of the current table and roll back their work.
    ///
    /// Returns the first worker failure, if any.
    async fn abandon_table(&mut self, regular: bool) -> Option<ImportError> {
        let running = self.current.take()?;
        if regular {
            running.controller.shutdown();
        } else {
            running.controller.cancel();
        }
        let failure = Self::join_workers(running.workers).await;
        let mut summary = running.summary;
        self.state.take_table_counters(&mut summary);
        if let Err(e) = self.end_transactions(false).await {
            tracing::error!(error = %e, "rollback failed");
        }
        self.run_post_statement_on_error(&running.plan.table).await;

        summary.failed = true;
        tracing::warn!(table = %summary.table, "table import abandoned");
        self.finished.push(summary);
        failure
    }

    fn report_progress(&self) {
        let (Some(callback), Some(running)) = (&self.progress, &self.current) else {
            return;
        };
        let interval = self.options.progress_interval;
        if interval == 0 || running.submitted % interval != 0 {
            return;
        }
        let (_, inserted, updated) = self.state.progress();
        callback(ImportProgress {
            table: running.summary.table.clone(),
            rows_processed: running.submitted,
            rows_inserted: inserted,
            rows_updated: updated,
            errors: self.state.error_count(),
        });
    }

    async fn worker_failure(&mut self) -> ImportError {
        self.failed = true;
        self.abandon_table(true)
            .await
            .unwrap_or_else(|| ImportError::Aborted("a worker failed".into()))
    }
}

#[async_trait]
impl RowDataReceiver for ParallelImporter {
    async fn begin_multi_table(&mut self, tables: &[TableIdentifier]) -> Result<(), ImportError> {
        tracing::debug!(tables = tables.len(), "multi-table import");
        self.multi_table = true;
        if !self.options.delete_target {
            return Ok(());
        }
        let connection = Arc::clone(&self.connection);
        let mut messages = MessageBuffer::default();
        let deleted = async {
            if self.options.transaction_control && !connection.in_transaction() {
                connection.begin().await?;
            }
            delete_in_dependency_order(connection.as_ref(), self.profile, tables, &mut messages)
                .await?;
            if self.options.transaction_control {
                connection.commit().await?;
            }
            Ok::<_, ImportError>(())
        }
        .await;
        for message in messages.take_messages() {
            self.state.info(message);
        }
        if let Err(e) = deleted {
            self.rollback_quietly().await;
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
        // the previous table's rows must be written before the next one starts
        self.finish_table().await?;
        if self.signal.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        self.skipping_table = false;
        self.skipped_rows = 0;
        tracing::info!(table = %table, columns = columns.len(), workers = self.options.worker_count, "importing table");

        let prepared = match self.prepare_table(table.clone(), columns, source_file).await {
            Ok(plan) => self.start_workers(plan).await,
            Err(e) => Err(e),
        };
        let Err(e) = prepared else {
            return Ok(());
        };

        tracing::error!(table = %table, error = %e, "table import failed");
        self.state
            .error(format!("Error importing table {}: {}", table, e));
        self.rollback_quietly().await;
        let mut summary = TableSummary::new(&table);
        summary.failed = true;
        self.finished.push(summary);

        if e.is_table_level() && self.options.continue_on_error {
            self.skipping_table = true;
            Ok(())
        } else {
            self.failed = true;
            Err(e)
        }
    }

    async fn process_row(&mut self, values: Vec<Value>) -> Result<(), ImportError> {
        if self.signal.is_cancelled() {
            if let Some(running) = &self.current {
                running.controller.cancel();
            }
            return Err(ImportError::Cancelled);
        }
        let Some(running) = self.current.as_mut() else {
            if self.skipping_table {
                self.skipped_rows += 1;
                return Ok(());
            }
            return Err(ImportError::Configuration(
                "Row received before a target table was set".into(),
            ));
        };
        if running.controller.is_aborted() {
            return Err(self.worker_failure().await);
        }

        running.row_number += 1;
        let row = ImportRow::new(running.row_number, values);
        let controller = Arc::clone(&running.controller);
        let accepted = tokio::select! {
            accepted = controller.queue().put(row) => accepted,
            _ = controller.aborted() => false,
            _ = self.signal.triggered() => false,
        };

        if !accepted {
            if controller.is_aborted() {
                return Err(self.worker_failure().await);
            }
            if self.signal.is_cancelled() {
                controller.cancel();
                return Err(ImportError::Cancelled);
            }
            // regular stop: the row is dropped, the table finishes normally
            return Ok(());
        }

        if let Some(running) = self.current.as_mut() {
            running.submitted += 1;
        }
        self.report_progress();
        Ok(())
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
        self.abandon_table(true).await;
    }

    async fn end_multi_table(&mut self) -> Result<(), ImportError> {
        self.finish_table().await
    }

    async fn import_finished(&mut self) -> Result<(), ImportError> {
        self.finish_table().await?;
        self.state.finish_rejects();
        Ok(())
    }

    async fn import_cancelled(&mut self) {
        self.abandon_table(false).await;
        self.cancelled = true;
    }

    fn should_process_next_row(&self) -> bool {
        if self.skipping_table {
            return false;
        }
        let next = self
            .current
            .as_ref()
            .map_or(self.skipped_rows, |running| running.row_number)
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
            Some(running) => running.row_number += 1,
            None => self.skipped_rows += 1,
        }
    }

    fn record_rejected(&mut self, raw_record: &str, row_number: u64, cause: &str) {
        tracing::warn!(row = row_number, error = %cause, "row rejected by producer");
        self.state.reject(raw_record, row_number, cause);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RowsProducer, TrackingConnection};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn person() -> TrackingConnection {
        TrackingConnection::new("sqlite").with_table(&["id", "name"], &["id"])
    }

    fn rows(count: i64) -> Vec<Vec<Value>> {
        (1..=count)
            .map(|id| vec![Value::Int64(id), Value::from(format!("name {}", id))])
            .collect()
    }

    /// Hands out tracking connections built by `make`
    struct TrackingFactory {
        make: fn() -> TrackingConnection,
        opened: Mutex<Vec<Arc<TrackingConnection>>>,
    }

    impl TrackingFactory {
        fn new(make: fn() -> TrackingConnection) -> Arc<Self> {
            Arc::new(Self {
                make,
                opened: Mutex::new(Vec::new()),
            })
        }

        fn connections(&self) -> Vec<Arc<TrackingConnection>> {
            self.opened.lock().clone()
        }
    }

    #[async_trait]
    impl ConnectionFactory for TrackingFactory {
        async fn open(&self) -> Result<Arc<dyn Connection>, DataloadError> {
            let connection = Arc::new((self.make)());
            self.opened.lock().push(Arc::clone(&connection));
            Ok(connection)
        }
    }

    fn inserts(connection: &TrackingConnection) -> usize {
        connection
            .executed_sql()
            .iter()
            .filter(|sql| sql.starts_with("INSERT"))
            .count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rows_are_spread_over_worker_connections() {
        let main = Arc::new(person());
        let factory = TrackingFactory::new(person);
        let options = ImportOptions::default().with_workers(3, 4);
        let mut importer =
            ParallelImporter::new(main.clone(), factory.clone(), options).expect("importer");
        let mut producer = RowsProducer::new().table("person", &["id", "name"], rows(50));

        let summary = importer.start_import(&mut producer).await.expect("imported");
        assert!(summary.success);
        assert_eq!(summary.total_inserted, 50);
        assert_eq!(summary.tables[0].rows_processed, 50);

        let workers = factory.connections();
        assert_eq!(workers.len(), 2);
        let total: usize = inserts(&main) + workers.iter().map(|c| inserts(c)).sum::<usize>();
        assert_eq!(total, 50);

        // every connection commits its own transaction
        for connection in std::iter::once(&main).chain(workers.iter()) {
            assert_eq!(
                connection.executed_sql().last().map(String::as_str),
                Some("COMMIT")
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_failure_aborts_the_run() {
        fn failing() -> TrackingConnection {
            person().fail_on_value("INSERT", Value::Int64(7), Some(1299))
        }
        let main = Arc::new(failing());
        let factory = TrackingFactory::new(failing);
        let options = ImportOptions::default().with_workers(2, 2);
        let mut importer =
            ParallelImporter::new(main.clone(), factory.clone(), options).expect("importer");
        let mut producer = RowsProducer::new().table("person", &["id", "name"], rows(200));

        let err = importer.start_import(&mut producer).await.expect_err("aborted");
        assert!(matches!(err, ImportError::Statement(_)), "{err}");

        let summary = importer.summary();
        assert!(!summary.success);
        assert!(summary.tables[0].failed);
        assert_eq!(summary.total_rejected, 1);
        for connection in std::iter::once(&main).chain(factory.connections().iter()) {
            assert_eq!(
                connection.executed_sql().last().map(String::as_str),
                Some("ROLLBACK")
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn continue_on_error_keeps_workers_running() {
        fn failing() -> TrackingConnection {
            person().fail_on_value("INSERT", Value::Int64(7), Some(1299))
        }
        let factory = TrackingFactory::new(failing);
        let options = ImportOptions::default()
            .with_workers(2, 2)
            .with_continue_on_error(true)
            .with_savepoints(true);
        let mut importer =
            ParallelImporter::new(Arc::new(failing()), factory, options).expect("importer");
        let mut producer = RowsProducer::new().table("person", &["id", "name"], rows(20));

        let summary = importer.start_import(&mut producer).await.expect("imported");
        assert_eq!(summary.total_inserted, 19);
        assert_eq!(summary.total_rejected, 1);
        assert!(summary.messages.iter().any(|m| m.starts_with("Error importing row 7:")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_signal_stops_the_import() {
        let factory = TrackingFactory::new(person);
        let options = ImportOptions::default().with_workers(2, 2);
        let mut importer =
            ParallelImporter::new(Arc::new(person()), factory, options).expect("importer");
        let mut producer = RowsProducer::new().table("person", &["id", "name"], rows(5));
        producer.cancel();

        let err = importer.start_import(&mut producer).await.expect_err("cancelled");
        assert!(matches!(err, ImportError::Cancelled));
        assert!(!importer.summary().success);
    }

    #[tokio::test]
    async fn failed_rollback_keeps_the_original_error() {
        let main = Arc::new(person().fail_on("DELETE", None).fail_on("ROLLBACK", None));
        let options = ImportOptions::default().with_delete_target(true);
        let mut importer = ParallelImporter::new(main.clone(), TrackingFactory::new(person), options)
            .expect("importer");
        let mut producer = RowsProducer::new()
            .table("a", &["id", "name"], rows(1))
            .table("b", &["id", "name"], rows(1));

        let err = importer.start_import(&mut producer).await.expect_err("delete failed");
        assert!(
            matches!(&err, ImportError::Core(e) if e.to_string().contains("DELETE")),
            "{err}"
        );
        assert!(main.executed_sql().contains(&"ROLLBACK".to_string()));
        assert!(!main.in_transaction());
    }

    #[tokio::test]
    async fn single_worker_uses_only_the_caller_connection() {
        let main = Arc::new(person());
        let factory = TrackingFactory::new(person);
        let mut importer =
            ParallelImporter::new(main.clone(), factory.clone(), ImportOptions::default())
                .expect("importer");
        let mut producer = RowsProducer::new().table("person", &["id", "name"], rows(3));

        importer.start_import(&mut producer).await.expect("imported");
        assert!(factory.connections().is_empty());
        assert_eq!(inserts(&main), 3);
    }
}
