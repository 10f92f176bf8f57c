//! Worker loop of the concurrent engine

use dataload_core::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::queue::StoppableQueue;
use super::state::SharedImportState;
use crate::ImportError;
use crate::memory::{MemoryWatch, check_memory};
use crate::options::ImportOptions;
use crate::protocol::ImportSignal;
use crate::table_writer::{TableWriter, WriteReport};

/// Sequence number of the row that tells a worker to exit
pub const SENTINEL_SEQUENCE: i64 = -42;

/// A queued source row
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub sequence: i64,
    pub data: Option<Vec<Value>>,
}

impl ImportRow {
    pub fn new(sequence: u64, data: Vec<Value>) -> Self {
        Self {
            sequence: sequence as i64,
            data: Some(data),
        }
    }

    pub fn sentinel() -> Self {
        Self {
            sequence: SENTINEL_SEQUENCE,
            data: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sequence == SENTINEL_SEQUENCE
    }
}

/// How a worker loop ended
#[derive(Debug)]
pub enum WorkerExit {
    /// Reached its sentinel and flushed
    Finished,
    /// The queue was stopped under it
    Stopped,
    Failed(ImportError),
}

/// Shutdown paths of the workers of one table
pub struct WorkerController {
    queue: Arc<StoppableQueue<ImportRow>>,
    state: Arc<SharedImportState>,
    signal: ImportSignal,
    workers: usize,
    aborted: CancellationToken,
    regular_shutdown: AtomicBool,
}

impl WorkerController {
    pub fn new(
        queue: Arc<StoppableQueue<ImportRow>>,
        state: Arc<SharedImportState>,
        signal: ImportSignal,
        workers: usize,
    ) -> Self {
        Self {
            queue,
            state,
            signal,
            workers,
            aborted: CancellationToken::new(),
            regular_shutdown: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<StoppableQueue<ImportRow>> {
        &self.queue
    }

    /// Enqueue one sentinel per worker after the remaining rows
    pub fn finish(&self) {
        for _ in 0..self.workers {
            self.queue.force_put(ImportRow::sentinel());
        }
    }

    /// Mark the run as failed and make every worker exit
    pub fn abort(&self, message: impl Into<String>) {
        if self.state.fail(message) {
            self.queue.clear();
            for _ in 0..self.workers {
                self.queue.force_put(ImportRow::sentinel());
            }
        }
        self.aborted.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }

    /// Resolves once [`abort`](Self::abort) was called
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.aborted.cancelled()
    }

    /// Requested shutdown: workers leave without logging an error
    pub fn shutdown(&self) {
        self.regular_shutdown.store(true, Ordering::Release);
        self.queue.stop();
    }

    /// Abnormal shutdown
    pub fn cancel(&self) {
        self.queue.stop();
    }

    fn is_regular_shutdown(&self) -> bool {
        self.regular_shutdown.load(Ordering::Acquire) || self.signal.is_stopped()
    }
}

pub struct ImportWorker {
    id: usize,
    writer: TableWriter,
    controller: Arc<WorkerController>,
    memory: Arc<dyn MemoryWatch>,
    continue_on_error: bool,
    commit_every: u64,
    transaction_control: bool,
    uncommitted: u64,
}

impl ImportWorker {
    pub fn new(
        id: usize,
        writer: TableWriter,
        controller: Arc<WorkerController>,
        memory: Arc<dyn MemoryWatch>,
        options: &ImportOptions,
    ) -> Self {
        Self {
            id,
            writer,
            controller,
            memory,
            continue_on_error: options.continue_on_error,
            commit_every: options.commit_every,
            transaction_control: options.transaction_control,
            uncommitted: 0,
        }
    }

    #[tracing::instrument(name = "import_worker", skip(self), fields(worker = self.id, table = %self.writer.plan().table))]
    pub async fn run(mut self) -> WorkerExit {
        tracing::debug!("worker started");
        loop {
            let Some(row) = self.controller.queue.take().await else {
                if self.controller.is_regular_shutdown() {
                    tracing::debug!("worker stopped");
                } else {
                    tracing::error!("worker interrupted");
                }
                self.writer.discard_pending();
                return WorkerExit::Stopped;
            };
            if row.is_sentinel() {
                break;
            }
            let Some(values) = row.data else {
                continue;
            };

            if let Err(e) = self.process(row.sequence as u64, values).await {
                return self.fail(e);
            }
        }

        if self.controller.state.is_failed() {
            self.writer.discard_pending();
            return WorkerExit::Stopped;
        }
        let flushed = match self.writer.flush().await {
            Ok(report) => self.record(report),
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            return self.fail(e);
        }
        tracing::debug!("worker finished");
        WorkerExit::Finished
    }

    async fn process(&mut self, row_number: u64, values: Vec<Value>) -> Result<(), ImportError> {
        self.controller.state.row_processed();
        let report = self.writer.write_row(row_number, values).await?;
        self.record(report)?;
        self.uncommitted += 1;
        self.commit_if_due().await?;

        if let Err(e) = check_memory(self.memory.as_ref()) {
            self.controller.state.discard_for_memory();
            return Err(e);
        }
        Ok(())
    }

    fn record(&self, report: WriteReport) -> Result<(), ImportError> {
        match self.controller.state.record(report) {
            Some(cause) if !self.continue_on_error => Err(ImportError::Statement(cause)),
            _ => Ok(()),
        }
    }

    async fn commit_if_due(&mut self) -> Result<(), ImportError> {
        if !self.transaction_control || self.commit_every == 0 || self.uncommitted < self.commit_every {
            return Ok(());
        }
        let report = self.writer.flush().await?;
        self.record(report)?;
        let connection = Arc::clone(self.writer.connection());
        connection.commit().await?;
        connection.begin().await?;
        self.uncommitted = 0;
        tracing::debug!("worker commit");
        Ok(())
    }

    fn fail(&mut self, error: ImportError) -> WorkerExit {
        tracing::error!(error = %error, "worker failed");
        self.writer.discard_pending();
        self.controller.abort(format!("Worker {} failed: {}", self.id, error));
        WorkerExit::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ConstantColumnValues;
    use crate::memory::NoMemoryWatch;
    use crate::messages::MessageBuffer;
    use crate::protocol::{ColumnIdentifier, TableIdentifier};
    use crate::rejects::RejectSink;
    use crate::table_setup::TableSetup;
    use crate::test_support::TrackingConnection;
    use dataload_core::get_dialect_profile;

    #[test]
    fn sentinel_row() {
        let row = ImportRow::sentinel();
        assert!(row.is_sentinel());
        assert_eq!(row.sequence, -42);
        assert!(row.data.is_none());
        assert!(!ImportRow::new(1, vec![Value::Null]).is_sentinel());
    }

    #[tokio::test]
    async fn abort_replaces_queued_rows_with_sentinels() {
        let queue = Arc::new(StoppableQueue::new(8));
        let state = Arc::new(SharedImportState::new(MessageBuffer::new(10), RejectSink::Inline));
        let controller = WorkerController::new(queue.clone(), state.clone(), ImportSignal::new(), 3);
        for i in 1..=4 {
            assert!(queue.put(ImportRow::new(i, vec![])).await);
        }

        controller.abort("boom");
        controller.abort("again");
        assert!(controller.is_aborted());
        assert!(state.is_failed());
        assert_eq!(queue.len(), 3);
        assert!(queue.poll().is_some_and(|r| r.is_sentinel()));
        assert_eq!(state.messages(), vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn failed_row_is_counted_as_processed() {
        let connection = Arc::new(
            TrackingConnection::new("sqlite")
                .with_table(&["id", "name"], &["id"])
                .fail_on_value("INSERT", Value::Int64(2), Some(1299)),
        );
        let profile = get_dialect_profile("sqlite").expect("sqlite");
        let options = ImportOptions::default();
        let constants = ConstantColumnValues::default();
        let plan = TableSetup::new(connection.as_ref(), profile, &options, &constants)
            .prepare(
                TableIdentifier::new("person"),
                vec![ColumnIdentifier::new("id"), ColumnIdentifier::new("name")],
                None,
            )
            .await
            .expect("plan");
        let writer = TableWriter::new(connection.clone(), profile, Arc::new(plan), &options);

        let queue = Arc::new(StoppableQueue::new(8));
        let state = Arc::new(SharedImportState::new(MessageBuffer::new(10), RejectSink::Inline));
        let controller = Arc::new(WorkerController::new(
            queue.clone(),
            state.clone(),
            ImportSignal::new(),
            1,
        ));
        for id in 1..=3 {
            let row = ImportRow::new(id as u64, vec![Value::Int64(id), Value::from("x")]);
            assert!(queue.put(row).await);
        }
        controller.finish();

        let worker =
            ImportWorker::new(0, writer, controller.clone(), Arc::new(NoMemoryWatch), &options);
        assert!(matches!(worker.run().await, WorkerExit::Failed(ImportError::Statement(_))));
        assert!(controller.is_aborted());
        assert_eq!(state.progress(), (2, 1, 0));
    }
}
