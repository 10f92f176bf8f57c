//! Counters and message log shared by the workers

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::messages::MessageBuffer;
use crate::rejects::RejectSink;
use crate::summary::TableSummary;
use crate::table_writer::WriteReport;

/// Owned by the controller, handed to every worker.
///
/// Workers only report through these methods; table summaries are taken by
/// the controller once all workers of a table have exited.
pub struct SharedImportState {
    processed: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicBool,
    messages: Mutex<MessageBuffer>,
    rejects: Mutex<RejectSink>,
}

impl SharedImportState {
    pub fn new(messages: MessageBuffer, rejects: RejectSink) -> Self {
        Self {
            processed: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            messages: Mutex::new(messages),
            rejects: Mutex::new(rejects),
        }
    }

    pub fn row_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Fold a worker's write report in; returns the first failure cause
    pub fn record(&self, report: WriteReport) -> Option<String> {
        self.inserted.fetch_add(report.inserted, Ordering::AcqRel);
        self.updated.fetch_add(report.updated, Ordering::AcqRel);
        if report.failures.is_empty() {
            return None;
        }

        let mut first = None;
        let mut messages = self.messages.lock();
        let mut rejects = self.rejects.lock();
        for failure in report.failures {
            rejects.reject(
                &mut messages,
                &failure.raw_record,
                failure.row_number,
                &failure.cause,
            );
            self.rejected.fetch_add(1, Ordering::AcqRel);
            first.get_or_insert_with(|| format!("row {}: {}", failure.row_number, failure.cause));
        }
        first
    }

    pub fn reject(&self, raw_record: &str, row_number: u64, cause: &str) {
        let mut messages = self.messages.lock();
        self.rejects
            .lock()
            .reject(&mut messages, raw_record, row_number, cause);
        self.rejected.fetch_add(1, Ordering::AcqRel);
    }

    /// Flag the run as failed; only the first call records `message`
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let first = !self.failed.swap(true, Ordering::AcqRel);
        if first {
            self.messages.lock().error(message);
        }
        first
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.messages.lock().info(message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.messages.lock().warning(message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.messages.lock().error(message);
    }

    pub fn error_count(&self) -> u64 {
        self.messages.lock().error_count()
    }

    pub fn discard_for_memory(&self) {
        self.messages.lock().discard_for_memory();
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().messages().to_vec()
    }

    pub fn has_errors(&self) -> bool {
        self.messages.lock().has_errors()
    }

    pub fn finish_rejects(&self) {
        let mut messages = self.messages.lock();
        self.rejects.lock().finish(&mut messages);
    }

    /// Counters of the running table
    pub fn progress(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Ordering::Acquire),
            self.inserted.load(Ordering::Acquire),
            self.updated.load(Ordering::Acquire),
        )
    }

    /// Move the per-table counters into `summary` and reset them
    pub fn take_table_counters(&self, summary: &mut TableSummary) {
        summary.rows_processed = self.processed.swap(0, Ordering::AcqRel);
        summary.rows_inserted = self.inserted.swap(0, Ordering::AcqRel);
        summary.rows_updated = self.updated.swap(0, Ordering::AcqRel);
        summary.rows_rejected = self.rejected.swap(0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TableIdentifier;
    use crate::table_writer::RowFailure;

    #[test]
    fn failures_are_rejected_and_counted() {
        let state = SharedImportState::new(MessageBuffer::new(10), RejectSink::Inline);
        state.row_processed();
        state.row_processed();
        let cause = state.record(WriteReport {
            inserted: 1,
            updated: 0,
            ignored: 0,
            failures: vec![RowFailure {
                row_number: 2,
                raw_record: "2\tb".into(),
                cause: "constraint failed".into(),
            }],
        });
        assert_eq!(cause.as_deref(), Some("row 2: constraint failed"));
        assert!(state.has_errors());

        let mut summary = TableSummary::new(&TableIdentifier::new("t"));
        state.take_table_counters(&mut summary);
        assert_eq!(summary.rows_processed, 2);
        assert_eq!(summary.rows_inserted, 1);
        assert_eq!(summary.rows_rejected, 1);
        assert_eq!(state.progress(), (0, 0, 0));
    }

    #[test]
    fn only_the_first_failure_is_recorded() {
        let state = SharedImportState::new(MessageBuffer::new(10), RejectSink::Inline);
        assert!(state.fail("first"));
        assert!(!state.fail("second"));
        assert!(state.is_failed());
        assert_eq!(state.messages(), vec!["first".to_string()]);
    }
}
