//! Message log of an import run
//!
//! Row errors are kept up to a configurable maximum. Beyond that a single
//! marker is appended and further details only go to the tracing log, which
//! bounds memory use on pathological inputs.

/// Appended once when the error limit is exceeded
pub const TOO_MANY_ERRORS: &str = "Too many errors, further error messages are only written to the log";

/// Recorded when the import is aborted for lack of memory
pub const MEMORY_WARNING: &str =
    "Not enough memory to finish the import, import aborted. Pending messages were discarded.";

/// Ordered, append-only message buffer with error counters
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    messages: Vec<String>,
    error_count: u64,
    logged_errors: usize,
    max_errors: usize,
    limit_reported: bool,
    has_warnings: bool,
}

impl MessageBuffer {
    pub fn new(max_errors: usize) -> Self {
        Self {
            messages: Vec::new(),
            error_count: 0,
            logged_errors: 0,
            max_errors,
            limit_reported: false,
            has_warnings: false,
        }
    }

    /// Informational message, never throttled
    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(message = %message, "import message");
        self.messages.push(message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(message = %message, "import warning");
        self.has_warnings = true;
        self.messages.push(message);
    }

    /// Row or table error; throttled after `max_errors` entries
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error_count += 1;

        if self.logged_errors < self.max_errors {
            tracing::warn!(error = %message, "import error");
            self.logged_errors += 1;
            self.messages.push(message);
        } else {
            if !self.limit_reported {
                self.limit_reported = true;
                self.messages.push(TOO_MANY_ERRORS.to_string());
            }
            tracing::debug!(error = %message, "import error (not kept)");
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn has_warnings(&self) -> bool {
        self.has_warnings
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Reset everything, e.g. when a new file starts in single-file mode
    pub fn clear(&mut self) {
        self.messages.clear();
        self.error_count = 0;
        self.logged_errors = 0;
        self.limit_reported = false;
        self.has_warnings = false;
    }

    /// Drop pending messages to free memory and leave the fixed warning
    pub fn discard_for_memory(&mut self) {
        self.messages.clear();
        self.messages.shrink_to_fit();
        self.messages.push(MEMORY_WARNING.to_string());
        self.has_warnings = true;
    }

    /// Move all messages out, e.g. into a run summary
    pub fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_throttled_with_single_marker() {
        let mut log = MessageBuffer::new(2);
        for i in 0..5 {
            log.error(format!("row {} failed", i));
        }
        assert_eq!(log.error_count(), 5);
        assert_eq!(
            log.messages(),
            &[
                "row 0 failed".to_string(),
                "row 1 failed".to_string(),
                TOO_MANY_ERRORS.to_string()
            ]
        );
    }

    #[test]
    fn info_is_not_throttled() {
        let mut log = MessageBuffer::new(0);
        log.error("x");
        log.info("table done");
        log.info("table done");
        assert_eq!(log.messages().len(), 3);
        assert!(log.has_errors());
        assert!(!log.has_warnings());
    }

    #[test]
    fn memory_discard_keeps_fixed_warning() {
        let mut log = MessageBuffer::new(10);
        log.info("a");
        log.error("b");
        log.discard_for_memory();
        assert_eq!(log.messages(), &[MEMORY_WARNING.to_string()]);
        assert!(log.has_warnings());
    }
}
