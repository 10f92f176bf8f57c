use dataload_core::{DataloadError, DialectProfile};
use std::fmt;

/// Classified cause of a failed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A unique or primary key constraint was violated
    KeyViolation,
    Other,
}

/// A failed statement execution together with its classification
#[derive(Debug)]
pub struct StatementFailure {
    pub kind: FailureKind,
    pub error: DataloadError,
}

impl StatementFailure {
    pub fn classified(profile: &DialectProfile, error: DataloadError) -> Self {
        Self {
            kind: classify(profile, &error),
            error,
        }
    }

    pub fn is_key_violation(&self) -> bool {
        self.kind == FailureKind::KeyViolation
    }
}

impl fmt::Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Result of one statement execution: affected rows or a classified failure
pub type StatementOutcome = Result<u64, StatementFailure>;

/// Decide whether `error` is a unique key violation.
///
/// Without classification data for the dialect every failure counts as a key
/// violation, so insert/update fallbacks are always attempted. Cancellation
/// is never a key violation.
pub fn classify(profile: &DialectProfile, error: &DataloadError) -> FailureKind {
    if matches!(error, DataloadError::Cancelled) {
        return FailureKind::Other;
    }
    match profile.is_key_violation(error) {
        Some(true) | None => FailureKind::KeyViolation,
        Some(false) => FailureKind::Other,
    }
}

/// What happened to one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
    /// An update matched no row and there was no insert to fall back to
    Unchanged,
    /// Skipped by insert-ignore, or an insert conflict without update statement
    Ignored,
}
