//! Memory watermark checks

use crate::ImportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Normal,
    /// Below the low watermark
    Low,
    /// An allocation already failed
    Exhausted,
}

/// Consulted after every row; anything but `Normal` aborts the run
pub trait MemoryWatch: Send + Sync {
    fn status(&self) -> MemoryStatus;
}

/// Never reports low memory
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemoryWatch;

impl MemoryWatch for NoMemoryWatch {
    fn status(&self) -> MemoryStatus {
        MemoryStatus::Normal
    }
}

/// Map a status to the run-level fatal error it causes
pub fn check_memory(watch: &dyn MemoryWatch) -> Result<(), ImportError> {
    match watch.status() {
        MemoryStatus::Normal => Ok(()),
        MemoryStatus::Low => Err(ImportError::LowMemory),
        MemoryStatus::Exhausted => Err(ImportError::OutOfMemory),
    }
}
