//! Progress reporting and run summaries

use crate::protocol::TableIdentifier;

/// Progress callback for import operations
pub type ImportProgressCallback = Box<dyn Fn(ImportProgress) + Send + Sync>;

/// Import progress information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportProgress {
    /// Table being imported
    pub table: String,
    /// Rows handed to the engine for this table so far
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    /// Errors of the whole run so far
    pub errors: u64,
}

/// Counters of one imported table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSummary {
    pub table: String,
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_rejected: u64,
    /// The table was abandoned after a table-level error
    pub failed: bool,
}

impl TableSummary {
    pub fn new(table: &TableIdentifier) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    /// Human-readable line for the message log
    pub fn message(&self) -> String {
        let mut text = format!("{}: {} row(s) inserted", self.table, self.rows_inserted);
        if self.rows_updated > 0 {
            text.push_str(&format!(", {} row(s) updated", self.rows_updated));
        }
        if self.rows_rejected > 0 {
            text.push_str(&format!(", {} row(s) rejected", self.rows_rejected));
        }
        text
    }
}

/// Result of an import run
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    pub tables: Vec<TableSummary>,
    pub total_inserted: u64,
    pub total_updated: u64,
    pub total_rejected: u64,
    pub messages: Vec<String>,
    /// No error was recorded and the run was neither cancelled nor aborted
    pub success: bool,
}

impl ImportSummary {
    pub(crate) fn from_tables(tables: Vec<TableSummary>, messages: Vec<String>, success: bool) -> Self {
        Self {
            total_inserted: tables.iter().map(|t| t.rows_inserted).sum(),
            total_updated: tables.iter().map(|t| t.rows_updated).sum(),
            total_rejected: tables.iter().map(|t| t.rows_rejected).sum(),
            tables,
            messages,
            success,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSummary> {
        self.tables
            .iter()
            .find(|t| t.table.eq_ignore_ascii_case(name))
    }

    pub fn has_errors(&self) -> bool {
        self.total_rejected > 0 || self.tables.iter().any(|t| t.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_summed_over_tables() {
        let mut a = TableSummary::new(&TableIdentifier::new("a"));
        a.rows_inserted = 3;
        a.rows_updated = 1;
        let mut b = TableSummary::new(&TableIdentifier::new("b"));
        b.rows_inserted = 2;
        b.rows_rejected = 1;

        let summary = ImportSummary::from_tables(vec![a, b], Vec::new(), false);
        assert_eq!(summary.total_inserted, 5);
        assert_eq!(summary.total_updated, 1);
        assert_eq!(summary.total_rejected, 1);
        assert!(summary.has_errors());
        assert_eq!(summary.table("B").map(|t| t.rows_inserted), Some(2));
        assert_eq!(
            summary.tables[1].message(),
            "b: 2 row(s) inserted, 1 row(s) rejected"
        );
    }
}
