//! Import configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::ImportError;

/// Conflict-resolution semantics of an import run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Plain INSERT
    #[default]
    Insert,
    /// UPDATE of existing rows only
    Update,
    /// Try INSERT, fall back to UPDATE on a key violation
    #[serde(alias = "insert,update", alias = "insert_update")]
    InsertUpdate,
    /// Try UPDATE, fall back to INSERT when no row was updated
    #[serde(alias = "update,insert", alias = "update_insert")]
    UpdateInsert,
    /// Native single-statement insert-or-update
    Upsert,
    /// INSERT that skips rows violating a unique key
    #[serde(alias = "insert_ignore")]
    InsertIgnore,
}

impl ImportMode {
    /// Modes that prepare an UPDATE statement
    pub fn needs_update(&self) -> bool {
        matches!(
            self,
            ImportMode::Update | ImportMode::InsertUpdate | ImportMode::UpdateInsert
        )
    }

    /// Modes that prepare an INSERT-like statement
    pub fn needs_insert(&self) -> bool {
        !matches!(self, ImportMode::Update)
    }

    /// Modes with a fallback to a second statement
    pub fn is_dual(&self) -> bool {
        matches!(self, ImportMode::InsertUpdate | ImportMode::UpdateInsert)
    }

    /// Batching requires that no row needs its own result before the next
    /// action can be decided.
    pub fn allows_batch(&self) -> bool {
        matches!(
            self,
            ImportMode::Insert | ImportMode::Upsert | ImportMode::InsertIgnore
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Insert => "insert",
            ImportMode::Update => "update",
            ImportMode::InsertUpdate => "insert,update",
            ImportMode::UpdateInsert => "update,insert",
            ImportMode::Upsert => "upsert",
            ImportMode::InsertIgnore => "insertIgnore",
        }
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportMode {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "insert" => Ok(ImportMode::Insert),
            "update" => Ok(ImportMode::Update),
            "insert,update" | "insertupdate" => Ok(ImportMode::InsertUpdate),
            "update,insert" | "updateinsert" => Ok(ImportMode::UpdateInsert),
            "upsert" => Ok(ImportMode::Upsert),
            "insertignore" => Ok(ImportMode::InsertIgnore),
            _ => Err(ImportError::Configuration(format!(
                "Unknown import mode '{}'",
                s
            ))),
        }
    }
}

/// Options for import operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Conflict-resolution mode
    pub mode: ImportMode,
    /// Columns identifying a row; empty = use the primary key
    pub key_columns: Vec<String>,
    /// Rows per batch when batching is enabled
    pub batch_size: usize,
    /// Send rows in batches where the mode allows it
    pub use_batch: bool,
    /// Commit after this many rows; 0 = once per table
    pub commit_every: u64,
    /// Let the engine begin/commit/rollback transactions
    pub transaction_control: bool,
    /// Record row errors and keep going
    pub continue_on_error: bool,
    /// Wrap each row statement in a savepoint (with `continue_on_error`)
    pub use_savepoints: bool,
    /// Maximum number of row errors kept in the message log
    pub max_error_messages: usize,
    /// First source row to import (1-based)
    pub start_row: Option<u64>,
    /// Last source row to import (1-based, inclusive)
    pub end_row: Option<u64>,
    /// Report progress every N rows; 0 = never
    pub progress_interval: u64,
    /// Delete the target table's contents before importing
    pub delete_target: bool,
    /// Create the target table when it does not exist
    pub create_target: bool,
    /// Do not verify that the target table exists
    pub skip_target_check: bool,
    /// Order multi-table imports by foreign key dependencies
    pub check_dependencies: bool,
    /// Statement run before each table (`${table.name}`, `${table.expression}`)
    pub pre_table_statement: Option<String>,
    /// Statement run after each table
    pub post_table_statement: Option<String>,
    /// Failing pre/post statements only produce a warning
    pub ignore_table_statement_errors: bool,
    /// Run the post-table statement even after a table-level error
    pub run_post_statement_on_error: bool,
    /// Bring sequences/identity counters in line after each table
    pub adjust_sequences: bool,
    /// Constant column definitions, `column=value`
    pub constant_values: Vec<String>,
    /// Source columns holding file names of large object values
    pub lob_columns: Vec<String>,
    /// Write rejected rows to this file instead of the message log
    pub bad_file: Option<PathBuf>,
    /// Additional condition appended to UPDATE statements
    pub where_clause: Option<String>,
    /// Skip source columns missing in the target instead of failing
    pub ignore_missing_columns: bool,
    /// Number of workers of the concurrent engine
    pub worker_count: usize,
    /// Capacity of the concurrent engine's row queue
    pub queue_size: usize,
    /// User variables available as `$[name]` in constant values
    pub variables: HashMap<String, String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            mode: ImportMode::Insert,
            key_columns: Vec::new(),
            batch_size: 100,
            use_batch: false,
            commit_every: 0,
            transaction_control: true,
            continue_on_error: false,
            use_savepoints: false,
            max_error_messages: 100,
            start_row: None,
            end_row: None,
            progress_interval: 100,
            delete_target: false,
            create_target: false,
            skip_target_check: false,
            check_dependencies: false,
            pre_table_statement: None,
            post_table_statement: None,
            ignore_table_statement_errors: true,
            run_post_statement_on_error: false,
            adjust_sequences: false,
            constant_values: Vec::new(),
            lob_columns: Vec::new(),
            bad_file: None,
            where_clause: None,
            ignore_missing_columns: false,
            worker_count: 1,
            queue_size: 500,
            variables: HashMap::new(),
        }
    }
}

impl ImportOptions {
    /// Parse options from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ImportError> {
        let options: ImportOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ImportError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject inconsistent settings before anything touches the database
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.delete_target && self.mode != ImportMode::Insert {
            return Err(ImportError::Configuration(format!(
                "Deleting the target table is only allowed in insert mode (mode is {})",
                self.mode
            )));
        }
        if self.batch_size == 0 {
            return Err(ImportError::Configuration("batch_size must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(ImportError::Configuration("worker_count must be at least 1".into()));
        }
        if self.queue_size == 0 {
            return Err(ImportError::Configuration("queue_size must be at least 1".into()));
        }
        if let (Some(start), Some(end)) = (self.start_row, self.end_row)
            && start > end
        {
            return Err(ImportError::Configuration(format!(
                "start_row {} is after end_row {}",
                start, end
            )));
        }
        Ok(())
    }

    /// Batching is only used where the mode allows it
    pub fn batch_enabled(&self) -> bool {
        self.use_batch && self.batch_size > 1 && self.mode.allows_batch()
    }

    pub fn with_mode(mut self, mode: ImportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_key_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self.use_batch = size > 1;
        self
    }

    pub fn with_commit_every(mut self, rows: u64) -> Self {
        self.commit_every = rows;
        self
    }

    pub fn with_transaction_control(mut self, enabled: bool) -> Self {
        self.transaction_control = enabled;
        self
    }

    pub fn with_continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn with_savepoints(mut self, enabled: bool) -> Self {
        self.use_savepoints = enabled;
        self
    }

    pub fn with_row_range(mut self, start: Option<u64>, end: Option<u64>) -> Self {
        self.start_row = start;
        self.end_row = end;
        self
    }

    pub fn with_delete_target(mut self, enabled: bool) -> Self {
        self.delete_target = enabled;
        self
    }

    pub fn with_create_target(mut self, enabled: bool) -> Self {
        self.create_target = enabled;
        self
    }

    pub fn with_check_dependencies(mut self, enabled: bool) -> Self {
        self.check_dependencies = enabled;
        self
    }

    pub fn with_table_statements(mut self, pre: Option<String>, post: Option<String>) -> Self {
        self.pre_table_statement = pre;
        self.post_table_statement = post;
        self
    }

    pub fn with_constant_values<S: Into<String>>(
        mut self,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        self.constant_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_lob_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.lob_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bad_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.bad_file = Some(path.into());
        self
    }

    pub fn with_where_clause(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn with_workers(mut self, workers: usize, queue_size: usize) -> Self {
        self.worker_count = workers;
        self.queue_size = queue_size;
        self
    }

    pub fn with_max_error_messages(mut self, max: usize) -> Self {
        self.max_error_messages = max;
        self
    }

    pub fn with_progress_interval(mut self, rows: u64) -> Self {
        self.progress_interval = rows;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("insert".parse::<ImportMode>().ok(), Some(ImportMode::Insert));
        assert_eq!(
            "insert, update".parse::<ImportMode>().ok(),
            Some(ImportMode::InsertUpdate)
        );
        assert_eq!(
            "UPDATE,INSERT".parse::<ImportMode>().ok(),
            Some(ImportMode::UpdateInsert)
        );
        assert_eq!(
            "insert_ignore".parse::<ImportMode>().ok(),
            Some(ImportMode::InsertIgnore)
        );
        assert!("merge".parse::<ImportMode>().is_err());
    }

    #[test]
    fn test_batch_only_for_single_statement_modes() {
        let options = ImportOptions::default().with_batch_size(50);
        assert!(options.batch_enabled());
        let options = options.with_mode(ImportMode::InsertUpdate);
        assert!(!options.batch_enabled());
    }

    #[test]
    fn test_statements_needed_per_mode() {
        assert!(ImportMode::Update.needs_update() && !ImportMode::Update.needs_insert());
        assert!(ImportMode::InsertUpdate.is_dual());
        assert!(ImportMode::UpdateInsert.needs_insert() && ImportMode::UpdateInsert.needs_update());
        assert!(!ImportMode::Upsert.needs_update());
        assert!(!ImportMode::InsertIgnore.is_dual());
    }

    #[test]
    fn test_options_from_toml() {
        let options = ImportOptions::from_toml_str(
            r#"
            mode = "insert,update"
            key_columns = ["id"]
            continue_on_error = true
            use_savepoints = true
            start_row = 2
            constant_values = ["source=$[file_name]"]
            "#,
        )
        .expect("valid toml");

        assert_eq!(options.mode, ImportMode::InsertUpdate);
        assert_eq!(options.key_columns, vec!["id".to_string()]);
        assert!(options.continue_on_error);
        assert_eq!(options.start_row, Some(2));
        assert_eq!(options.batch_size, 100);
        assert!(options.transaction_control);
    }

    #[test]
    fn test_delete_target_only_in_insert_mode() {
        let err = ImportOptions::from_toml_str("mode = \"upsert\"\ndelete_target = true")
            .expect_err("invalid combination");
        assert!(matches!(err, ImportError::Configuration(_)));
    }

    #[test]
    fn test_invalid_row_range() {
        let options = ImportOptions::default().with_row_range(Some(10), Some(5));
        assert!(options.validate().is_err());
    }
}
