//! Row dispatch for one target table on one connection
//!
//! Both engines funnel rows through a [`TableWriter`]: the coordinator owns
//! one, every worker of the concurrent engine owns its own.

use dataload_core::{Connection, DataloadError, DialectProfile, SavepointNames, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::ImportError;
use crate::dml::{RowOutcome, StatementFailure, StatementOutcome, StatementTemplate};
use crate::options::{ImportMode, ImportOptions};
use crate::rejects::raw_record;
use crate::table_setup::{ConstantSlot, LobKind, TablePlan};

/// A row that could not be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub row_number: u64,
    pub raw_record: String,
    pub cause: String,
}

/// Counters produced by one write or flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub inserted: u64,
    pub updated: u64,
    pub ignored: u64,
    pub failures: Vec<RowFailure>,
}

impl WriteReport {
    pub fn merge(&mut self, other: WriteReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.ignored += other.ignored;
        self.failures.extend(other.failures);
    }

    fn count(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Inserted => self.inserted += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::Ignored | RowOutcome::Unchanged => self.ignored += 1,
        }
    }

    fn fail(&mut self, row_number: u64, raw_record: String, cause: impl Into<String>) {
        self.failures.push(RowFailure {
            row_number,
            raw_record,
            cause: cause.into(),
        });
    }
}

enum RowError {
    /// Only this row is affected
    Row(String),
    Fatal(ImportError),
}

impl From<DataloadError> for RowError {
    fn from(e: DataloadError) -> Self {
        match e {
            DataloadError::Cancelled => RowError::Fatal(ImportError::Cancelled),
            other => RowError::Row(other.to_string()),
        }
    }
}

struct PendingRow {
    row_number: u64,
    raw_record: String,
}

pub struct TableWriter {
    connection: Arc<dyn Connection>,
    profile: &'static DialectProfile,
    plan: Arc<TablePlan>,
    row_savepoints: bool,
    batch_size: usize,
    pending: Vec<PendingRow>,
    pending_parameters: Vec<Vec<Value>>,
    savepoint_names: SavepointNames,
}

impl TableWriter {
    pub fn new(
        connection: Arc<dyn Connection>,
        profile: &'static DialectProfile,
        plan: Arc<TablePlan>,
        options: &ImportOptions,
    ) -> Self {
        Self {
            connection,
            profile,
            plan,
            row_savepoints: options.use_savepoints && options.continue_on_error,
            batch_size: options.batch_size.max(1),
            pending: Vec::new(),
            pending_parameters: Vec::new(),
            savepoint_names: SavepointNames::new(),
        }
    }

    pub fn plan(&self) -> &TablePlan {
        &self.plan
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Forget buffered rows, e.g. after the transaction was rolled back
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_parameters.clear();
    }

    /// Write one raw source row
    pub async fn write_row(
        &mut self,
        row_number: u64,
        values: Vec<Value>,
    ) -> Result<WriteReport, ImportError> {
        let mut report = WriteReport::default();
        let raw = raw_record(&values);

        let (mapped, constants) = match self.row_parameters(&values).await {
            Ok(parameters) => parameters,
            Err(RowError::Row(cause)) => {
                report.fail(row_number, raw, cause);
                return Ok(report);
            }
            Err(RowError::Fatal(e)) => return Err(e),
        };

        if self.plan.batch {
            if let Some(insert) = &self.plan.statements.insert {
                self.pending_parameters
                    .push(insert.parameters(&mapped, &constants));
                self.pending.push(PendingRow {
                    row_number,
                    raw_record: raw,
                });
                if self.pending.len() >= self.batch_size {
                    return self.flush().await;
                }
                return Ok(report);
            }
        }

        match self.dispatch(&mapped, &constants, false).await? {
            Ok(outcome) => report.count(outcome),
            Err(failure) => {
                tracing::debug!(row = row_number, error = %failure, "row failed");
                report.fail(row_number, raw, failure.to_string());
            }
        }
        Ok(report)
    }

    /// Send buffered rows as one atomic batch
    pub async fn flush(&mut self) -> Result<WriteReport, ImportError> {
        let mut report = WriteReport::default();
        if self.pending.is_empty() {
            return Ok(report);
        }
        let pending = std::mem::take(&mut self.pending);
        let parameters = std::mem::take(&mut self.pending_parameters);
        let plan = Arc::clone(&self.plan);
        let Some(insert) = plan.statements.insert.as_ref() else {
            return Ok(report);
        };

        let connection = Arc::clone(&self.connection);
        let own_transaction = !connection.in_transaction();
        let support = connection.as_savepoint_support();
        let savepoint = if own_transaction {
            connection.begin().await?;
            None
        } else {
            match support {
                Some(support) => Some(support.savepoint(&self.savepoint_names.next("dl_batch")).await?),
                None => None,
            }
        };

        match connection.execute_batch(&insert.sql, &parameters).await {
            Ok(counts) => {
                if own_transaction {
                    connection.commit().await?;
                } else if let (Some(support), Some(savepoint)) = (support, &savepoint) {
                    support.release_savepoint(savepoint).await?;
                }
                for count in counts {
                    report.count(if count > 0 {
                        RowOutcome::Inserted
                    } else {
                        RowOutcome::Ignored
                    });
                }
                tracing::trace!(rows = pending.len(), "batch flushed");
                Ok(report)
            }
            Err(error) => {
                let contained = if own_transaction {
                    connection.rollback().await?;
                    true
                } else if let (Some(support), Some(savepoint)) = (support, &savepoint) {
                    support.rollback_to_savepoint(savepoint).await?;
                    true
                } else {
                    false
                };

                if matches!(error, DataloadError::Cancelled) {
                    return Err(ImportError::Cancelled);
                }

                if !contained {
                    // rows before the failing one may already be applied
                    let cause = format!("Batch failed: {}", error);
                    for row in pending {
                        report.fail(row.row_number, row.raw_record, cause.clone());
                    }
                    return Ok(report);
                }

                tracing::debug!(
                    rows = pending.len(),
                    error = %error,
                    "batch failed, replaying rows one by one"
                );
                for (row, params) in pending.into_iter().zip(parameters) {
                    match self
                        .execute(insert, &params, self.plan.ignore_key_violations, true)
                        .await?
                    {
                        Ok(count) => report.count(if count > 0 {
                            RowOutcome::Inserted
                        } else {
                            RowOutcome::Ignored
                        }),
                        Err(failure)
                            if failure.is_key_violation() && self.plan.ignore_key_violations =>
                        {
                            report.count(RowOutcome::Ignored)
                        }
                        Err(failure) => {
                            report.fail(row.row_number, row.raw_record, failure.to_string())
                        }
                    }
                }
                Ok(report)
            }
        }
    }

    async fn row_parameters(
        &self,
        values: &[Value],
    ) -> Result<(Vec<Value>, Vec<Value>), RowError> {
        if values.len() != self.plan.columns.len() {
            return Err(RowError::Row(format!(
                "Expected {} values but got {}",
                self.plan.columns.len(),
                values.len()
            )));
        }

        let mut mapped = self.plan.map_row(values);
        for (index, kind) in &self.plan.lob_columns {
            if let Some(value) = mapped.get(*index) {
                let resolved = self.read_lob(value, *kind).await?;
                mapped[*index] = resolved;
            }
        }

        let mut constants = Vec::with_capacity(self.plan.constants.len());
        for slot in &self.plan.constants {
            constants.push(match slot {
                ConstantSlot::Fixed(value) => value.clone(),
                ConstantSlot::Inline => Value::Null,
                ConstantSlot::Select {
                    sql,
                    source_indices,
                } => {
                    let params: Vec<Value> = source_indices
                        .iter()
                        .map(|i| values.get(*i).cloned().unwrap_or(Value::Null))
                        .collect();
                    let result = self.connection.query(sql, &params).await?;
                    result.scalar().cloned().unwrap_or(Value::Null)
                }
            });
        }

        Ok((mapped, constants))
    }

    async fn read_lob(&self, value: &Value, kind: LobKind) -> Result<Value, RowError> {
        let Some(name) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(value.clone());
        };
        let path = match &self.plan.source_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| RowError::Row(format!("Could not read {}: {}", path.display(), e)))?;
        tracing::trace!(path = %path.display(), length = bytes.len(), "large object read");

        Ok(match kind {
            LobKind::Binary => Value::Bytes(bytes),
            LobKind::Text => Value::String(String::from_utf8(bytes).map_err(|_| {
                RowError::Row(format!("{} is not valid UTF-8 text", path.display()))
            })?),
            LobKind::Detect => match String::from_utf8(bytes) {
                Ok(text) => Value::String(text),
                Err(e) => Value::Bytes(e.into_bytes()),
            },
        })
    }

    /// Mode-specific control flow for one row
    async fn dispatch(
        &self,
        mapped: &[Value],
        constants: &[Value],
        isolate: bool,
    ) -> Result<Result<RowOutcome, StatementFailure>, ImportError> {
        let plan = Arc::clone(&self.plan);
        let insert = plan.statements.insert.as_ref();
        let update = plan.statements.update.as_ref();

        let outcome = match (plan.mode, insert, update) {
            (ImportMode::Insert | ImportMode::Upsert | ImportMode::InsertIgnore, Some(insert), _) => {
                let speculative = plan.ignore_key_violations;
                match self.run(insert, mapped, constants, speculative, isolate).await? {
                    Ok(0) if plan.mode == ImportMode::InsertIgnore => Ok(RowOutcome::Ignored),
                    Ok(_) => Ok(RowOutcome::Inserted),
                    Err(f) if speculative && f.is_key_violation() => Ok(RowOutcome::Ignored),
                    Err(f) => Err(f),
                }
            }
            (ImportMode::InsertUpdate, Some(insert), update) => {
                match self.run(insert, mapped, constants, true, isolate).await? {
                    Ok(_) => Ok(RowOutcome::Inserted),
                    Err(f) if f.is_key_violation() => match update {
                        Some(update) => {
                            match self.run(update, mapped, constants, false, isolate).await? {
                                Ok(0) => Ok(RowOutcome::Unchanged),
                                Ok(_) => Ok(RowOutcome::Updated),
                                Err(f) => Err(f),
                            }
                        }
                        // nothing to update, the existing row stays as it is
                        None => Ok(RowOutcome::Ignored),
                    },
                    Err(f) => Err(f),
                }
            }
            (ImportMode::UpdateInsert, Some(insert), update) => {
                let updated = match update {
                    Some(update) => self.run(update, mapped, constants, false, isolate).await?,
                    None => Ok(0),
                };
                match updated {
                    Ok(0) => match self.run(insert, mapped, constants, false, isolate).await? {
                        Ok(_) => Ok(RowOutcome::Inserted),
                        Err(f) => Err(f),
                    },
                    Ok(_) => Ok(RowOutcome::Updated),
                    Err(f) => Err(f),
                }
            }
            (ImportMode::Update, _, Some(update)) => {
                match self.run(update, mapped, constants, false, isolate).await? {
                    Ok(0) => Ok(RowOutcome::Unchanged),
                    Ok(_) => Ok(RowOutcome::Updated),
                    Err(f) => Err(f),
                }
            }
            (mode, _, _) => {
                return Err(ImportError::Configuration(format!(
                    "No statement prepared for mode {} on table {}",
                    mode, plan.table
                )));
            }
        };
        Ok(outcome)
    }

    async fn run(
        &self,
        template: &StatementTemplate,
        mapped: &[Value],
        constants: &[Value],
        speculative: bool,
        isolate: bool,
    ) -> Result<StatementOutcome, ImportError> {
        let params = template.parameters(mapped, constants);
        self.execute(template, &params, speculative, isolate).await
    }

    /// Execute one statement, inside a savepoint where a failure must not
    /// affect the enclosing transaction.
    async fn execute(
        &self,
        template: &StatementTemplate,
        params: &[Value],
        speculative: bool,
        isolate: bool,
    ) -> Result<StatementOutcome, ImportError> {
        let wants_savepoint = isolate
            || self.row_savepoints
            || (speculative && self.profile.error_aborts_transaction);
        let support = if wants_savepoint && self.connection.in_transaction() {
            self.connection.as_savepoint_support()
        } else {
            None
        };
        let savepoint = match support {
            Some(support) => Some(support.savepoint(&self.savepoint_names.next("dl_row")).await?),
            None => None,
        };

        let result = self.connection.execute(&template.sql, params).await;

        if let (Some(support), Some(savepoint)) = (support, &savepoint) {
            match &result {
                Ok(_) => support.release_savepoint(savepoint).await?,
                Err(_) => support.rollback_to_savepoint(savepoint).await?,
            }
        }

        match result {
            Ok(result) => Ok(Ok(result.affected_rows)),
            Err(DataloadError::Cancelled) => Err(ImportError::Cancelled),
            Err(error) => Ok(Err(StatementFailure::classified(self.profile, error))),
        }
    }
}
