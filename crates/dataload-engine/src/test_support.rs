//! Mock connection shared by the unit tests

use async_trait::async_trait;
use dataload_core::{
    ColumnInfo, Connection, DataloadError, ForeignKeyInfo, PrimaryKeyInfo, QueryResult, Result,
    Row, Savepoint, SavepointSupport, SchemaIntrospection, StatementResult, TableInfo, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ImportError;
use crate::protocol::{
    ColumnIdentifier, ImportSignal, ProducerOutcome, RowDataProducer, RowDataReceiver,
    TableIdentifier,
};

/// A statement pattern that fails with a database error
struct Failure {
    pattern: String,
    code: Option<i32>,
    /// Fail only while the parameters contain this value
    value: Option<Value>,
}

/// Records every executed statement; statements matching a configured
/// pattern fail, everything else reports `affected` rows.
pub(crate) struct TrackingConnection {
    dialect: &'static str,
    executed: Mutex<Vec<String>>,
    parameters: Mutex<Vec<Vec<Value>>>,
    failures: Mutex<Vec<Failure>>,
    columns: Vec<ColumnInfo>,
    primary_key: Vec<String>,
    exists: bool,
    affected: u64,
    scalar: Option<Value>,
    in_transaction: AtomicBool,
    savepoints: bool,
}

impl TrackingConnection {
    pub(crate) fn new(dialect: &'static str) -> Self {
        Self {
            dialect,
            executed: Mutex::new(Vec::new()),
            parameters: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            columns: Vec::new(),
            primary_key: Vec::new(),
            exists: true,
            affected: 1,
            scalar: None,
            in_transaction: AtomicBool::new(false),
            savepoints: true,
        }
    }

    /// Catalog columns; the names in `keys` form the primary key
    pub(crate) fn with_table(mut self, columns: &[&str], keys: &[&str]) -> Self {
        self.columns = columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo {
                name: name.to_string(),
                ordinal: i,
                data_type: if *name == "id" { "INTEGER" } else { "TEXT" }.to_string(),
                nullable: !keys.contains(name),
                default_value: None,
                is_primary_key: keys.contains(name),
                is_auto_increment: *name == "id" && keys.contains(name),
            })
            .collect();
        self.primary_key = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub(crate) fn without_table(mut self) -> Self {
        self.exists = false;
        self
    }

    pub(crate) fn with_affected(mut self, affected: u64) -> Self {
        self.affected = affected;
        self
    }

    pub(crate) fn with_scalar(mut self, value: Value) -> Self {
        self.scalar = Some(value);
        self
    }

    pub(crate) fn without_savepoints(mut self) -> Self {
        self.savepoints = false;
        self
    }

    /// Statements starting with `pattern` fail with vendor `code`
    pub(crate) fn fail_on(self, pattern: &str, code: Option<i32>) -> Self {
        self.failures.lock().push(Failure {
            pattern: pattern.to_string(),
            code,
            value: None,
        });
        self
    }

    /// Statements starting with `pattern` fail when bound to `value`
    pub(crate) fn fail_on_value(self, pattern: &str, value: Value, code: Option<i32>) -> Self {
        self.failures.lock().push(Failure {
            pattern: pattern.to_string(),
            code,
            value: Some(value),
        });
        self
    }

    pub(crate) fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub(crate) fn executed_parameters(&self) -> Vec<Vec<Value>> {
        self.parameters.lock().clone()
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.executed.lock().push(sql.to_string());
        self.parameters.lock().push(params.to_vec());
        let failures = self.failures.lock();
        let failing = failures.iter().find(|f| {
            sql.starts_with(&f.pattern)
                && f.value.as_ref().is_none_or(|v| params.contains(v))
        });
        match failing {
            Some(f) => Err(DataloadError::database(
                format!("statement failed: {}", sql),
                None,
                f.code,
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for TrackingConnection {
    fn driver_name(&self) -> &str {
        self.dialect
    }

    fn dialect_id(&self) -> Option<&'static str> {
        Some(self.dialect)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.record(sql, params)?;
        let affected = if sql.starts_with("SAVEPOINT")
            || sql.starts_with("RELEASE")
            || sql.starts_with("ROLLBACK")
        {
            0
        } else {
            self.affected
        };
        Ok(StatementResult::affected(affected))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.record(sql, params)?;
        Ok(match &self.scalar {
            Some(value) => QueryResult {
                columns: vec!["value".into()],
                rows: vec![Row::new(vec!["value".into()], vec![value.clone()])],
            },
            None => QueryResult::empty(),
        })
    }

    async fn begin(&self) -> Result<()> {
        self.executed.lock().push("BEGIN".into());
        self.in_transaction.store(true, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if self.in_transaction.swap(false, Ordering::AcqRel) {
            self.executed.lock().push("COMMIT".into());
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.in_transaction.swap(false, Ordering::AcqRel) {
            self.executed.lock().push("ROLLBACK".into());
            if self.failures.lock().iter().any(|f| f.pattern == "ROLLBACK") {
                return Err(DataloadError::Connection("connection lost during rollback".into()));
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }

    fn as_savepoint_support(&self) -> Option<&dyn SavepointSupport> {
        if self.savepoints { Some(self) } else { None }
    }
}

#[async_trait]
impl SavepointSupport for TrackingConnection {
    async fn savepoint(&self, name: &str) -> Result<Savepoint> {
        self.executed.lock().push(format!("SAVEPOINT {}", name));
        Ok(Savepoint::new(name))
    }

    async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.executed
            .lock()
            .push(format!("ROLLBACK TO SAVEPOINT {}", savepoint.name()));
        Ok(())
    }

    async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.executed
            .lock()
            .push(format!("RELEASE SAVEPOINT {}", savepoint.name()));
        Ok(())
    }
}

#[async_trait]
impl SchemaIntrospection for TrackingConnection {
    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
        Ok(Vec::new())
    }

    async fn table_exists(&self, _schema: Option<&str>, _table: &str) -> Result<bool> {
        Ok(self.exists)
    }

    async fn get_columns(&self, _schema: Option<&str>, _table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(if self.exists { self.columns.clone() } else { Vec::new() })
    }

    async fn get_foreign_keys(
        &self,
        _schema: Option<&str>,
        _table: &str,
    ) -> Result<Vec<ForeignKeyInfo>> {
        Ok(Vec::new())
    }

    async fn get_primary_key(
        &self,
        _schema: Option<&str>,
        _table: &str,
    ) -> Result<Option<PrimaryKeyInfo>> {
        if self.primary_key.is_empty() || !self.exists {
            return Ok(None);
        }
        Ok(Some(PrimaryKeyInfo {
            name: None,
            columns: self.primary_key.clone(),
        }))
    }
}

/// In-memory producer following the receiver callback order
pub(crate) struct RowsProducer {
    tables: Vec<(TableIdentifier, Vec<ColumnIdentifier>, Vec<Vec<Value>>)>,
    signal: ImportSignal,
}

impl RowsProducer {
    pub(crate) fn new() -> Self {
        Self {
            tables: Vec::new(),
            signal: ImportSignal::new(),
        }
    }

    pub(crate) fn table(mut self, name: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        self.tables.push((
            TableIdentifier::new(name),
            columns.iter().map(|c| ColumnIdentifier::new(*c)).collect(),
            rows,
        ));
        self
    }
}

#[async_trait]
impl RowDataProducer for RowsProducer {
    async fn start(
        &mut self,
        receiver: &mut dyn RowDataReceiver,
    ) -> std::result::Result<ProducerOutcome, ImportError> {
        let multi_table = self.tables.len() > 1;
        if multi_table {
            let names: Vec<TableIdentifier> = self.tables.iter().map(|t| t.0.clone()).collect();
            receiver.begin_multi_table(&names).await?;
        }

        for (table, columns, rows) in self.tables.clone() {
            if let Err(e) = receiver.set_target_table(table, columns, None).await {
                receiver.table_import_error().await;
                return Err(e);
            }
            for values in rows {
                if self.signal.is_cancelled() {
                    receiver.table_import_error().await;
                    receiver.import_cancelled().await;
                    return Err(ImportError::Cancelled);
                }
                if !receiver.should_process_next_row() {
                    receiver.next_row_skipped();
                    if self.signal.is_stopped() {
                        receiver.table_import_finished().await?;
                        if multi_table {
                            receiver.end_multi_table().await?;
                        }
                        receiver.import_finished().await?;
                        return Ok(ProducerOutcome::Stopped);
                    }
                    continue;
                }
                if let Err(e) = receiver.process_row(values).await {
                    receiver.table_import_error().await;
                    return Err(e);
                }
            }
            receiver.table_import_finished().await?;
        }

        if multi_table {
            receiver.end_multi_table().await?;
        }
        receiver.import_finished().await?;
        Ok(ProducerOutcome::Completed)
    }

    fn signal(&self) -> &ImportSignal {
        &self.signal
    }
}
