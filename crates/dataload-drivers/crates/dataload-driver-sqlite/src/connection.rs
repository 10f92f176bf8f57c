//! SQLite connection implementation

use async_trait::async_trait;
use dataload_core::{
    ColumnInfo, Connection, DataloadError, ForeignKeyInfo, PrimaryKeyInfo, QueryCancelHandle,
    QueryResult, Result, Row, Savepoint, SavepointSupport, SchemaIntrospection, StatementResult,
    TableInfo, TableType, Value,
};
use parking_lot::Mutex;
use rusqlite::{Connection as RusqliteConnection, InterruptHandle, OpenFlags, params_from_iter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default time a writer waits for a competing writer's lock
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Options applied when a database is opened
#[derive(Debug, Clone)]
pub struct SqliteOpenOptions {
    pub foreign_keys: bool,
    pub wal: bool,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteOpenOptions {
    fn default() -> Self {
        Self {
            foreign_keys: true,
            wal: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Cancel handle for SQLite statements.
///
/// This wraps the rusqlite `InterruptHandle` and can be called from any thread
/// to interrupt a running statement. The interrupted statement returns SQLITE_INTERRUPT.
pub struct SqliteCancelHandle {
    interrupt_handle: Arc<InterruptHandle>,
}

impl QueryCancelHandle for SqliteCancelHandle {
    fn cancel(&self) {
        tracing::debug!("interrupting SQLite statement");
        self.interrupt_handle.interrupt();
    }
}

/// SQLite connection wrapper
pub struct SqliteConnection {
    conn: Mutex<RusqliteConnection>,
    interrupt_handle: Arc<InterruptHandle>,
    in_transaction: AtomicBool,
    closed: AtomicBool,
}

impl SqliteConnection {
    /// Open a SQLite database with default options
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, &SqliteOpenOptions::default())
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with(":memory:", &SqliteOpenOptions::default())
    }

    /// Open a SQLite database
    pub fn open_with(path: &str, options: &SqliteOpenOptions) -> Result<Self> {
        tracing::info!(path = %path, "opening SQLite database");
        let in_memory = path == ":memory:";

        let conn = if in_memory {
            RusqliteConnection::open_in_memory().map_err(|e| {
                DataloadError::Connection(format!("Failed to open in-memory database: {}", e))
            })?
        } else {
            let expanded_path = Self::expand_path(path)?;
            if !expanded_path.starts_with("file:") {
                let file_path = std::path::Path::new(&expanded_path);
                if let Some(parent) = file_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    return Err(DataloadError::Connection(format!(
                        "Parent directory does not exist: {}",
                        parent.display()
                    )));
                }
            }

            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            RusqliteConnection::open_with_flags(&expanded_path, flags).map_err(|e| {
                DataloadError::Connection(format!(
                    "Failed to open SQLite database at '{}': {}",
                    expanded_path, e
                ))
            })?
        };

        conn.pragma_update(None, "foreign_keys", if options.foreign_keys { "ON" } else { "OFF" })
            .map_err(|e| DataloadError::Connection(format!("Failed to set foreign keys: {}", e)))?;

        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))
            .map_err(|e| DataloadError::Connection(format!("Failed to set busy timeout: {}", e)))?;

        if options.wal && !in_memory {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(|e| {
                    DataloadError::Connection(format!("Failed to set journal mode: {}", e))
                })?;
            tracing::debug!(journal_mode = %mode, "journal mode set");
        }

        // Get interrupt handle before wrapping connection in Mutex
        let interrupt_handle = Arc::new(conn.get_interrupt_handle());

        Ok(Self {
            conn: Mutex::new(conn),
            interrupt_handle,
            in_transaction: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Expand path to handle ~ (home directory)
    fn expand_path(path: &str) -> Result<String> {
        if path.starts_with("file:") {
            return Ok(path.to_string());
        }

        if let Some(rest) = path.strip_prefix("~/") {
            let home = dirs::home_dir().ok_or_else(|| {
                DataloadError::Configuration("Unable to determine HOME directory".into())
            })?;
            return Ok(home.join(rest).to_string_lossy().to_string());
        }
        if path.starts_with('~') {
            return Err(DataloadError::Configuration(
                "User-specific home directories (~user) are not supported".into(),
            ));
        }
        Ok(path.to_string())
    }

    /// Run a parameterless control statement (BEGIN/COMMIT/SAVEPOINT ...)
    fn run_control(&self, sql: &str) -> Result<()> {
        tracing::trace!(sql = %sql, "control statement");
        let conn = self.conn.lock();
        conn.execute_batch(sql).map_err(map_sqlite_error)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DataloadError::Connection("Connection is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    fn dialect_id(&self) -> Option<&'static str> {
        Some("sqlite")
    }

    #[tracing::instrument(level = "trace", skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        let rusqlite_params = values_to_rusqlite(params);

        let mut stmt = conn.prepare_cached(sql).map_err(map_sqlite_error)?;
        let rows_affected = stmt
            .execute(params_from_iter(rusqlite_params.iter()))
            .map_err(map_sqlite_error)?;

        tracing::trace!(affected_rows = rows_affected, "statement executed");
        Ok(StatementResult::affected(rows_affected as u64))
    }

    async fn execute_batch(&self, sql: &str, rows: &[Vec<Value>]) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).map_err(map_sqlite_error)?;

        let mut counts = Vec::with_capacity(rows.len());
        for params in rows {
            let rusqlite_params = values_to_rusqlite(params);
            let n = stmt
                .execute(params_from_iter(rusqlite_params.iter()))
                .map_err(map_sqlite_error)?;
            counts.push(n as u64);
        }
        tracing::trace!(batch_size = rows.len(), "batch executed");
        Ok(counts)
    }

    #[tracing::instrument(level = "trace", skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        let rusqlite_params = values_to_rusqlite(params);

        let mut stmt = conn.prepare_cached(sql).map_err(map_sqlite_error)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = Vec::new();
        let mut query_rows = stmt
            .query(params_from_iter(rusqlite_params.iter()))
            .map_err(map_sqlite_error)?;

        while let Some(row) = query_rows.next().map_err(map_sqlite_error)? {
            let mut values = Vec::with_capacity(column_names.len());
            for i in 0..column_names.len() {
                values.push(rusqlite_to_value(row, i)?);
            }
            rows.push(Row::new(column_names.clone(), values));
        }

        tracing::trace!(row_count = rows.len(), "query executed");
        Ok(QueryResult {
            columns: column_names,
            rows,
        })
    }

    async fn begin(&self) -> Result<()> {
        self.ensure_open()?;
        if self.in_transaction.load(Ordering::Acquire) {
            return Ok(());
        }
        // IMMEDIATE takes the write lock up front so concurrent writers wait in
        // the busy handler instead of failing on lock upgrade.
        self.run_control("BEGIN IMMEDIATE")?;
        self.in_transaction.store(true, Ordering::Release);
        tracing::debug!("SQLite transaction started");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if !self.in_transaction.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.run_control("COMMIT")?;
        tracing::debug!("SQLite transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if !self.in_transaction.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.run_control("ROLLBACK")?;
        tracing::debug!("SQLite transaction rolled back");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if self.in_transaction() {
            tracing::warn!("closing SQLite connection with an open transaction, rolling back");
            self.rollback().await?;
        }
        self.closed.store(true, Ordering::Release);
        tracing::debug!("SQLite connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }

    fn as_savepoint_support(&self) -> Option<&dyn SavepointSupport> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(SqliteCancelHandle {
            interrupt_handle: self.interrupt_handle.clone(),
        }))
    }
}

#[async_trait]
impl SavepointSupport for SqliteConnection {
    async fn savepoint(&self, name: &str) -> Result<Savepoint> {
        self.run_control(&format!("SAVEPOINT {}", name))?;
        Ok(Savepoint::new(name))
    }

    async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.run_control(&format!("ROLLBACK TO SAVEPOINT {}", savepoint.name()))
    }

    async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.run_control(&format!("RELEASE SAVEPOINT {}", savepoint.name()))
    }
}

#[async_trait]
impl SchemaIntrospection for SqliteConnection {
    #[tracing::instrument(skip(self))]
    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let result = self
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await?;

        let tables = result
            .rows
            .iter()
            .filter_map(|row| row.get(0).and_then(|v| v.as_str()).map(str::to_string))
            .map(|name| TableInfo {
                schema: Some("main".to_string()),
                name,
                table_type: TableType::Table,
            })
            .collect::<Vec<_>>();

        tracing::trace!(table_count = tables.len(), "tables listed");
        Ok(tables)
    }

    async fn table_exists(&self, _schema: Option<&str>, table: &str) -> Result<bool> {
        let result = self
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                &[Value::from(table)],
            )
            .await?;
        Ok(result.scalar().and_then(Value::as_i64).unwrap_or(0) > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn get_columns(&self, _schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let result = self
            .query(
                "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
                &[Value::from(table)],
            )
            .await?;

        let columns = result
            .rows
            .iter()
            .map(|row| {
                let ordinal = row.get(0).and_then(|v| v.as_i64()).unwrap_or(0) as usize;
                let name = row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
                let data_type = row.get(2).and_then(|v| v.as_str()).unwrap_or("TEXT").to_string();
                let nullable = row.get(3).and_then(|v| v.as_i64()).unwrap_or(0) == 0;
                let default_value = row.get(4).filter(|v| !v.is_null()).map(|v| v.to_string());
                let is_primary_key = row.get(5).and_then(|v| v.as_i64()).unwrap_or(0) > 0;
                let is_auto_increment =
                    is_primary_key && data_type.eq_ignore_ascii_case("INTEGER");

                ColumnInfo {
                    name,
                    ordinal,
                    data_type,
                    nullable,
                    default_value,
                    is_primary_key,
                    is_auto_increment,
                }
            })
            .collect();

        Ok(columns)
    }

    #[tracing::instrument(skip(self))]
    async fn get_foreign_keys(
        &self,
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyInfo>> {
        let result = self
            .query(
                "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
                &[Value::from(table)],
            )
            .await?;

        // One row per column; multi-column keys share the same id
        let mut fks: Vec<(i64, ForeignKeyInfo)> = Vec::new();
        for row in &result.rows {
            let id = row.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
            let ref_table = row.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let from_col = row.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let to_col = row.get(4).and_then(|v| v.as_str()).unwrap_or("").to_string();

            match fks.iter_mut().find(|(fk_id, _)| *fk_id == id) {
                Some((_, fk)) => {
                    fk.columns.push(from_col);
                    fk.referenced_columns.push(to_col);
                }
                None => fks.push((
                    id,
                    ForeignKeyInfo {
                        name: format!("fk_{}_{}_{}", table, ref_table, id),
                        columns: vec![from_col],
                        referenced_table: ref_table,
                        referenced_schema: Some("main".to_string()),
                        referenced_columns: vec![to_col],
                    },
                )),
            }
        }

        Ok(fks.into_iter().map(|(_, fk)| fk).collect())
    }

    async fn get_primary_key(
        &self,
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Option<PrimaryKeyInfo>> {
        let result = self
            .query(
                "SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
                &[Value::from(table)],
            )
            .await?;

        let pk_columns: Vec<String> = result
            .rows
            .iter()
            .filter_map(|r| r.get(0).and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        if pk_columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PrimaryKeyInfo {
                name: None,
                columns: pk_columns,
            }))
        }
    }

    async fn get_unique_keys(&self, _schema: Option<&str>, table: &str) -> Result<Vec<Vec<String>>> {
        let indexes = self
            .query(
                "SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND origin <> 'pk'",
                &[Value::from(table)],
            )
            .await?;

        let mut keys = Vec::new();
        for row in &indexes.rows {
            let Some(index_name) = row.get(0).and_then(|v| v.as_str()) else {
                continue;
            };
            let cols = self
                .query(
                    "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
                    &[Value::from(index_name)],
                )
                .await?;
            let columns: Vec<String> = cols
                .rows
                .iter()
                .filter_map(|r| r.get(0).and_then(|v| v.as_str()).map(str::to_string))
                .collect();
            if !columns.is_empty() {
                keys.push(columns);
            }
        }
        Ok(keys)
    }
}

/// Map a rusqlite error to a classified database error
///
/// Constraint failures carry the extended result code (e.g. 2067 for UNIQUE,
/// 1555 for PRIMARY KEY) so the engine can recognise key violations.
fn map_sqlite_error(err: rusqlite::Error) -> DataloadError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            if e.code == rusqlite::ErrorCode::OperationInterrupted {
                return DataloadError::Cancelled;
            }
            let message = msg.unwrap_or_else(|| e.to_string());
            DataloadError::database(message, None, Some(e.extended_code))
        }
        other => DataloadError::Query(other.to_string()),
    }
}

fn values_to_rusqlite(values: &[Value]) -> Vec<rusqlite::types::Value> {
    values.iter().map(value_to_rusqlite).collect()
}

fn value_to_rusqlite(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Int64(i) => rusqlite::types::Value::Integer(*i),
        Value::Float64(f) => rusqlite::types::Value::Real(*f),
        Value::Decimal(d) => rusqlite::types::Value::Text(d.clone()),
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
        Value::Date(d) => rusqlite::types::Value::Text(d.to_string()),
        Value::Time(t) => rusqlite::types::Value::Text(t.to_string()),
        Value::DateTime(dt) => rusqlite::types::Value::Text(dt.to_string()),
    }
}

fn rusqlite_to_value(row: &rusqlite::Row, idx: usize) -> Result<Value> {
    use rusqlite::types::ValueRef;

    let value_ref = row.get_ref(idx).map_err(map_sqlite_error)?;
    let value = match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).to_string()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SqliteConnection {
        let conn = SqliteConnection::open_in_memory().expect("open in-memory db");
        conn.execute(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT UNIQUE)",
            &[],
        )
        .await
        .expect("create parent");
        conn.execute(
            "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))",
            &[],
        )
        .await
        .expect("create child");
        conn
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let conn = memory_db().await;
        let r = conn
            .execute(
                "INSERT INTO parent (id, name) VALUES (?1, ?2)",
                &[Value::Int64(1), Value::from("a")],
            )
            .await
            .expect("insert");
        assert_eq!(r.affected_rows, 1);

        let q = conn
            .query("SELECT name FROM parent WHERE id = ?1", &[Value::Int64(1)])
            .await
            .expect("select");
        assert_eq!(q.scalar(), Some(&Value::from("a")));
    }

    #[tokio::test]
    async fn test_unique_violation_carries_extended_code() {
        let conn = memory_db().await;
        let sql = "INSERT INTO parent (id, name) VALUES (?1, ?2)";
        conn.execute(sql, &[Value::Int64(1), Value::from("a")])
            .await
            .expect("first insert");

        let pk_err = conn
            .execute(sql, &[Value::Int64(1), Value::from("b")])
            .await
            .expect_err("duplicate pk");
        assert_eq!(pk_err.vendor_code(), Some(1555));

        let uq_err = conn
            .execute(sql, &[Value::Int64(2), Value::from("a")])
            .await
            .expect_err("duplicate name");
        assert_eq!(uq_err.vendor_code(), Some(2067));
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_transaction() {
        let conn = memory_db().await;
        conn.begin().await.expect("begin");
        conn.execute("INSERT INTO parent (id) VALUES (1)", &[])
            .await
            .expect("insert 1");

        let sp = conn.savepoint("sp_1").await.expect("savepoint");
        conn.execute("INSERT INTO parent (id) VALUES (2)", &[])
            .await
            .expect("insert 2");
        conn.rollback_to_savepoint(&sp).await.expect("rollback to");
        conn.release_savepoint(&sp).await.expect("release");
        conn.commit().await.expect("commit");

        let count = conn
            .query("SELECT COUNT(*) FROM parent", &[])
            .await
            .expect("count");
        assert_eq!(count.scalar().and_then(Value::as_i64), Some(1));
    }

    #[tokio::test]
    async fn test_catalog_lookup() {
        let conn = memory_db().await;
        assert!(conn.table_exists(None, "PARENT").await.expect("exists"));
        assert!(!conn.table_exists(None, "nope").await.expect("exists"));

        let cols = conn.get_columns(None, "parent").await.expect("columns");
        assert_eq!(cols.len(), 2);
        assert!(cols[0].is_primary_key);

        let pk = conn.get_primary_key(None, "parent").await.expect("pk");
        assert_eq!(pk.map(|p| p.columns), Some(vec!["id".to_string()]));

        let uniques = conn.get_unique_keys(None, "parent").await.expect("uniques");
        assert_eq!(uniques, vec![vec!["name".to_string()]]);

        let fks = conn.get_foreign_keys(None, "child").await.expect("fks");
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].referenced_table, "parent");
        assert_eq!(fks[0].columns, vec!["parent_id".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_batch_counts() {
        let conn = memory_db().await;
        let rows = vec![vec![Value::Int64(1)], vec![Value::Int64(2)], vec![Value::Int64(3)]];
        let counts = conn
            .execute_batch("INSERT INTO parent (id) VALUES (?1)", &rows)
            .await
            .expect("batch");
        assert_eq!(counts, vec![1, 1, 1]);
    }
}
