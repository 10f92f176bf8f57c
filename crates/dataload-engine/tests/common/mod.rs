//! Shared helpers for the SQLite-backed import tests

#![allow(dead_code)]

use dataload_core::{Connection, ConnectionConfig, Value};
use dataload_driver_sqlite::SqliteConnection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fresh in-memory database with `schema` applied
pub async fn memory_database(schema: &[&str]) -> Arc<dyn Connection> {
    let conn: Arc<dyn Connection> =
        Arc::new(SqliteConnection::open_in_memory().expect("open in-memory database"));
    execute_all(&conn, schema).await;
    conn
}

/// File database under `dir`, so that several connections see the same data
pub async fn file_database(dir: &Path, schema: &[&str]) -> (Arc<dyn Connection>, ConnectionConfig) {
    let path = dir.join("import.db");
    let config = ConnectionConfig::new_sqlite(&path.to_string_lossy());
    let conn: Arc<dyn Connection> = Arc::new(
        SqliteConnection::open(&path.to_string_lossy()).expect("open file database"),
    );
    execute_all(&conn, schema).await;
    (conn, config)
}

pub async fn execute_all(conn: &Arc<dyn Connection>, statements: &[&str]) {
    for sql in statements {
        conn.execute(sql, &[]).await.expect(sql);
    }
}

pub async fn count(conn: &Arc<dyn Connection>, table: &str) -> i64 {
    let result = conn
        .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await
        .expect("count rows");
    match result.rows.first().and_then(|row| row.get(0)) {
        Some(Value::Int64(n)) => *n,
        other => panic!("unexpected count result: {:?}", other),
    }
}

/// Values of `column` ordered by `order_by`, rendered as text
pub async fn column_values(
    conn: &Arc<dyn Connection>,
    table: &str,
    column: &str,
    order_by: &str,
) -> Vec<String> {
    let result = conn
        .query(
            &format!("SELECT {} FROM {} ORDER BY {}", column, table, order_by),
            &[],
        )
        .await
        .expect("select column");
    result
        .rows
        .iter()
        .map(|row| row.get(0).map(|v| v.to_string()).unwrap_or_default())
        .collect()
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write source file");
    path
}
