//! Concurrent engine and queue behaviour against a file-backed SQLite database

mod common;

use common::{count, file_database, write_file};
use dataload_engine::parallel::StoppableQueue;
use dataload_engine::{ImportOptions, ParallelImporter, RowDataProducer, TextFileProducer};
use dataload_driver_sqlite::SqliteDriver;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

const PERSON: &str = "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT NOT NULL)";

fn person_rows(count: u32) -> String {
    let mut text = String::from("id,name\n");
    for id in 1..=count {
        let _ = writeln!(text, "{},name {}", id, id);
    }
    text
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_import_all_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (conn, config) = file_database(dir.path(), &[PERSON]).await;
    let file = write_file(dir.path(), "person.csv", &person_rows(200));

    // SQLite allows one writer at a time; autocommit keeps the workers from
    // holding the write lock across rows
    let options = ImportOptions::default()
        .with_workers(3, 16)
        .with_transaction_control(false);
    let mut importer =
        ParallelImporter::with_driver(conn.clone(), Arc::new(SqliteDriver::new()), config, options)
            .expect("importer");
    let summary = importer
        .start_import(&mut TextFileProducer::new(&file))
        .await
        .expect("import");

    assert!(summary.success, "messages: {:?}", summary.messages);
    assert_eq!(summary.total_inserted, 200);
    assert_eq!(summary.table("person").map(|t| t.rows_processed), Some(200));
    assert_eq!(count(&conn, "person").await, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_rejects_are_collected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (conn, config) = file_database(dir.path(), &[PERSON]).await;
    let mut rows = person_rows(30);
    rows.push_str("31,\n");
    let file = write_file(dir.path(), "person.csv", &rows);

    let options = ImportOptions::default()
        .with_workers(2, 8)
        .with_transaction_control(false)
        .with_continue_on_error(true);
    let mut importer =
        ParallelImporter::with_driver(conn.clone(), Arc::new(SqliteDriver::new()), config, options)
            .expect("importer");
    let summary = importer
        .start_import(&mut TextFileProducer::new(&file))
        .await
        .expect("import");

    assert_eq!(summary.total_inserted, 30);
    assert_eq!(summary.total_rejected, 1);
    assert!(
        summary
            .messages
            .iter()
            .any(|m| m.starts_with("Error importing row 31:")),
        "messages: {:?}",
        summary.messages
    );
    assert_eq!(count(&conn, "person").await, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_import_reports_cancellation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (conn, config) = file_database(dir.path(), &[PERSON]).await;
    let file = write_file(dir.path(), "person.csv", &person_rows(10));

    let options = ImportOptions::default()
        .with_workers(2, 4)
        .with_transaction_control(false);
    let mut importer =
        ParallelImporter::with_driver(conn.clone(), Arc::new(SqliteDriver::new()), config, options)
            .expect("importer");
    let mut producer = TextFileProducer::new(&file);
    producer.cancel();
    let err = importer
        .start_import(&mut producer)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, dataload_engine::ImportError::Cancelled));
    assert!(!importer.summary().success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_wakes_consumer_blocked_on_empty_queue() {
    let queue: Arc<StoppableQueue<u64>> = Arc::new(StoppableQueue::new(4));
    let consumer = Arc::clone(&queue);
    let pending = tokio::spawn(async move { consumer.take().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    queue.stop();
    let taken = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("take returned after stop")
        .expect("consumer task");
    assert_eq!(taken, None);
    assert!(!queue.put(1).await);
}
