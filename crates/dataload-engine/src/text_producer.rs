//! Delimited text files as a row producer
//!
//! Reads one file, or every file with a given extension in a directory.
//! The first line of a file holds the column names; the table name is the
//! file stem unless one is given explicitly.

use async_trait::async_trait;
use dataload_core::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::ImportError;
use crate::protocol::{
    ColumnIdentifier, ImportSignal, ProducerOutcome, RowDataProducer, RowDataReceiver,
    TableIdentifier,
};

/// Layout of the text files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFormat {
    pub delimiter: char,
    /// `None` disables quoting
    pub quote: Option<char>,
    pub empty_is_null: bool,
    pub trim_values: bool,
    /// File extension picked up in directory mode
    pub extension: String,
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: Some('"'),
            empty_is_null: true,
            trim_values: true,
            extension: "csv".to_string(),
        }
    }
}

pub struct TextFileProducer {
    source: PathBuf,
    table: Option<TableIdentifier>,
    format: TextFormat,
    signal: ImportSignal,
}

enum FileOutcome {
    Completed,
    Stopped,
}

impl TextFileProducer {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            table: None,
            format: TextFormat::default(),
            signal: ImportSignal::new(),
        }
    }

    /// Target table of a single-file import; ignored in directory mode
    pub fn with_table(mut self, table: TableIdentifier) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_format(mut self, format: TextFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.format.delimiter = delimiter;
        self
    }

    pub fn with_quote(mut self, quote: Option<char>) -> Self {
        self.format.quote = quote;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.format.extension = extension.into();
        self
    }

    /// Share the cancellation state of an outer run
    pub fn with_signal(mut self, signal: ImportSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Files to read, with their target tables
    fn sources(&self) -> Result<Vec<(PathBuf, TableIdentifier)>, ImportError> {
        if !self.source.is_dir() {
            let table = match &self.table {
                Some(table) => table.clone(),
                None => table_for(&self.source),
            };
            return Ok(vec![(self.source.clone(), table)]);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.source)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case(&self.format.extension))
            })
            .collect();
        files.sort();
        tracing::debug!(
            directory = %self.source.display(),
            files = files.len(),
            "text files found"
        );
        Ok(files
            .into_iter()
            .map(|path| {
                let table = table_for(&path);
                (path, table)
            })
            .collect())
    }

    async fn import_file(
        &self,
        receiver: &mut dyn RowDataReceiver,
        path: &Path,
        table: TableIdentifier,
    ) -> Result<FileOutcome, ImportError> {
        let source_name = path.display().to_string();
        let mut records = RecordReader::new(BufReader::new(File::open(path)?), &self.format);

        let Some((_, header)) = records.next_record(&source_name)? else {
            return Err(ImportError::Parse {
                source_name,
                line: 1,
                message: "missing header line".into(),
            });
        };
        let columns: Vec<ColumnIdentifier> = split_record(&header, &self.format)
            .into_iter()
            .map(ColumnIdentifier::new)
            .collect();

        tracing::debug!(file = %source_name, table = %table, columns = columns.len(), "reading text file");
        if let Err(e) = receiver
            .set_target_table(table, columns.clone(), Some(path.to_path_buf()))
            .await
        {
            receiver.table_import_error().await;
            return Err(e);
        }

        let mut row_number = 0u64;
        loop {
            let record = match records.next_record(&source_name) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    receiver.table_import_error().await;
                    return Err(e);
                }
            };
            let (_, raw) = record;
            if raw.trim().is_empty() {
                continue;
            }
            row_number += 1;

            if self.signal.is_cancelled() {
                receiver.table_import_error().await;
                return Err(ImportError::Cancelled);
            }
            if !receiver.should_process_next_row() {
                receiver.next_row_skipped();
                if self.signal.is_stopped() {
                    receiver.table_import_finished().await?;
                    return Ok(FileOutcome::Stopped);
                }
                continue;
            }

            let fields = split_record(&raw, &self.format);
            if fields.len() != columns.len() {
                receiver.record_rejected(
                    &raw,
                    row_number,
                    &format!("Expected {} values but found {}", columns.len(), fields.len()),
                );
                receiver.next_row_skipped();
                continue;
            }

            let values = fields
                .into_iter()
                .map(|field| {
                    if field.is_empty() && self.format.empty_is_null {
                        Value::Null
                    } else {
                        Value::String(field)
                    }
                })
                .collect();
            if let Err(e) = receiver.process_row(values).await {
                receiver.table_import_error().await;
                return Err(e);
            }
        }

        receiver.table_import_finished().await?;
        Ok(FileOutcome::Completed)
    }
}

#[async_trait]
impl RowDataProducer for TextFileProducer {
    #[tracing::instrument(skip(self, receiver), fields(source = %self.source.display()))]
    async fn start(
        &mut self,
        receiver: &mut dyn RowDataReceiver,
    ) -> Result<ProducerOutcome, ImportError> {
        let mut sources = self.sources()?;
        let multi_table = sources.len() > 1;

        if multi_table && receiver.check_dependencies() {
            let tables: Vec<TableIdentifier> = sources.iter().map(|(_, t)| t.clone()).collect();
            let ordered = receiver.dependency_order(&tables).await?;
            sources = ordered
                .iter()
                .filter_map(|table| sources.iter().find(|(_, t)| t.same_name(table)).cloned())
                .collect();
        }

        if multi_table {
            let tables: Vec<TableIdentifier> = sources.iter().map(|(_, t)| t.clone()).collect();
            receiver.begin_multi_table(&tables).await?;
        }

        for (path, table) in sources {
            match self.import_file(receiver, &path, table).await {
                Ok(FileOutcome::Completed) => {}
                Ok(FileOutcome::Stopped) => {
                    if multi_table {
                        receiver.end_multi_table().await?;
                    }
                    receiver.import_finished().await?;
                    return Ok(ProducerOutcome::Stopped);
                }
                Err(ImportError::Cancelled) => {
                    receiver.import_cancelled().await;
                    return Err(ImportError::Cancelled);
                }
                Err(e) => return Err(e),
            }
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

fn table_for(path: &Path) -> TableIdentifier {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    TableIdentifier::new(stem)
}

/// Reads logical records; a quoted value may span several physical lines
struct RecordReader<'a, R> {
    reader: R,
    format: &'a TextFormat,
    line: u64,
}

impl<'a, R: BufRead> RecordReader<'a, R> {
    fn new(reader: R, format: &'a TextFormat) -> Self {
        Self {
            reader,
            format,
            line: 0,
        }
    }

    /// The next record and the line it starts on
    fn next_record(&mut self, source_name: &str) -> Result<Option<(u64, String)>, ImportError> {
        let mut record = String::new();
        let mut start = None;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return match start {
                    None => Ok(None),
                    Some(start) => Err(ImportError::Parse {
                        source_name: source_name.to_string(),
                        line: start,
                        message: "unterminated quoted value".into(),
                    }),
                };
            }
            self.line += 1;
            start.get_or_insert(self.line);

            let line = line.trim_end_matches(['\n', '\r']);
            if !record.is_empty() {
                record.push('\n');
            }
            record.push_str(line);

            if !has_open_quote(&record, self.format.quote) {
                return Ok(start.map(|start| (start, record)));
            }
        }
    }
}

fn has_open_quote(record: &str, quote: Option<char>) -> bool {
    let Some(quote) = quote else {
        return false;
    };
    // a doubled quote toggles twice, so counting is enough
    record.chars().filter(|c| *c == quote).count() % 2 == 1
}

/// Split one record into fields
pub fn split_record(record: &str, format: &TextFormat) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = record.chars().peekable();

    let finish = |field: &mut String| {
        let field = std::mem::take(field);
        if format.trim_values {
            field.trim().to_string()
        } else {
            field
        }
    };

    while let Some(c) = chars.next() {
        if in_quotes {
            if Some(c) == format.quote {
                if chars.peek() == format.quote.as_ref() {
                    chars.next();
                    current.push(c);
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if Some(c) == format.quote {
            in_quotes = true;
        } else if c == format.delimiter {
            result.push(finish(&mut current));
        } else {
            current.push(c);
        }
    }

    result.push(finish(&mut current));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn csv() -> TextFormat {
        TextFormat::default()
    }

    #[test]
    fn test_split_simple_record() {
        assert_eq!(split_record("hello,world,test", &csv()), vec!["hello", "world", "test"]);
    }

    #[test]
    fn test_split_quoted_record() {
        let line = r#""hello, world","test",value"#;
        assert_eq!(split_record(line, &csv()), vec!["hello, world", "test", "value"]);
    }

    #[test]
    fn test_split_escaped_quotes() {
        let line = r#""hello ""world""","test""#;
        assert_eq!(split_record(line, &csv()), vec![r#"hello "world""#, "test"]);
    }

    #[test]
    fn test_split_without_quoting() {
        let format = TextFormat {
            delimiter: '\t',
            quote: None,
            ..csv()
        };
        assert_eq!(split_record("a\t\"b\"", &format), vec!["a", "\"b\""]);
    }

    #[test]
    fn quoted_values_span_lines() {
        let format = csv();
        let text = "id,note\n1,\"first\nsecond\"\n2,plain\n";
        let mut reader = RecordReader::new(Cursor::new(text), &format);

        assert_eq!(
            reader.next_record("t").expect("header"),
            Some((1, "id,note".to_string()))
        );
        let (line, record) = reader.next_record("t").expect("record").expect("some");
        assert_eq!(line, 2);
        assert_eq!(split_record(&record, &format), vec!["1", "first\nsecond"]);
        assert_eq!(
            reader.next_record("t").expect("record"),
            Some((4, "2,plain".to_string()))
        );
        assert_eq!(reader.next_record("t").expect("eof"), None);
    }

    #[test]
    fn unterminated_quote_is_a_parse_error() {
        let format = csv();
        let mut reader = RecordReader::new(Cursor::new("a,\"b\n"), &format);
        let err = reader.next_record("data.csv").expect_err("parse error");
        assert!(matches!(err, ImportError::Parse { line: 1, .. }));
    }

    /// Records the callback order
    #[derive(Default)]
    struct RecordingReceiver {
        events: Vec<String>,
        order: Option<Vec<&'static str>>,
        skip_first: bool,
        /// Stops the run at the first row
        stop: Option<ImportSignal>,
        seen_rows: u64,
    }

    #[async_trait]
    impl RowDataReceiver for RecordingReceiver {
        async fn begin_multi_table(&mut self, tables: &[TableIdentifier]) -> Result<(), ImportError> {
            let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
            self.events.push(format!("begin {}", names.join(",")));
            Ok(())
        }

        async fn set_target_table(
            &mut self,
            table: TableIdentifier,
            columns: Vec<ColumnIdentifier>,
            _source_file: Option<PathBuf>,
        ) -> Result<(), ImportError> {
            let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            self.events.push(format!("table {} ({})", table, names.join(",")));
            self.seen_rows = 0;
            Ok(())
        }

        async fn process_row(&mut self, values: Vec<Value>) -> Result<(), ImportError> {
            let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            self.events.push(format!("row {}", values.join("|")));
            Ok(())
        }

        async fn table_import_finished(&mut self) -> Result<(), ImportError> {
            self.events.push("finished".into());
            Ok(())
        }

        async fn table_import_error(&mut self) {
            self.events.push("error".into());
        }

        async fn end_multi_table(&mut self) -> Result<(), ImportError> {
            self.events.push("end".into());
            Ok(())
        }

        async fn import_finished(&mut self) -> Result<(), ImportError> {
            self.events.push("done".into());
            Ok(())
        }

        async fn import_cancelled(&mut self) {
            self.events.push("cancelled".into());
        }

        fn should_process_next_row(&self) -> bool {
            if let Some(signal) = &self.stop {
                signal.stop();
                return false;
            }
            !(self.skip_first && self.seen_rows == 0)
        }

        fn next_row_skipped(&mut self) {
            self.seen_rows += 1;
            self.events.push("skipped".into());
        }

        fn record_rejected(&mut self, _raw_record: &str, row_number: u64, _cause: &str) {
            self.events.push(format!("rejected {}", row_number));
        }

        fn check_dependencies(&self) -> bool {
            self.order.is_some()
        }

        async fn dependency_order(
            &mut self,
            tables: &[TableIdentifier],
        ) -> Result<Vec<TableIdentifier>, ImportError> {
            let order = self.order.clone().unwrap_or_default();
            Ok(order
                .into_iter()
                .filter_map(|name| tables.iter().find(|t| t.name == name).cloned())
                .collect())
        }
    }

    #[tokio::test]
    async fn single_file_feeds_rows_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("person.csv");
        std::fs::write(&path, "id,name\n1,alice\n\n2,\n3,too,many\n").expect("write");

        let mut receiver = RecordingReceiver::default();
        let mut producer = TextFileProducer::new(&path);
        let outcome = producer.start(&mut receiver).await.expect("read");

        assert_eq!(outcome, ProducerOutcome::Completed);
        assert_eq!(
            receiver.events,
            vec![
                "table person (id,name)",
                "row 1|alice",
                "row 2|NULL",
                "rejected 3",
                "skipped",
                "finished",
                "done",
            ]
        );
    }

    #[tokio::test]
    async fn skipped_rows_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "a\n1\n2\n").expect("write");

        let mut receiver = RecordingReceiver {
            skip_first: true,
            ..Default::default()
        };
        TextFileProducer::new(&path)
            .with_table(TableIdentifier::new("target"))
            .start(&mut receiver)
            .await
            .expect("read");
        assert_eq!(
            receiver.events,
            vec!["table target (a)", "skipped", "row 2", "finished", "done"]
        );
    }

    #[tokio::test]
    async fn directory_follows_dependency_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.csv"), "id\n1\n").expect("write");
        std::fs::write(dir.path().join("b.csv"), "id\n2\n").expect("write");
        std::fs::write(dir.path().join("c.csv"), "id\n3\n").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let mut receiver = RecordingReceiver {
            order: Some(vec!["c", "a", "b"]),
            ..Default::default()
        };
        TextFileProducer::new(dir.path())
            .start(&mut receiver)
            .await
            .expect("read");

        let tables: Vec<&String> = receiver
            .events
            .iter()
            .filter(|e| e.starts_with("table") || e.starts_with("begin"))
            .collect();
        assert_eq!(
            tables,
            vec!["begin c,a,b", "table c (id)", "table a (id)", "table b (id)"]
        );
        assert_eq!(receiver.events.last().map(String::as_str), Some("done"));
        assert!(receiver.events.contains(&"end".to_string()));
    }

    #[tokio::test]
    async fn cancelled_signal_ends_with_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "a\n1\n").expect("write");

        let mut receiver = RecordingReceiver::default();
        let mut producer = TextFileProducer::new(&path);
        producer.cancel();
        let err = producer.start(&mut receiver).await.expect_err("cancelled");
        assert!(matches!(err, ImportError::Cancelled));
        assert_eq!(
            receiver.events,
            vec!["table t (a)", "error", "cancelled"]
        );
    }

    #[tokio::test]
    async fn stopped_directory_still_ends_multi_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.csv"), "id\n1\n").expect("write");
        std::fs::write(dir.path().join("b.csv"), "id\n2\n").expect("write");

        let mut producer = TextFileProducer::new(dir.path());
        let mut receiver = RecordingReceiver {
            stop: Some(producer.signal().clone()),
            ..Default::default()
        };
        let outcome = producer.start(&mut receiver).await.expect("read");

        assert_eq!(outcome, ProducerOutcome::Stopped);
        assert_eq!(
            receiver.events,
            vec!["begin a,b", "table a (id)", "skipped", "finished", "end", "done"]
        );
    }
}
