//! Rejected-row sinks

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::messages::MessageBuffer;

/// Where rejected rows go; chosen once per run
#[derive(Debug)]
pub enum RejectSink {
    /// Into the message log as an error entry
    Inline,
    /// One raw record per line in an external file
    BadFile(BadFileWriter),
}

impl RejectSink {
    pub fn new(bad_file: Option<&Path>) -> Self {
        match bad_file {
            Some(path) => RejectSink::BadFile(BadFileWriter::new(path)),
            None => RejectSink::Inline,
        }
    }

    /// Record one rejected row
    pub fn reject(
        &mut self,
        messages: &mut MessageBuffer,
        raw_record: &str,
        row_number: u64,
        cause: &str,
    ) {
        match self {
            RejectSink::Inline => {
                messages.error(format!(
                    "Error importing row {}: {} (data: {})",
                    row_number, cause, raw_record
                ));
            }
            RejectSink::BadFile(writer) => {
                messages.error(format!("Error importing row {}: {}", row_number, cause));
                if let Err(e) = writer.write_record(raw_record) {
                    tracing::error!(
                        path = %writer.path().display(),
                        error = %e,
                        "could not write rejected row"
                    );
                    messages.warning(format!(
                        "Could not write row {} to {}: {}",
                        row_number,
                        writer.path().display(),
                        e
                    ));
                }
            }
        }
    }

    /// Flush the bad file and add the final count message
    pub fn finish(&mut self, messages: &mut MessageBuffer) {
        if let RejectSink::BadFile(writer) = self {
            if let Err(e) = writer.flush() {
                tracing::error!(error = %e, "could not flush bad file");
            }
            if writer.records() > 0 {
                messages.info(format!(
                    "{} rejected row(s) written to {}",
                    writer.records(),
                    writer.path().display()
                ));
            }
        }
    }

    pub fn rejected(&self) -> u64 {
        match self {
            RejectSink::Inline => 0,
            RejectSink::BadFile(writer) => writer.records(),
        }
    }
}

/// Appends rejected records to a file, created on the first record
#[derive(Debug)]
pub struct BadFileWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: u64,
}

impl BadFileWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: None,
            records: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write_record(&mut self, raw_record: &str) -> std::io::Result<()> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::options().create(true).append(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", escape_line_breaks(raw_record))?;
            self.records += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Keeps a record on one line: `\`, CR and LF become `\\`, `\r` and `\n`
fn escape_line_breaks(record: &str) -> std::borrow::Cow<'_, str> {
    if !record.contains(['\\', '\n', '\r']) {
        return std::borrow::Cow::Borrowed(record);
    }
    let mut escaped = String::with_capacity(record.len() + 8);
    for c in record.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    std::borrow::Cow::Owned(escaped)
}

/// Raw text of a row as written to the reject sink
pub fn raw_record(values: &[dataload_core::Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            dataload_core::Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataload_core::Value;

    #[test]
    fn inline_sink_writes_to_message_log() {
        let mut messages = MessageBuffer::new(10);
        let mut sink = RejectSink::new(None);
        sink.reject(&mut messages, "1\tfoo", 3, "constraint failed");
        assert_eq!(messages.error_count(), 1);
        assert!(messages.messages()[0].contains("row 3"));
        assert!(messages.messages()[0].contains("1\tfoo"));
    }

    #[test]
    fn bad_file_gets_one_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rejects").join("bad.txt");
        let mut messages = MessageBuffer::new(10);
        let mut sink = RejectSink::new(Some(&path));

        sink.reject(&mut messages, "a\tb", 1, "x");
        sink.reject(&mut messages, "c\td", 2, "y");
        sink.finish(&mut messages);

        let content = std::fs::read_to_string(&path).expect("bad file");
        assert_eq!(content, "a\tb\nc\td\n");
        assert_eq!(sink.rejected(), 2);
        assert!(messages.messages().last().is_some_and(|m| m.contains("2 rejected")));
    }

    #[test]
    fn bad_file_escapes_embedded_line_breaks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.txt");
        let mut messages = MessageBuffer::new(10);
        let mut sink = RejectSink::new(Some(&path));

        sink.reject(&mut messages, "1\tline one\nline two", 1, "x");
        sink.reject(&mut messages, "2\tcr\r\nand C:\\dir", 2, "y");
        sink.finish(&mut messages);

        let content = std::fs::read_to_string(&path).expect("bad file");
        assert_eq!(content.lines().count(), 2);
        assert_eq!(
            content,
            "1\tline one\\nline two\n2\tcr\\r\\nand C:\\\\dir\n"
        );
        assert_eq!(sink.rejected(), 2);
    }

    #[test]
    fn raw_record_renders_null_as_empty() {
        let values = vec![Value::Int64(1), Value::Null, Value::String("x".into())];
        assert_eq!(raw_record(&values), "1\t\tx");
    }
}
