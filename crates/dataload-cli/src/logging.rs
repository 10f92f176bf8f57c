//! Logging setup for the `dataload` binary
//!
//! Console output goes to stderr so that it never mixes with the import
//! report on stdout. JSON logs are written to a daily rolling file when
//! enabled. `RUST_LOG` overrides the configured filter.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory where log files are written
    pub log_dir: PathBuf,

    /// Write JSON logs to a rolling file
    pub enable_json_logs: bool,

    pub enable_console_logs: bool,

    /// Include file/line information in log lines
    pub include_location: bool,

    /// Log span open/close events (per-table and per-worker timings)
    pub enable_spans: bool,

    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: log_directory(),
            enable_json_logs: false,
            enable_console_logs: true,
            include_location: cfg!(debug_assertions),
            enable_spans: false,
            default_filter: "info,dataload_engine=info,dataload_core=info,dataload_drivers=info"
                .to_string(),
        }
    }
}

impl LoggingConfig {
    /// Quiet console, JSON file logs for later inspection
    pub fn production() -> Self {
        Self {
            log_dir: log_directory(),
            enable_json_logs: true,
            enable_console_logs: false,
            include_location: false,
            enable_spans: false,
            default_filter: "warn,dataload_engine=info,dataload_driver_sqlite=warn".to_string(),
        }
    }

    /// Verbose console only, no files
    pub fn testing() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("dataload-tests"),
            enable_json_logs: false,
            enable_console_logs: true,
            include_location: true,
            enable_spans: true,
            default_filter: "debug".to_string(),
        }
    }

    /// Raise the console level by `verbosity` steps (`-v`, `-vv`)
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        match verbosity {
            0 => {}
            1 => self.default_filter = "debug".to_string(),
            _ => {
                self.default_filter = "trace".to_string();
                self.enable_spans = true;
            }
        }
        self
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the JSON file writer when dropped and must be
/// kept alive for the duration of the program.
pub fn init(config: LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    // NEW fires once per span; ENTER would repeat on every poll of an awaited future
    let span_events = if config.enable_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers = Vec::new();
    let mut guard = None;

    if config.enable_console_logs {
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events.clone())
            .with_filter(env_filter.clone())
            .boxed();
        layers.push(console_layer);
    }

    if config.enable_json_logs {
        std::fs::create_dir_all(&config.log_dir)?;
        let file_appender = tracing_appender::rolling::daily(&config.log_dir, "dataload.log");
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let json_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(span_events)
            .with_ansi(false)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(non_blocking)
            .with_filter(env_filter)
            .boxed();
        layers.push(json_layer);
    }

    tracing_subscriber::registry().with(layers).try_init()?;

    tracing::debug!(
        log_dir = %config.log_dir.display(),
        json_enabled = config.enable_json_logs,
        console_enabled = config.enable_console_logs,
        "logging initialized"
    );
    Ok(guard)
}

/// Default location of the JSON log files
pub fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dataload")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert!(config.enable_console_logs);
        assert!(!config.enable_json_logs);
        assert!(config.log_dir.ends_with("dataload/logs"));
    }

    #[test]
    fn test_production_config() {
        let config = LoggingConfig::production();
        assert!(!config.enable_console_logs);
        assert!(config.enable_json_logs);
        assert!(!config.include_location);
    }

    #[test]
    fn test_verbosity_raises_filter() {
        assert_eq!(LoggingConfig::testing().with_verbosity(0).default_filter, "debug");
        let trace = LoggingConfig::default().with_verbosity(2);
        assert_eq!(trace.default_filter, "trace");
        assert!(trace.enable_spans);
    }
}
