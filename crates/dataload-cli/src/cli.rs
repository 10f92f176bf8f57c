//! `dataload` - load delimited text files into a database

mod logging;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use dataload_core::{Connection, ConnectionConfig};
use dataload_drivers::DriverRegistry;
use dataload_engine::{
    DataImporter, ImportMode, ImportOptions, ImportSummary, ParallelImporter, RowDataProducer,
    TableIdentifier, TextFileProducer,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "dataload", version, about = "Bulk import of delimited text files")]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write JSON logs to the log directory
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a file, or every matching file of a directory
    Import(ImportArgs),
    /// List the available database drivers
    Drivers,
}

#[derive(clap::Args, Debug)]
struct ImportArgs {
    /// Database driver id
    #[arg(long, default_value = "sqlite", env = "DATALOAD_DRIVER")]
    driver: String,

    /// Database name or file path
    #[arg(long, env = "DATALOAD_DATABASE")]
    database: String,

    /// Source file or directory
    #[arg(long)]
    file: PathBuf,

    /// Target table (single-file imports); defaults to the file name
    #[arg(long)]
    table: Option<String>,

    /// insert, update, insertupdate, updateinsert, upsert or insertignore
    #[arg(long)]
    mode: Option<String>,

    /// TOML file with import options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long)]
    threads: Option<usize>,

    /// Field delimiter
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Extension of the files picked up from a directory
    #[arg(long, default_value = "csv")]
    extension: String,

    /// Key columns for update modes, comma separated
    #[arg(long, value_delimiter = ',')]
    keys: Vec<String>,

    /// Keep going after row errors
    #[arg(long)]
    continue_on_error: bool,
}

impl ImportArgs {
    fn options(&self) -> anyhow::Result<ImportOptions> {
        let mut options = match &self.config {
            Some(path) => ImportOptions::from_toml_file(path)
                .with_context(|| format!("failed to read options from {}", path.display()))?,
            None => ImportOptions::default(),
        };
        if let Some(mode) = &self.mode {
            options.mode = mode.parse::<ImportMode>()?;
        }
        if let Some(threads) = self.threads {
            options.worker_count = threads;
        }
        if !self.keys.is_empty() {
            options.key_columns = self.keys.clone();
        }
        if self.continue_on_error {
            options.continue_on_error = true;
        }
        options.validate()?;
        Ok(options)
    }

    fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(&self.driver);
        config.database = Some(self.database.clone());
        config
    }

    fn producer(&self) -> TextFileProducer {
        let mut producer = TextFileProducer::new(&self.file)
            .with_delimiter(self.delimiter)
            .with_extension(&self.extension);
        if let Some(table) = &self.table {
            producer = producer.with_table(TableIdentifier::parse(table));
        }
        producer
    }
}

async fn run_import(args: ImportArgs) -> anyhow::Result<ImportSummary> {
    let options = args.options()?;
    let registry = DriverRegistry::with_defaults();
    let Some(driver) = registry.get(&args.driver) else {
        bail!(
            "unknown driver '{}' (available: {})",
            args.driver,
            registry.list().join(", ")
        );
    };
    let config = args.connection_config();
    let connection: Arc<dyn Connection> = driver
        .connect(&config)
        .await
        .with_context(|| format!("failed to connect to {}", args.database))?;

    let mut producer = args.producer();
    let signal = producer.signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling import");
            signal.cancel();
        }
    });

    tracing::info!(
        file = %args.file.display(),
        driver = %args.driver,
        mode = %options.mode,
        workers = options.worker_count,
        "starting import"
    );
    let result = if options.worker_count > 1 {
        let mut importer = ParallelImporter::with_driver(connection.clone(), driver, config, options)?;
        importer.start_import(&mut producer).await
    } else {
        let mut importer = DataImporter::new(connection.clone(), options)?;
        importer.start_import(&mut producer).await
    };
    if let Err(e) = connection.close().await {
        tracing::warn!(error = %e, "failed to close connection");
    }
    Ok(result?)
}

fn print_summary(summary: &ImportSummary) {
    for message in &summary.messages {
        println!("{}", message);
    }

    let mut table = Table::new();
    table.set_header(vec!["Table", "Processed", "Inserted", "Updated", "Rejected", "Status"]);
    for t in &summary.tables {
        let status = if t.failed { "failed" } else { "ok" };
        table.add_row(vec![
            t.table.clone(),
            t.rows_processed.to_string(),
            t.rows_inserted.to_string(),
            t.rows_updated.to_string(),
            t.rows_rejected.to_string(),
            status.to_string(),
        ]);
    }
    println!("{table}");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = logging::LoggingConfig::default().with_verbosity(cli.verbose);
    config.enable_json_logs = cli.log_json;
    let _guard = match logging::init(config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Drivers => {
            let registry = DriverRegistry::with_defaults();
            let mut names = registry.list();
            names.sort_unstable();
            for name in names {
                println!("{}", name);
            }
            ExitCode::SUCCESS
        }
        Command::Import(args) => match run_import(args).await {
            Ok(summary) => {
                print_summary(&summary);
                if summary.success {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(2)
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "import failed");
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import_args(extra: &[&str]) -> ImportArgs {
        let mut argv = vec!["dataload", "import", "--database", "data.db", "--file", "people.csv"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("valid arguments").command {
            Command::Import(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_import_arguments() {
        let args = import_args(&["--mode", "upsert", "--threads", "4", "--keys", "id,tenant"]);
        assert_eq!(args.driver, "sqlite");
        let options = args.options().expect("options");
        assert_eq!(options.mode, ImportMode::Upsert);
        assert_eq!(options.worker_count, 4);
        assert_eq!(options.key_columns, vec!["id".to_string(), "tenant".to_string()]);
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        assert!(import_args(&["--mode", "merge"]).options().is_err());
    }

    #[test]
    fn test_options_file_is_overridden_by_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "mode = \"update\"\ncommit_every = 50\n").expect("write settings");

        let args = import_args(&["--config", path.to_str().expect("utf-8 path"), "--mode", "insert"]);
        let options = args.options().expect("options");
        assert_eq!(options.mode, ImportMode::Insert);
        assert_eq!(options.commit_every, 50);
    }

    #[tokio::test]
    async fn test_run_import_into_sqlite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("data.db");
        let csv = dir.path().join("person.csv");
        std::fs::write(&csv, "id,name\n1,Alice\n2,Bob\n").expect("write csv");

        let registry = DriverRegistry::with_defaults();
        let setup = registry
            .connect(&ConnectionConfig::new_sqlite(&db.to_string_lossy()))
            .await
            .expect("connect");
        setup
            .execute("CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .expect("create table");

        let db_arg = db.to_string_lossy().to_string();
        let csv_arg = csv.to_string_lossy().to_string();
        let args = Cli::try_parse_from([
            "dataload",
            "import",
            "--database",
            db_arg.as_str(),
            "--file",
            csv_arg.as_str(),
        ])
        .expect("arguments");
        let Command::Import(args) = args.command else {
            panic!("expected import");
        };
        let summary = run_import(args).await.expect("import");
        assert!(summary.success, "messages: {:?}", summary.messages);
        assert_eq!(summary.total_inserted, 2);
    }
}
