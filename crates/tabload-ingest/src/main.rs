//! Tabload - load delimited files into MongoDB

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tabload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tabload_ingest::config::PipelineConfig;
use tabload_ingest::normalize::Normalizer;
use tabload_ingest::progress::ProgressReporter;
use tabload_ingest::report::{Observers, RunObserver, TracingReporter};
use tabload_ingest::sink::{
    self, DocumentSink, MemoryConnector, MemorySink, MongoConnector, SinkConnector,
};
use tabload_ingest::source::CsvReader;
use tabload_ingest::Orchestrator;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tabload")]
#[command(author, version, about = "Batched, concurrent CSV to MongoDB loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every configured source into the target collection
    Run(RunArgs),

    /// Connect to the configured sink and ping it
    Check {
        /// INI configuration file (defaults to ./config.ini when present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Read and normalize one file, printing records as JSON lines
    Preview {
        /// File to preview
        file: PathBuf,

        /// Number of records to print
        #[arg(short = 'n', long, default_value_t = 10)]
        rows: usize,

        /// INI configuration file supplying reader options
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// INI configuration file (defaults to ./config.ini when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source file; repeat to load several (replaces configured sources)
    #[arg(long = "csv-file", value_name = "PATH")]
    csv_files: Vec<PathBuf>,

    /// Records per insert call
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum number of files loaded at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Target collection
    #[arg(long)]
    collection: Option<String>,

    /// Run the whole pipeline against a discarding in-memory sink
    #[arg(long)]
    dry_run: bool,

    /// Show a progress bar per file
    #[arg(long)]
    progress: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if !self.csv_files.is_empty() {
            config.sources = self.csv_files.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        if let Some(collection) = &self.collection {
            config.sink.collection_name = collection.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // .env is optional
    let _ = dotenvy::dotenv();

    let log_config = log_config(&cli);
    let _log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

fn log_config(cli: &Cli) -> LogConfig {
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let output = match &cli.command {
        // Bars own the terminal, logs go to the file
        Command::Run(args) if args.progress => LogOutput::File,
        Command::Run(_) => LogOutput::Both,
        _ => LogOutput::Console,
    };

    let level = match &cli.command {
        // Keep stdout clean for the JSON lines
        Command::Preview { .. } if !cli.verbose => LogLevel::Warn,
        _ => level,
    };

    let defaults = LogConfig::builder()
        .level(level)
        .output(output)
        .log_file_prefix("tabload")
        .build();

    // Environment variables take precedence
    defaults.clone().merge_env().unwrap_or(defaults)
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { config } => check(config.as_deref()).await,
        Command::Preview { file, rows, config } => preview(&file, rows, config.as_deref()),
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let connector: Arc<dyn SinkConnector> = if args.dry_run {
        info!("Dry run: records are discarded after normalization");
        Arc::new(MemoryConnector::new(Arc::new(MemorySink::discarding())))
    } else {
        Arc::new(MongoConnector::new(
            config.sink.mongo_uri.clone(),
            config.sink.connect_timeout,
            config.sink.db_name.clone(),
            config.sink.collection_name.clone(),
        ))
    };

    let observer: Arc<dyn RunObserver> = if args.progress {
        Arc::new(
            Observers::new()
                .with(Arc::new(TracingReporter))
                .with(Arc::new(ProgressReporter::new())),
        )
    } else {
        Arc::new(TracingReporter)
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping jobs before their next batch");
            interrupt.cancel();
        }
    });

    let summary = Orchestrator::new(config, connector, observer)
        .with_cancellation(cancel)
        .run()
        .await?;

    for job in summary.jobs.iter().filter(|job| !job.succeeded()) {
        if let Some(err) = job.status.error() {
            eprintln!(
                "{}: failed during {} after inserting {} records: {}",
                job.source.display(),
                err.stage().map(|s| s.as_str()).unwrap_or("unknown stage"),
                job.inserted,
                err
            );
        }
    }

    info!(
        run_id = %summary.run_id,
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        total_inserted = summary.total_inserted,
        "Run finished"
    );

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn check(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = PipelineConfig::load(config_path)?;
    config.sink.validate()?;

    let connection = sink::connect(&config.sink.mongo_uri, config.sink.connect_timeout).await?;
    let collection = connection.collection(&config.sink.db_name, &config.sink.collection_name);

    println!("OK: {} is reachable, target {}", connection.target(), collection.namespace());
    Ok(ExitCode::SUCCESS)
}

fn preview(file: &Path, rows: usize, config_path: Option<&Path>) -> Result<ExitCode> {
    let config = PipelineConfig::load(config_path)?;

    let records = CsvReader::new(config.reader_options())
        .read(file)
        .with_context(|| format!("Failed to preview {}", file.display()))?;
    let total = records.len();

    let mut normalizer = Normalizer::new(config.duplicate_columns);
    for record in records.into_iter().take(rows) {
        println!("{}", normalizer.normalize_record(record).to_json()?);
    }

    info!(file = %file.display(), total, shown = total.min(rows), "Preview complete");
    Ok(ExitCode::SUCCESS)
}
