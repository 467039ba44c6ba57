#[macro_use]
extern crate tracing;

mod cli;
mod console;

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use adaptive_import::{
    DocumentSource, ImportError, ImportSummary, Importer, JsonLinesSource, RunOutcome,
    SourceError,
};
use clap::Parser;
use cosmos_client::{CosmosClient, CosmosClientError};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{cli::Cli, console::ConsoleReporter};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("{source}"))]
    Input { source: SourceError },

    #[snafu(display("Invalid store configuration: {source}"))]
    Client { source: CosmosClientError },

    #[snafu(display("{source}"))]
    Import { source: ImportError },

    #[snafu(display("Log file path {} has no file name", path.display()))]
    LogFileName { path: PathBuf },

    #[snafu(display("Cannot open log file {}: {source}", path.display()))]
    LogFile { path: PathBuf, source: InitError },

    #[snafu(display("Cannot write summary to {}: {source}", path.display()))]
    SummaryFile { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot serialize the summary: {source}"))]
    SerializeSummary { source: serde_json::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let _guard = match init_tracing(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "Loaded environment file.");
    }

    let summary_file = cli.summary_file.clone();
    let result = run(cli).await.and_then(|summary| {
        if let Some(path) = &summary_file {
            write_summary(path, &summary)?;
        }
        Ok(summary)
    });
    match result {
        Ok(summary) if summary.outcome == RunOutcome::Completed && summary.dead_letters.is_empty() => {
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn write_summary(path: &Path, summary: &ImportSummary) -> Result<(), AppError> {
    let json = serde_json::to_vec_pretty(summary).context(SerializeSummarySnafu)?;
    std::fs::write(path, json).context(SummaryFileSnafu { path })
}

async fn run(cli: Cli) -> Result<ImportSummary, AppError> {
    // The input is checked before anything is sent to the store.
    let source = JsonLinesSource::open(&cli.file).context(InputSnafu)?;
    info!(file = %cli.file.display(), total = source.total(), "Loaded input.");

    let client = CosmosClient::new(cli.client_config()).context(ClientSnafu)?;
    let importer = Importer::new(client, source, cli.import_settings()).context(ImportSnafu)?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => warn!("Interrupted; stopping the import."),
            Err(error) => {
                warn!(%error, "Cannot listen for Ctrl-C; the import only stops when done.");
                std::future::pending::<()>().await;
            }
        }
    };

    importer
        .run_until(ConsoleReporter::new(io::stdout()), shutdown)
        .await
        .context(ImportSnafu)
}

/// Logs go to stderr, and to `log_file` when given, so stdout only carries progress.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .context(LogFileNameSnafu { path })?
                .to_string_lossy()
                .into_owned();
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name)
                .build(directory)
                .context(LogFileSnafu { path })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}
