//! Follow one run's event stream and print suite results as they arrive.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use suitestream_core::{
    ConfigError, FileRecordStorage, ProgressSnapshot, RunContext, RunRecordCache, StoreChange,
    StreamConfig, StreamConnection, StreamOutcome, init_observability,
};
use suitestream_sse::{SseClientConfig, SseTransport};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "suitestream-watch",
    about = "Follow a test-suite run and print results as they stream in",
    version
)]
struct Cli {
    /// Run id to follow.
    #[arg(long)]
    run_id: String,

    /// Server origin. Defaults to SUITESTREAM_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Stream endpoint path.
    #[arg(long)]
    stream_path: Option<String>,

    /// Persist per-suite run records as JSON files in this directory.
    #[arg(long)]
    persist_dir: Option<PathBuf>,

    /// Print store changes as JSON lines instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_observability();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("suitestream-watch: {err}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let mut sse = match cli.base_url {
        Some(base_url) => SseClientConfig::new(base_url),
        None => SseClientConfig::from_env()?,
    };
    if let Some(path) = cli.stream_path {
        sse = sse.stream_path(path);
    }
    let transport = SseTransport::new(sse)?;
    let connection =
        StreamConnection::new(Arc::new(transport)).with_config(StreamConfig::from_env()?)?;

    let mut context = RunContext::new(cli.run_id);
    if let Some(dir) = cli.persist_dir {
        let storage = Arc::new(FileRecordStorage::new(dir));
        context = context.with_records(Arc::new(RunRecordCache::new(storage, true)));
    }

    let json = cli.json;
    context.store().subscribe(move |change| {
        if json {
            match serde_json::to_string(change) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("suitestream-watch: cannot encode change: {err}"),
            }
        } else if let Some(line) = render_change(change) {
            println!("{line}");
        }
    });

    let handle = context.connect(&connection);
    info!(run_id = %context.run_id(), "watching run");
    let cancel = handle.cancel_handle();
    let join = handle.join();
    tokio::pin!(join);
    let outcome = tokio::select! {
        outcome = &mut join => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            cancel.cancel();
            join.await
        }
    };

    let progress = context.progress().snapshot();
    println!("{}", render_totals(&progress));
    Ok(match outcome {
        StreamOutcome::Done if progress.totals.failed == 0 => ExitCode::SUCCESS,
        StreamOutcome::Done => ExitCode::from(1),
        StreamOutcome::Cancelled => ExitCode::from(130),
    })
}

fn render_change(change: &StoreChange) -> Option<String> {
    Some(match change {
        StoreChange::Reset { path } => format!("[{path}] started"),
        StoreChange::Test { path, name, data } => {
            let mut line = format!("[{path}] {name} {} ({} ms)", data.status, data.duration_ms);
            if let Some(first) = data.messages.first() {
                line.push_str(&format!(": {first}"));
            }
            line
        }
        StoreChange::Summary { path, data } => format!(
            "[{path}] {} passed, {} failed, {} skipped of {} ({} ms)",
            data.passed, data.failed, data.skipped, data.total, data.duration_ms
        ),
        StoreChange::Badge { .. } => return None,
        StoreChange::Error { path: Some(path), message } => format!("[{path}] error: {message}"),
        StoreChange::Error { path: None, message } => format!("error: {message}"),
    })
}

fn render_totals(progress: &ProgressSnapshot) -> String {
    let totals = &progress.totals;
    format!(
        "suites {}/{}: {} passed, {} failed, {} skipped of {} tests ({} ms)",
        progress.batch.done,
        progress.batch.total,
        totals.passed,
        totals.failed,
        totals.skipped,
        totals.total,
        totals.duration_ms
    )
}
