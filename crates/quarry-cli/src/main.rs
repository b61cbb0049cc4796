use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use quarry_client::{GraphQlFetcher, GraphQlFetcherConfig};
use quarry_core::{Engine, EngineConfig, JobConfig, JobInput, RunTermination};

#[derive(Parser)]
#[command(name = "quarry", version, about = "Authenticated profile extractor")]
struct Cli {
    /// Path to the JSON job input (`usernames`, `sessionCookies`, `concurrency`)
    #[arg(short, long, env = "QUARRY_INPUT")]
    input: PathBuf,

    /// Session cookie, used when the input file does not carry one
    #[arg(long, env = "QUARRY_SESSION_COOKIES", hide_env_values = true)]
    session_cookies: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries one JSON outcome per line
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quarry=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut input = JobInput::from_path(&cli.input)
        .with_context(|| format!("Failed to read job input: {}", cli.input.display()))?;
    if input.session_cookies.trim().is_empty()
        && let Some(cookies) = cli.session_cookies
    {
        input.session_cookies = cookies;
    }
    let job = JobConfig::try_from(input).context("Invalid job input")?;

    let engine_config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let fetcher_config = GraphQlFetcherConfig::from_env().context("Invalid fetcher configuration")?;
    let fetcher = GraphQlFetcher::with_config(fetcher_config).context("Failed to create HTTP client")?;
    let engine = Engine::new(fetcher, engine_config).context("Failed to create engine")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    tracing::info!(
        identifiers = job.identifiers().len(),
        concurrency = job.concurrency(),
        "Starting"
    );

    let mut stream = engine.run(job, cancel);
    let mut stdout = std::io::stdout();
    while let Some(outcome) = stream.next().await {
        let line = serde_json::to_string(&outcome).context("Failed to serialize outcome")?;
        writeln!(stdout, "{line}").context("Failed to write outcome")?;
    }
    stdout.flush()?;

    let summary = stream.finish().await?;
    tracing::info!(
        run_id = %summary.run_id,
        total = summary.total,
        succeeded = summary.succeeded,
        partial = summary.partial,
        failed = summary.failed,
        peak_in_flight = summary.peak_in_flight,
        "Run finished: {}",
        summary.termination
    );

    match summary.termination {
        RunTermination::SessionExpired => {
            anyhow::bail!("Session cookie was rejected; refresh it and re-run")
        }
        RunTermination::Completed | RunTermination::Cancelled => Ok(()),
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupted; finishing in-flight identifiers");
        cancel.cancel();
    }
}
