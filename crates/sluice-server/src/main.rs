//! `sluice`: ETL service and maintenance CLI.
//!
//! Reads `sluice.toml` (or the path given with `--config`) layered under
//! `SLUICE_*` environment variables, opens the SQLite store, and then:
//!
//! ```text
//! sluice serve            # HTTP API + scheduled runs
//! sluice run              # one run, exit 1 if it failed
//! sluice stats            # run statistics and record counts
//! sluice reset --yes      # drop and recreate every table
//! ```

use std::{
  io::{self, BufRead as _, Write as _},
  path::PathBuf,
  process::ExitCode,
  sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::json;
use sluice_api::{AppState, run_channel};
use sluice_core::{run::RunStatus, store::EtlStore};
use sluice_server::{Scheduler, Settings};
use sluice_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Sluice ETL service")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "sluice.toml", env = "SLUICE_CONFIG")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the HTTP API and run the pipeline on a schedule (default).
  Serve,
  /// Run the pipeline once and print the summary.
  Run,
  /// Print run statistics, record counts and checkpoints.
  Stats,
  /// Drop and recreate every table.
  Reset {
    /// Skip the interactive confirmation.
    #[arg(long)]
    yes: bool,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = Settings::load(&cli.config)
    .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;

  let store = SqliteStore::open(&settings.database_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.database_path))?;
  let store = Arc::new(store);

  match cli.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(settings, store).await,
    Command::Run => run_once(&settings, store).await,
    Command::Stats => stats(store.as_ref()).await,
    Command::Reset { yes } => reset(store.as_ref(), yes).await,
  }
}

// ─── serve ────────────────────────────────────────────────────────────────────

async fn serve(settings: Settings, store: Arc<SqliteStore>) -> anyhow::Result<ExitCode> {
  let pipeline = settings
    .pipeline(store.clone())
    .context("failed to build pipeline")?;
  let cancel = CancellationToken::new();
  let (trigger, requests) = run_channel();

  let scheduler = Scheduler::new(Arc::new(pipeline), requests, cancel.clone())
    .with_interval(settings.etl_interval())
    .run_on_startup(settings.run_on_startup);
  let scheduler = tokio::spawn(scheduler.run());

  let app = sluice_api::api_router(AppState::new(store, trigger));
  let address = settings.address();

  info!(
    %address,
    interval_secs = settings.etl_interval_secs,
    mode = %settings.ingest_mode,
    "listening on http://{address}"
  );
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await
    .context("server error")?;

  // The server may also stop on its own; make sure the scheduler follows.
  cancel.cancel();
  let runs = scheduler.await.context("scheduler task panicked")?;
  info!(runs, "shut down");
  Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal(cancel: CancellationToken) {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "could not listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  info!("shutdown requested; in-flight run stops at the next source boundary");
  cancel.cancel();
}

// ─── run ──────────────────────────────────────────────────────────────────────

async fn run_once(settings: &Settings, store: Arc<SqliteStore>) -> anyhow::Result<ExitCode> {
  let pipeline = settings.pipeline(store).context("failed to build pipeline")?;
  let cancel = CancellationToken::new();
  let on_ctrl_c = tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        cancel.cancel();
      }
    }
  });

  let summary = pipeline.run(&cancel).await.context("pipeline run failed")?;
  on_ctrl_c.abort();

  println!("{}", serde_json::to_string_pretty(&summary)?);
  Ok(if summary.status() == RunStatus::Failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

// ─── stats ────────────────────────────────────────────────────────────────────

async fn stats(store: &SqliteStore) -> anyhow::Result<ExitCode> {
  let runs = store.run_stats().await.context("failed to read run stats")?;
  let by_source = store.source_counts().await.context("failed to count records")?;
  let checkpoints = store
    .list_checkpoints()
    .await
    .context("failed to read checkpoints")?;

  let report = json!({
    "runs": runs,
    "records_by_source": by_source,
    "checkpoints": checkpoints,
  });
  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(ExitCode::SUCCESS)
}

// ─── reset ────────────────────────────────────────────────────────────────────

async fn reset(store: &SqliteStore, yes: bool) -> anyhow::Result<ExitCode> {
  if !yes && !confirm("This drops every table and all ingested data. Type 'yes' to continue: ")? {
    println!("aborted");
    return Ok(ExitCode::FAILURE);
  }
  store.reset().await.context("failed to reset database")?;
  warn!("database reset");
  println!("database reset");
  Ok(ExitCode::SUCCESS)
}

/// Read one line from stdin and accept only `yes`.
fn confirm(prompt: &str) -> anyhow::Result<bool> {
  print!("{prompt}");
  io::stdout().flush().ok();
  let mut line = String::new();
  io::stdin().lock().read_line(&mut line)?;
  Ok(line.trim().eq_ignore_ascii_case("yes"))
}
