//! triaged - progressive conversation-triage daemon.
//!
//! Claims pending analysis records, routes them across tiers, and sweeps
//! stuck work back into the queue. `ingest` loads a JSON file of
//! conversations into the store and exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use triage_common::{Conversation, TriageConfig};
use triaged::invoker::AnalysisInvoker;
use triaged::patterns::PatternTable;
use triaged::retry::RetryCoordinator;
use triaged::service;
use triaged::store::RecordStore;
use triaged::worker::{PipelineMetrics, WorkerPool};

#[derive(Parser)]
#[command(name = "triaged", version, about = "Progressive conversation triage daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = triage_common::config::CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool and the retry sweep until interrupted
    Run,
    /// Ingest a JSON file of conversations and exit
    Ingest {
        /// JSON file containing an array of conversations
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = TriageConfig::load(&cli.config).context("loading configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Ingest { file } => ingest(config, &file),
    }
}

async fn run(config: TriageConfig) -> Result<()> {
    info!("triaged v{} starting", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(RecordStore::open(config.store.db_path.as_ref())?);
    let patterns = PatternTable::load(
        config
            .store
            .pattern_table_path
            .as_deref()
            .map(std::path::Path::new),
    )?;
    let invoker = Arc::new(AnalysisInvoker::new(
        config.backend.clone(),
        config.thresholds.clone(),
        patterns,
    ));
    let metrics = Arc::new(PipelineMetrics::default());
    let shutdown = Arc::new(AtomicBool::new(false));
    let config = Arc::new(config);

    let coordinator = RetryCoordinator::new(store.clone(), &config.retry);
    let sweeper = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.run(shutdown).await {
                error!("Retry sweep stopped: {}", err);
            }
        })
    };

    let mut pool = tokio::spawn(WorkerPool::run(
        store.clone(),
        invoker,
        config,
        metrics.clone(),
        shutdown.clone(),
    ));

    let finished = tokio::select! {
        result = &mut pool => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    shutdown.store(true, Ordering::Relaxed);
    let result = match finished {
        Some(result) => result,
        None => {
            info!("Interrupt received, draining workers");
            pool.await
        }
    };
    result.context("worker pool join")??;
    sweeper.abort();

    let snapshot = metrics.snapshot();
    info!(
        "Shutdown complete: {} claimed, {} finalized, {} escalated, {} failed, {} timed out",
        snapshot.claimed, snapshot.finalized, snapshot.escalated, snapshot.failed,
        snapshot.timed_out
    );
    Ok(())
}

fn ingest(config: TriageConfig, file: &PathBuf) -> Result<()> {
    let store = RecordStore::open(config.store.db_path.as_ref())?;
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading conversations from {:?}", file))?;
    let conversations: Vec<Conversation> =
        serde_json::from_str(&raw).context("parsing conversations JSON")?;

    let mut enqueued = 0usize;
    for conversation in &conversations {
        enqueued += service::ingest_conversation(&store, &config, conversation)?.len();
    }
    info!(
        "Ingested {} conversation(s), {} record(s) enqueued",
        conversations.len(),
        enqueued
    );
    Ok(())
}
