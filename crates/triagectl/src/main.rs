//! triagectl - operator controls for the triage store.
//!
//! Status distributions, requeue of failed work, consistency validation,
//! and a one-shot retry sweep, all against the same SQLite store the
//! daemon uses.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use triage_common::{RecordStatus, TriageConfig};
use triaged::retry::RetryCoordinator;
use triaged::store::RecordStore;

#[derive(Parser)]
#[command(name = "triagectl", version, about = "Operator controls for the triage pipeline")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = triage_common::config::CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Counts per status and per tier
    Status,
    /// Requeue records in the given statuses (comma-separated)
    Reset {
        /// Statuses to requeue, e.g. "failed,timeout"
        #[arg(long, default_value = "failed,timeout")]
        statuses: String,
    },
    /// Consistency report: distributions plus invariant violations
    Validate,
    /// One retry-sweep pass
    Sweep {
        /// Override the staleness cutoff in seconds
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = TriageConfig::load(&cli.config).context("loading configuration")?;
    let store = RecordStore::open(config.store.db_path.as_ref())?;

    match cli.command {
        Command::Status => status(&store),
        Command::Reset { statuses } => reset(&store, &config, &statuses),
        Command::Validate => validate(&store),
        Command::Sweep { stale_after_secs } => sweep(store, &config, stale_after_secs),
    }
}

fn print_distribution(store: &RecordStore) -> Result<()> {
    let statuses = store.status_counts()?;
    let tiers = store.tier_counts()?;
    println!("status counts:");
    for (status, count) in &statuses {
        println!("  {:<16} {}", status, count);
    }
    println!("tier counts:");
    for (tier, count) in &tiers {
        println!("  tier {:<11} {}", tier, count);
    }
    Ok(())
}

fn status(store: &RecordStore) -> Result<()> {
    print_distribution(store)
}

fn reset(store: &RecordStore, config: &TriageConfig, statuses: &str) -> Result<()> {
    let mut parsed = Vec::new();
    for name in statuses.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match RecordStatus::parse(name) {
            Some(status) => parsed.push(status),
            None => bail!("unknown status '{}'", name),
        }
    }

    println!("before:");
    print_distribution(store)?;

    let report = store.reset_statuses(&parsed, config.retry.max_attempts)?;
    println!(
        "\nrequeued {} record(s), {} exhausted\n",
        report.requeued, report.exhausted
    );

    println!("after:");
    print_distribution(store)
}

fn validate(store: &RecordStore) -> Result<()> {
    let report = store.validation_report()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_consistent() {
        bail!(
            "inconsistencies found: {} orphan record(s), {} result violation(s)",
            report.orphan_records,
            report.result_violations
        );
    }
    Ok(())
}

fn sweep(store: RecordStore, config: &TriageConfig, stale_after_secs: Option<u64>) -> Result<()> {
    let mut retry = config.retry.clone();
    if let Some(secs) = stale_after_secs {
        retry.stale_after_secs = secs;
    }
    let coordinator = RetryCoordinator::new(Arc::new(store), &retry);
    let report = coordinator.sweep_once()?;
    println!(
        "swept: {} stale reclaimed, {} requeued, {} exhausted",
        report.stale_reclaimed, report.requeued, report.exhausted
    );
    Ok(())
}
