//! Worker pool: claim -> route -> invoke -> finalize.
//!
//! Workers share nothing but the record store; every status transition is a
//! guarded store update. Each invocation runs under a backstop timeout on
//! top of the backend's own deadline, so a worker marks its record
//! `timeout` itself when it can, with the retry sweep as the crash backstop.

use crate::invoker::Analyzer;
use crate::router::{Disposition, PhaseRouter};
use crate::store::RecordStore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use triage_common::config::TriageConfig;
use triage_common::{AnalysisRecord, TriageError};

/// Counters owned by the pool. Not process-wide: constructed per run and
/// handed to whoever reports on it.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub claimed: AtomicU64,
    pub finalized: AtomicU64,
    pub escalated: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub degraded: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub claimed: u64,
    pub finalized: u64,
    pub escalated: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub degraded: u64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Process one claimed record through its current tier.
async fn process_record<A: Analyzer>(
    store: &RecordStore,
    analyzer: &A,
    router: &PhaseRouter,
    config: &TriageConfig,
    metrics: &PipelineMetrics,
    record: AnalysisRecord,
) -> Result<(), TriageError> {
    let tier = record.current_tier;
    // Backstop over the backend's own deadline; covers local stalls too.
    let backstop = config.backend.tier_timeout(tier) + Duration::from_secs(5);

    let outcome = match tokio::time::timeout(backstop, analyzer.analyze(&record, tier)).await {
        Ok(result) => result,
        Err(_) => Err(TriageError::Timeout(format!(
            "tier {} backstop {:?} elapsed",
            tier.as_u8(),
            backstop
        ))),
    };

    match outcome {
        Ok(result) => {
            if result.parse_degraded {
                metrics.degraded.fetch_add(1, Ordering::Relaxed);
            }
            match router.route(tier, &result) {
                Disposition::Finalize(status) => {
                    store.finalize(&record.id, status, Some(&result))?;
                    metrics.finalized.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Record {} finalized as {} at tier {} (confidence {:.2})",
                        record.id,
                        status.as_str(),
                        tier.as_u8(),
                        result.confidence
                    );
                }
                Disposition::Escalate(next) => {
                    store.escalate(&record.id, next)?;
                    metrics.escalated.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Record {} escalated to tier {} (confidence {:.2})",
                        record.id,
                        next.as_u8(),
                        result.confidence
                    );
                }
            }
            Ok(())
        }
        Err(err) => match router.failure_status(&err) {
            Some(status) => {
                warn!("Record {} failed: {} -> {}", record.id, err, status.as_str());
                store.finalize(&record.id, status, None)?;
                match status {
                    triage_common::RecordStatus::Timeout => {
                        metrics.timed_out.fetch_add(1, Ordering::Relaxed)
                    }
                    _ => metrics.failed.fetch_add(1, Ordering::Relaxed),
                };
                Ok(())
            }
            // Store/config errors stop the worker; nothing is skipped silently.
            None => Err(err),
        },
    }
}

async fn worker_loop<A: Analyzer>(
    worker_id: usize,
    store: Arc<RecordStore>,
    analyzer: Arc<A>,
    router: Arc<PhaseRouter>,
    config: Arc<TriageConfig>,
    metrics: Arc<PipelineMetrics>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), TriageError> {
    let idle = Duration::from_millis(config.workers.idle_backoff_ms);
    debug!("Worker {} started", worker_id);
    while !shutdown.load(Ordering::Relaxed) {
        match store.claim_next() {
            Ok(Some(record)) => {
                metrics.claimed.fetch_add(1, Ordering::Relaxed);
                process_record(&store, analyzer.as_ref(), &router, &config, &metrics, record)
                    .await?;
            }
            Ok(None) => {
                tokio::time::sleep(idle).await;
            }
            Err(err) => {
                error!("Worker {}: store unavailable: {}", worker_id, err);
                return Err(err);
            }
        }
    }
    debug!("Worker {} stopped", worker_id);
    Ok(())
}

/// Fixed-size pool of claim/invoke/finalize loops.
pub struct WorkerPool;

impl WorkerPool {
    /// Run until shutdown. Any worker hitting a store error takes the run
    /// down with it; the error is surfaced to the operator.
    pub async fn run<A: Analyzer + 'static>(
        store: Arc<RecordStore>,
        analyzer: Arc<A>,
        config: Arc<TriageConfig>,
        metrics: Arc<PipelineMetrics>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), TriageError> {
        let router = Arc::new(PhaseRouter::new(config.thresholds.clone()));
        let mut handles = Vec::with_capacity(config.workers.count);
        info!("Starting {} worker(s)", config.workers.count);

        for worker_id in 0..config.workers.count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                store.clone(),
                analyzer.clone(),
                router.clone(),
                config.clone(),
                metrics.clone(),
                shutdown.clone(),
            )));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    shutdown.store(true, Ordering::Relaxed);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    shutdown.store(true, Ordering::Relaxed);
                    error!("Worker task panicked: {}", join_err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
