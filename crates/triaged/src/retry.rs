//! Retry sweep for stuck and failed records.
//!
//! Workers never un-claim their own record; this sweep is the only writer
//! allowed to move a record out of `processing` on staleness grounds. It
//! also requeues `failed` and `timeout` records, and parks anything at the
//! attempt ceiling in `exhausted` so poison records cannot loop forever.

use crate::store::{RecordStore, Requeue};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use triage_common::config::RetryConfig;
use triage_common::{RecordStatus, TriageError};

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale `processing` records reclaimed and requeued.
    pub stale_reclaimed: usize,
    /// `failed`/`timeout` records requeued.
    pub requeued: usize,
    /// Records parked at the attempt ceiling.
    pub exhausted: usize,
}

pub struct RetryCoordinator {
    store: Arc<RecordStore>,
    max_attempts: u32,
    stale_after: Duration,
    interval: Duration,
}

impl RetryCoordinator {
    pub fn new(store: Arc<RecordStore>, config: &RetryConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts,
            stale_after: Duration::from_secs(config.stale_after_secs),
            interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    /// One sweep pass: reclaim stale claims, then requeue failures.
    pub fn sweep_once(&self) -> Result<SweepReport, TriageError> {
        let mut report = SweepReport::default();

        for record in self.store.sweep_stale(self.stale_after)? {
            warn!(
                "Record {} stuck in processing since {:?}, reclaiming",
                record.id, record.claimed_at
            );
            match self
                .store
                .requeue(&record.id, RecordStatus::Processing, self.max_attempts)?
            {
                Requeue::Requeued => report.stale_reclaimed += 1,
                Requeue::Exhausted => report.exhausted += 1,
                Requeue::Skipped => {}
            }
        }

        let reset = self.store.reset_statuses(
            &[RecordStatus::Failed, RecordStatus::Timeout],
            self.max_attempts,
        )?;
        report.requeued += reset.requeued;
        report.exhausted += reset.exhausted;

        if report != SweepReport::default() {
            info!(
                "Sweep: {} stale reclaimed, {} requeued, {} exhausted",
                report.stale_reclaimed, report.requeued, report.exhausted
            );
        }
        Ok(report)
    }

    /// Periodic sweep loop until `shutdown` is set. Store errors are fatal.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<(), TriageError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.sweep_once()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::Tier;

    fn coordinator(store: Arc<RecordStore>, max_attempts: u32) -> RetryCoordinator {
        RetryCoordinator::new(
            store,
            &RetryConfig {
                max_attempts,
                stale_after_secs: 600,
                sweep_interval_secs: 60,
            },
        )
    }

    #[test]
    fn stale_processing_is_reclaimed_with_attempt_bump() {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let id = store.enqueue_record("c", "m0", "text", Tier::Tier1).unwrap().unwrap();
        store.claim_next().unwrap().unwrap();
        store.backdate_claim(&id, Duration::from_secs(3600));

        let report = coordinator(store.clone(), 3).sweep_once().unwrap();
        assert_eq!(report.stale_reclaimed, 1);

        let record = store.get_record(&id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn fresh_processing_is_left_alone() {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let id = store.enqueue_record("c", "m0", "text", Tier::Tier1).unwrap().unwrap();
        store.claim_next().unwrap().unwrap();

        let report = coordinator(store.clone(), 3).sweep_once().unwrap();
        assert_eq!(report, SweepReport::default());
        let record = store.get_record(&id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Processing);
    }

    #[test]
    fn failed_and_timeout_records_are_requeued() {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let a = store.enqueue_record("c", "m0", "text", Tier::Tier2).unwrap().unwrap();
        let b = store.enqueue_record("c", "m1", "text", Tier::Tier2).unwrap().unwrap();
        store.claim_next().unwrap().unwrap();
        store.claim_next().unwrap().unwrap();
        store.finalize(&a, RecordStatus::Failed, None).unwrap();
        store.finalize(&b, RecordStatus::Timeout, None).unwrap();

        let report = coordinator(store.clone(), 3).sweep_once().unwrap();
        assert_eq!(report.requeued, 2);
        assert_eq!(report.exhausted, 0);
        assert_eq!(
            store.status_counts().unwrap().get("pending"),
            Some(&2)
        );
    }

    #[test]
    fn record_at_ceiling_becomes_exhausted_not_pending() {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let id = store.enqueue_record("c", "m0", "text", Tier::Tier2).unwrap().unwrap();
        let coordinator = coordinator(store.clone(), 1);

        store.claim_next().unwrap().unwrap();
        store.finalize(&id, RecordStatus::Failed, None).unwrap();
        assert_eq!(coordinator.sweep_once().unwrap().requeued, 1);

        store.claim_next().unwrap().unwrap();
        store.finalize(&id, RecordStatus::Failed, None).unwrap();
        let report = coordinator.sweep_once().unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.exhausted, 1);

        let record = store.get_record(&id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Exhausted);
        // Exhausted records stay visible and are never requeued again.
        assert_eq!(coordinator.sweep_once().unwrap(), SweepReport::default());
    }
}
