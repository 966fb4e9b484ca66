//! Durable record store backed by SQLite.
//!
//! Every status transition goes through a guarded conditional UPDATE keyed
//! on the expected prior status, so no two workers can hold the same record
//! and a second finalize of an already-finalized record is a no-op. If the
//! database is unavailable, operations fail closed; callers treat that as
//! fatal for the in-flight record, never as "no work available".

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use triage_common::{
    AnalysisRecord, AnalysisResult, ConversationRecord, RecordStatus, Tier, TriageError,
    WorkflowStage,
};
use uuid::Uuid;

/// Outcome of requeueing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Back to pending with attempt_count incremented.
    Requeued,
    /// Attempt ceiling reached; parked permanently for inspection.
    Exhausted,
    /// Status changed under us; nothing done.
    Skipped,
}

/// Counts from a bulk reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub requeued: usize,
    pub exhausted: usize,
}

/// Aggregate consistency report, queryable mid-run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub status_counts: BTreeMap<String, i64>,
    pub tier_counts: BTreeMap<u8, i64>,
    pub total_records: i64,
    pub total_conversations: i64,
    /// Records whose chain_id has no conversation aggregate.
    pub orphan_records: i64,
    /// Success statuses without a result, or non-success with one.
    pub result_violations: i64,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.orphan_records == 0 && self.result_violations == 0
    }
}

pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let status_raw: String = row.get(4)?;
    let status = RecordStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown status '{}'", status_raw).into(),
        )
    })?;
    let tier_raw: i64 = row.get(5)?;
    let tier = Tier::try_from(tier_raw as u8).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Integer, e.into())
    })?;
    let result_json: Option<String> = row.get(9)?;
    let result: Option<AnalysisResult> = match result_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };
    Ok(AnalysisRecord {
        id: row.get(0)?,
        chain_id: row.get(1)?,
        message_id: row.get(2)?,
        payload: row.get(3)?,
        status,
        current_tier: tier,
        attempt_count: row.get::<_, i64>(6)? as u32,
        claimed_at: row.get(7)?,
        analyzed_at: row.get(8)?,
        result,
    })
}

const RECORD_COLUMNS: &str =
    "id, chain_id, message_id, payload, status, current_tier, attempt_count, claimed_at, analyzed_at, result_json";

impl RecordStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self, TriageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TriageError::Config(format!("cannot create {:?}: {}", parent, e))
            })?;
        }
        let conn = Connection::open(path)?;
        // The daemon and the ops CLI share this file; wait out short locks
        // instead of surfacing SQLITE_BUSY as a fatal store error.
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!("Record store open at {:?}", path);
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, TriageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), TriageError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_records (
                id TEXT PRIMARY KEY,
                chain_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                current_tier INTEGER NOT NULL DEFAULT 1,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                analyzed_at TEXT,
                result_json TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_records (
                chain_id TEXT PRIMARY KEY,
                chain_type TEXT NOT NULL,
                completeness_score REAL NOT NULL,
                member_count INTEGER NOT NULL,
                workflow_stage TEXT NOT NULL,
                date_start TEXT,
                date_end TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_status ON analysis_records(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_chain ON analysis_records(chain_id)",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_chain_message
             ON analysis_records(chain_id, message_id)",
            [],
        )?;

        Ok(())
    }

    /// Insert or update the per-conversation aggregate.
    pub fn upsert_conversation(&self, record: &ConversationRecord) -> Result<(), TriageError> {
        let conn = self.conn.lock().unwrap();
        let (date_start, date_end) = match record.date_range {
            Some((start, end)) => (Some(start), Some(end)),
            None => (None, None),
        };
        conn.execute(
            r#"
            INSERT INTO conversation_records
                (chain_id, chain_type, completeness_score, member_count, workflow_stage, date_start, date_end)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(chain_id) DO UPDATE SET
                chain_type = excluded.chain_type,
                completeness_score = excluded.completeness_score,
                member_count = excluded.member_count,
                workflow_stage = excluded.workflow_stage,
                date_start = excluded.date_start,
                date_end = excluded.date_end
            "#,
            params![
                record.chain_id,
                record.chain_type.as_str(),
                record.completeness_score,
                record.member_count,
                record.workflow_stage.as_str(),
                date_start,
                date_end,
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, chain_id: &str) -> Result<Option<ConversationRecord>, TriageError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT chain_id, chain_type, completeness_score, member_count, workflow_stage, date_start, date_end
                 FROM conversation_records WHERE chain_id = ?1",
                params![chain_id],
                |row| {
                    let chain_type: String = row.get(1)?;
                    let stage: String = row.get(4)?;
                    let date_start: Option<DateTime<Utc>> = row.get(5)?;
                    let date_end: Option<DateTime<Utc>> = row.get(6)?;
                    Ok(ConversationRecord {
                        chain_id: row.get(0)?,
                        chain_type: triage_common::ChainType::parse(&chain_type),
                        completeness_score: row.get(2)?,
                        member_count: row.get::<_, i64>(3)? as u32,
                        workflow_stage: WorkflowStage::parse(&stage),
                        date_range: date_start.zip(date_end),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Create one pending unit of work. A (chain_id, message_id) pair is
    /// enqueued at most once; an already-known member is left untouched and
    /// None is returned.
    pub fn enqueue_record(
        &self,
        chain_id: &str,
        message_id: &str,
        payload: &str,
        initial_tier: Tier,
    ) -> Result<Option<String>, TriageError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO analysis_records
                 (id, chain_id, message_id, payload, status, current_tier, attempt_count)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0)",
            params![id, chain_id, message_id, payload, initial_tier.as_u8()],
        )?;
        Ok((inserted == 1).then_some(id))
    }

    /// Atomically claim one pending record for exclusive processing.
    ///
    /// The UPDATE is guarded on the prior status, so two concurrent
    /// claimants can never receive the same record. Returns None when no
    /// work is pending.
    pub fn claim_next(&self) -> Result<Option<AnalysisRecord>, TriageError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!(
                    "UPDATE analysis_records
                     SET status = 'processing', claimed_at = ?1
                     WHERE id = (SELECT id FROM analysis_records WHERE status = 'pending' ORDER BY rowid LIMIT 1)
                       AND status = 'pending'
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![Utc::now()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Persist the terminal outcome of a claimed record in one atomic write.
    ///
    /// The result payload is stored only for success statuses, keeping the
    /// invariant that `result` is present exactly when the status is a
    /// success. Guarded on `processing`: a second call after the record has
    /// left `processing` is a no-op returning false.
    pub fn finalize(
        &self,
        id: &str,
        status: RecordStatus,
        result: Option<&AnalysisResult>,
    ) -> Result<bool, TriageError> {
        let result_json = if status.is_success() {
            match result {
                Some(r) => Some(
                    serde_json::to_string(r)
                        .map_err(|e| TriageError::Parse(format!("result serialization: {}", e)))?,
                ),
                None => {
                    return Err(TriageError::Parse(format!(
                        "success status {} requires a result",
                        status.as_str()
                    )))
                }
            }
        } else {
            None
        };
        let analyzed_at = status.is_success().then(Utc::now);

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE analysis_records
             SET status = ?2, result_json = ?3, analyzed_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, status.as_str(), result_json, analyzed_at],
        )?;
        if changed == 0 {
            warn!("Finalize of {} to {} skipped: not processing", id, status.as_str());
        }
        Ok(changed == 1)
    }

    /// Requeue a claimed record at the next tier, discarding the interim
    /// low-confidence result. The tier guard keeps `current_tier` monotone.
    pub fn escalate(&self, id: &str, next_tier: Tier) -> Result<bool, TriageError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE analysis_records
             SET status = 'pending', current_tier = ?2, claimed_at = NULL, result_json = NULL
             WHERE id = ?1 AND status = 'processing' AND current_tier < ?2",
            params![id, next_tier.as_u8()],
        )?;
        Ok(changed == 1)
    }

    /// Records stuck in `processing` longer than `stale_after`.
    pub fn sweep_stale(&self, stale_after: Duration) -> Result<Vec<AnalysisRecord>, TriageError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 2_000));
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM analysis_records
             WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at < ?1"
        ))?;
        let rows = stmt.query_map(params![cutoff], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Requeue one record from an expected status, honoring the attempt
    /// ceiling. A record at the ceiling moves to `exhausted` instead.
    pub fn requeue(
        &self,
        id: &str,
        expected: RecordStatus,
        max_attempts: u32,
    ) -> Result<Requeue, TriageError> {
        let conn = self.conn.lock().unwrap();
        let exhausted = conn.execute(
            "UPDATE analysis_records SET status = 'exhausted', claimed_at = NULL
             WHERE id = ?1 AND status = ?2 AND attempt_count >= ?3",
            params![id, expected.as_str(), max_attempts],
        )?;
        if exhausted == 1 {
            return Ok(Requeue::Exhausted);
        }
        let requeued = conn.execute(
            "UPDATE analysis_records
             SET status = 'pending', attempt_count = attempt_count + 1, claimed_at = NULL
             WHERE id = ?1 AND status = ?2 AND attempt_count < ?3",
            params![id, expected.as_str(), max_attempts],
        )?;
        Ok(if requeued == 1 {
            Requeue::Requeued
        } else {
            Requeue::Skipped
        })
    }

    /// Bulk reset: requeue every record in the given statuses. Only failure
    /// statuses may be reset; finalized successes are immutable and
    /// `exhausted` stays parked.
    pub fn reset_statuses(
        &self,
        statuses: &[RecordStatus],
        max_attempts: u32,
    ) -> Result<ResetReport, TriageError> {
        for status in statuses {
            if !matches!(status, RecordStatus::Failed | RecordStatus::Timeout) {
                return Err(TriageError::Config(format!(
                    "refusing to reset status '{}'",
                    status.as_str()
                )));
            }
        }
        if statuses.is_empty() {
            return Ok(ResetReport {
                requeued: 0,
                exhausted: 0,
            });
        }
        // Status names come from the enum, not from user text.
        let in_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(",");

        let conn = self.conn.lock().unwrap();
        let exhausted = conn.execute(
            &format!(
                "UPDATE analysis_records SET status = 'exhausted', claimed_at = NULL
                 WHERE status IN ({in_list}) AND attempt_count >= ?1"
            ),
            params![max_attempts],
        )?;
        let requeued = conn.execute(
            &format!(
                "UPDATE analysis_records
                 SET status = 'pending', attempt_count = attempt_count + 1, claimed_at = NULL
                 WHERE status IN ({in_list}) AND attempt_count < ?1"
            ),
            params![max_attempts],
        )?;
        info!(
            "Reset {} record(s) to pending, {} exhausted (statuses: {})",
            requeued, exhausted, in_list
        );
        Ok(ResetReport {
            requeued,
            exhausted,
        })
    }

    pub fn get_record(&self, id: &str) -> Result<Option<AnalysisRecord>, TriageError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM analysis_records WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Counts per status, queryable at any time mid-run.
    pub fn status_counts(&self) -> Result<BTreeMap<String, i64>, TriageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM analysis_records GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count);
        }
        Ok(out)
    }

    /// Counts per current tier.
    pub fn tier_counts(&self) -> Result<BTreeMap<u8, i64>, TriageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT current_tier, COUNT(*) FROM analysis_records GROUP BY current_tier")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (tier, count) = row?;
            out.insert(tier as u8, count);
        }
        Ok(out)
    }

    /// Full consistency report: distributions plus invariant violations.
    pub fn validation_report(&self) -> Result<ValidationReport, TriageError> {
        let status_counts = self.status_counts()?;
        let tier_counts = self.tier_counts()?;
        let conn = self.conn.lock().unwrap();

        let total_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM analysis_records", [], |r| r.get(0))?;
        let total_conversations: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversation_records", [], |r| r.get(0))?;
        let orphan_records: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_records a
             LEFT JOIN conversation_records c ON a.chain_id = c.chain_id
             WHERE c.chain_id IS NULL",
            [],
            |r| r.get(0),
        )?;
        let result_violations: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_records
             WHERE (status IN ('analyzed','tier2_complete','tier3_complete') AND result_json IS NULL)
                OR (status NOT IN ('analyzed','tier2_complete','tier3_complete') AND result_json IS NOT NULL)",
            [],
            |r| r.get(0),
        )?;

        Ok(ValidationReport {
            status_counts,
            tier_counts,
            total_records,
            total_conversations,
            orphan_records,
            result_violations,
        })
    }

    /// Test hook: age a claim so sweeps see it as stale.
    #[cfg(test)]
    pub(crate) fn backdate_claim(&self, id: &str, ago: Duration) {
        let when = Utc::now() - ChronoDuration::from_std(ago).unwrap();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE analysis_records SET claimed_at = ?2 WHERE id = ?1",
            params![id, when],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use std::collections::HashSet;
    use triage_common::{BusinessSignals, ChainType};

    fn store_with(n: usize) -> (RecordStore, Vec<String>) {
        let store = RecordStore::open_in_memory().unwrap();
        let ids = (0..n)
            .map(|i| {
                store
                    .enqueue_record(&format!("chain-{}", i % 3), &format!("m{}", i), "please quote PO-1", Tier::Tier1)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        (store, ids)
    }

    fn sample_result(tier: Tier) -> AnalysisResult {
        AnalysisResult {
            tier,
            method: "test".to_string(),
            confidence: 0.9,
            extracted_entities: Map::new(),
            business_signals: BusinessSignals::default(),
            actionable_items: vec![],
            summary: "done".to_string(),
            processing_time_ms: 5,
            parse_degraded: false,
        }
    }

    #[test]
    fn enqueue_is_idempotent_per_chain_member() {
        let store = RecordStore::open_in_memory().unwrap();
        let first = store
            .enqueue_record("chain-a", "m0", "text", Tier::Tier1)
            .unwrap();
        assert!(first.is_some());
        // Same member again: no new record, even with a different payload.
        let again = store
            .enqueue_record("chain-a", "m0", "other text", Tier::Tier2)
            .unwrap();
        assert!(again.is_none());
        // Same message id in another chain is a distinct unit of work.
        let other_chain = store
            .enqueue_record("chain-b", "m0", "text", Tier::Tier1)
            .unwrap();
        assert!(other_chain.is_some());

        let record = store.get_record(&first.unwrap()).unwrap().unwrap();
        assert_eq!(record.payload, "text");
        assert_eq!(record.current_tier, Tier::Tier1);
    }

    #[test]
    fn two_handles_share_one_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let daemon_side = RecordStore::open(&path).unwrap();
        let ctl_side = RecordStore::open(&path).unwrap();

        let id = daemon_side
            .enqueue_record("c", "m0", "text", Tier::Tier1)
            .unwrap()
            .unwrap();
        let claimed = ctl_side.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(
            daemon_side.status_counts().unwrap().get("processing"),
            Some(&1)
        );
    }

    #[test]
    fn claim_transitions_pending_to_processing() {
        let (store, ids) = store_with(1);
        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, ids[0]);
        assert_eq!(claimed.status, RecordStatus::Processing);
        assert!(claimed.claimed_at.is_some());
        // Queue is now empty.
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_never_share_a_record() {
        let (store, _) = store_with(20);
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(record) = store.claim_next().unwrap() {
                    got.push(record.id);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20, "a record was handed out twice");
    }

    #[test]
    fn finalize_is_idempotent() {
        let (store, ids) = store_with(1);
        store.claim_next().unwrap().unwrap();
        let result = sample_result(Tier::Tier1);
        assert!(store
            .finalize(&ids[0], RecordStatus::Analyzed, Some(&result))
            .unwrap());
        // Second application is a no-op.
        assert!(!store
            .finalize(&ids[0], RecordStatus::Analyzed, Some(&result))
            .unwrap());
        let record = store.get_record(&ids[0]).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Analyzed);
        assert_eq!(record.result.unwrap(), result);
        assert!(record.analyzed_at.is_some());
    }

    #[test]
    fn finalize_requires_result_for_success() {
        let (store, ids) = store_with(1);
        store.claim_next().unwrap().unwrap();
        assert!(store
            .finalize(&ids[0], RecordStatus::Analyzed, None)
            .is_err());
    }

    #[test]
    fn failure_statuses_store_no_result() {
        let (store, ids) = store_with(1);
        store.claim_next().unwrap().unwrap();
        assert!(store.finalize(&ids[0], RecordStatus::Timeout, None).unwrap());
        let record = store.get_record(&ids[0]).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Timeout);
        assert!(record.result.is_none());
        assert!(record.analyzed_at.is_none());
    }

    #[test]
    fn escalate_increments_tier_and_requeues() {
        let (store, ids) = store_with(1);
        store.claim_next().unwrap().unwrap();
        assert!(store.escalate(&ids[0], Tier::Tier2).unwrap());
        let record = store.get_record(&ids[0]).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.current_tier, Tier::Tier2);
        assert!(record.result.is_none());
        assert!(record.claimed_at.is_none());
    }

    #[test]
    fn escalate_never_lowers_tier() {
        let store = RecordStore::open_in_memory().unwrap();
        let id = store.enqueue_record("c", "m0", "text", Tier::Tier3).unwrap().unwrap();
        store.claim_next().unwrap().unwrap();
        // Tier 3 -> tier 2 is not a legal transition.
        assert!(!store.escalate(&id, Tier::Tier2).unwrap());
        let record = store.get_record(&id).unwrap().unwrap();
        assert_eq!(record.current_tier, Tier::Tier3);
        assert_eq!(record.status, RecordStatus::Processing);
    }

    #[test]
    fn sweep_finds_only_stale_processing() {
        let (store, ids) = store_with(2);
        store.claim_next().unwrap().unwrap();
        store.claim_next().unwrap().unwrap();
        store.backdate_claim(&ids[0], Duration::from_secs(3600));

        let stale = store.sweep_stale(Duration::from_secs(600)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, ids[0]);
    }

    #[test]
    fn requeue_increments_attempts_until_ceiling() {
        let (store, ids) = store_with(1);
        store.claim_next().unwrap().unwrap();
        store.finalize(&ids[0], RecordStatus::Failed, None).unwrap();

        assert_eq!(
            store.requeue(&ids[0], RecordStatus::Failed, 2).unwrap(),
            Requeue::Requeued
        );
        let record = store.get_record(&ids[0]).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempt_count, 1);

        // Fail it again, then again; second requeue works, third exhausts.
        store.claim_next().unwrap().unwrap();
        store.finalize(&ids[0], RecordStatus::Failed, None).unwrap();
        assert_eq!(
            store.requeue(&ids[0], RecordStatus::Failed, 2).unwrap(),
            Requeue::Requeued
        );
        store.claim_next().unwrap().unwrap();
        store.finalize(&ids[0], RecordStatus::Failed, None).unwrap();
        assert_eq!(
            store.requeue(&ids[0], RecordStatus::Failed, 2).unwrap(),
            Requeue::Exhausted
        );
        let record = store.get_record(&ids[0]).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Exhausted);
        assert_eq!(record.attempt_count, 2);
    }

    #[test]
    fn requeue_skips_when_status_moved() {
        let (store, ids) = store_with(1);
        assert_eq!(
            store.requeue(&ids[0], RecordStatus::Failed, 3).unwrap(),
            Requeue::Skipped
        );
    }

    #[test]
    fn reset_restores_exactly_matching_records() {
        let (store, ids) = store_with(4);
        for _ in 0..4 {
            store.claim_next().unwrap().unwrap();
        }
        store.finalize(&ids[0], RecordStatus::Failed, None).unwrap();
        store.finalize(&ids[1], RecordStatus::Timeout, None).unwrap();
        store
            .finalize(&ids[2], RecordStatus::Analyzed, Some(&sample_result(Tier::Tier1)))
            .unwrap();
        // ids[3] stays processing.

        let before = store.status_counts().unwrap();
        assert_eq!(before.get("failed"), Some(&1));
        assert_eq!(before.get("timeout"), Some(&1));

        let report = store
            .reset_statuses(&[RecordStatus::Failed, RecordStatus::Timeout], 3)
            .unwrap();
        assert_eq!(report.requeued, 2);
        assert_eq!(report.exhausted, 0);

        let after = store.status_counts().unwrap();
        assert_eq!(after.get("pending"), Some(&2));
        assert_eq!(after.get("failed"), None);
        assert_eq!(after.get("timeout"), None);
        assert_eq!(after.get("analyzed"), Some(&1));
        assert_eq!(after.get("processing"), Some(&1));
    }

    #[test]
    fn reset_refuses_success_statuses() {
        let (store, _) = store_with(1);
        assert!(store
            .reset_statuses(&[RecordStatus::Analyzed], 3)
            .is_err());
        assert!(store
            .reset_statuses(&[RecordStatus::Exhausted], 3)
            .is_err());
    }

    #[test]
    fn conversation_upsert_and_validation() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .upsert_conversation(&ConversationRecord {
                chain_id: "chain-a".to_string(),
                chain_type: ChainType::Partial,
                completeness_score: 0.5,
                member_count: 2,
                workflow_stage: WorkflowStage::Inquiry,
                date_range: None,
            })
            .unwrap();
        store.enqueue_record("chain-a", "m0", "text", Tier::Tier2).unwrap().unwrap();
        store.enqueue_record("chain-orphan", "m0", "text", Tier::Tier2).unwrap().unwrap();

        let fetched = store.get_conversation("chain-a").unwrap().unwrap();
        assert_eq!(fetched.chain_type, ChainType::Partial);

        let report = store.validation_report().unwrap();
        assert_eq!(report.total_records, 2);
        assert_eq!(report.total_conversations, 1);
        assert_eq!(report.orphan_records, 1);
        assert_eq!(report.result_violations, 0);
        assert!(!report.is_consistent());

        // Re-scored conversation replaces the aggregate.
        store
            .upsert_conversation(&ConversationRecord {
                chain_id: "chain-a".to_string(),
                chain_type: ChainType::Complete,
                completeness_score: 0.8,
                member_count: 5,
                workflow_stage: WorkflowStage::Closed,
                date_range: None,
            })
            .unwrap();
        let fetched = store.get_conversation("chain-a").unwrap().unwrap();
        assert_eq!(fetched.chain_type, ChainType::Complete);
        assert_eq!(fetched.member_count, 5);
    }
}
