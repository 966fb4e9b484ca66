//! Library-level service surface.
//!
//! The HTTP wrapper that exposes these as endpoints is an external
//! collaborator; this module is the request/response API it calls:
//! synchronous extraction, a health probe, a metrics snapshot, and
//! conversation ingestion.

use crate::invoker::AnalysisInvoker;
use crate::router::PhaseRouter;
use crate::scorer;
use crate::store::RecordStore;
use crate::worker::{MetricsSnapshot, PipelineMetrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;
use triage_common::{
    Conversation, ConversationRecord, TriageConfig, TriageError, WorkflowStage,
};
use uuid::Uuid;

/// One-shot extraction request: raw text plus an optional caller id.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractRequest {
    pub text: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractResponse {
    pub id: String,
    pub entities: BTreeMap<String, Vec<String>>,
    pub workflow: WorkflowStage,
    pub processing_time_ms: u64,
}

/// Health probe result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store_ok: bool,
    pub backend_ok: bool,
    pub version: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_ok && self.backend_ok
    }
}

/// Aggregate metrics: store distributions plus pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub status_counts: BTreeMap<String, i64>,
    pub tier_counts: BTreeMap<u8, i64>,
    pub pool: MetricsSnapshot,
}

/// Run the pattern table over one text synchronously.
pub fn extract(invoker: &AnalysisInvoker, request: &ExtractRequest) -> ExtractResponse {
    let start = Instant::now();
    let entities = invoker.patterns().extract(&request.text);
    let workflow = scorer::classify_workflow(&request.text);
    ExtractResponse {
        id: request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        entities,
        workflow,
        processing_time_ms: start.elapsed().as_millis() as u64,
    }
}

/// Probe the store and the backend.
pub async fn health(store: &RecordStore, invoker: &AnalysisInvoker) -> HealthReport {
    HealthReport {
        store_ok: store.status_counts().is_ok(),
        backend_ok: invoker.is_available().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Snapshot counters and distributions; callable mid-run at any time.
pub fn metrics_snapshot(
    store: &RecordStore,
    metrics: &PipelineMetrics,
) -> Result<MetricsReport, TriageError> {
    Ok(MetricsReport {
        status_counts: store.status_counts()?,
        tier_counts: store.tier_counts()?,
        pool: metrics.snapshot(),
    })
}

/// Score a conversation, upsert its aggregate, and enqueue one unit of work
/// per member message at the router's initial tier. Re-running after
/// membership changes re-scores the aggregate and enqueues only members not
/// seen before; existing records are untouched (they are only ever moved by
/// the router and the sweep).
///
/// Returns the ids of the newly enqueued records.
pub fn ingest_conversation(
    store: &RecordStore,
    config: &TriageConfig,
    conversation: &Conversation,
) -> Result<Vec<String>, TriageError> {
    let completeness_score = scorer::score(conversation);
    let chain_type = config.thresholds.chain_type_for(completeness_score);
    let workflow_stage = scorer::classify_workflow(&conversation.combined_text());

    store.upsert_conversation(&ConversationRecord {
        chain_id: conversation.chain_id.clone(),
        chain_type,
        completeness_score,
        member_count: conversation.member_count() as u32,
        workflow_stage,
        date_range: conversation.date_range(),
    })?;

    let router = PhaseRouter::new(config.thresholds.clone());
    let initial_tier = router.initial_tier(completeness_score);

    let mut ids = Vec::with_capacity(conversation.messages.len());
    for message in &conversation.messages {
        let payload = format!("{}\n{}", message.subject, message.body);
        if let Some(id) =
            store.enqueue_record(&conversation.chain_id, &message.id, &payload, initial_tier)?
        {
            ids.push(id);
        }
    }
    info!(
        "Ingested chain {} ({} member(s), score {:.2}, {} -> tier {})",
        conversation.chain_id,
        conversation.member_count(),
        completeness_score,
        chain_type.as_str(),
        initial_tier.as_u8()
    );
    Ok(ids)
}
