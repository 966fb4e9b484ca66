//! Durable record types: the per-conversation aggregate and the
//! per-message unit of work that moves through the pipeline.

use crate::conversation::WorkflowStage;
use crate::result::AnalysisResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quantized band of a conversation's completeness score.
///
/// The band boundaries come from configuration, never from this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    Complete,
    Partial,
    Broken,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Complete => "complete",
            ChainType::Partial => "partial",
            ChainType::Broken => "broken",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "complete" => ChainType::Complete,
            "partial" => ChainType::Partial,
            _ => ChainType::Broken,
        }
    }
}

/// Lifecycle status of an analysis record.
///
/// Successful statuses (`analyzed`, `tier2_complete`, `tier3_complete`) are
/// terminal and immutable. `failed` and `timeout` are terminal until the
/// retry sweep requeues them. `exhausted` is permanently terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Processing,
    Analyzed,
    Tier2Complete,
    Tier3Complete,
    Failed,
    Timeout,
    Exhausted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Processing => "processing",
            RecordStatus::Analyzed => "analyzed",
            RecordStatus::Tier2Complete => "tier2_complete",
            RecordStatus::Tier3Complete => "tier3_complete",
            RecordStatus::Failed => "failed",
            RecordStatus::Timeout => "timeout",
            RecordStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "processing" => Some(RecordStatus::Processing),
            "analyzed" => Some(RecordStatus::Analyzed),
            "tier2_complete" => Some(RecordStatus::Tier2Complete),
            "tier3_complete" => Some(RecordStatus::Tier3Complete),
            "failed" => Some(RecordStatus::Failed),
            "timeout" => Some(RecordStatus::Timeout),
            "exhausted" => Some(RecordStatus::Exhausted),
            _ => None,
        }
    }

    /// True for statuses that carry a finalized `AnalysisResult`.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RecordStatus::Analyzed | RecordStatus::Tier2Complete | RecordStatus::Tier3Complete
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending | RecordStatus::Processing)
    }

    /// Statuses the retry sweep is allowed to requeue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecordStatus::Failed | RecordStatus::Timeout)
    }
}

/// Analysis tier. Tier 1 is the cheap rule-based stage, tiers 2 and 3 call
/// the inference backend with increasingly capable models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl Tier {
    pub fn as_u8(&self) -> u8 {
        match self {
            Tier::Tier1 => 1,
            Tier::Tier2 => 2,
            Tier::Tier3 => 3,
        }
    }

    /// The next, more expensive tier. None past tier 3.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Tier1 => Some(Tier::Tier2),
            Tier::Tier2 => Some(Tier::Tier3),
            Tier::Tier3 => None,
        }
    }

    /// Success status a record lands in when this tier finalizes it.
    pub fn success_status(&self) -> RecordStatus {
        match self {
            Tier::Tier1 => RecordStatus::Analyzed,
            Tier::Tier2 => RecordStatus::Tier2Complete,
            Tier::Tier3 => RecordStatus::Tier3Complete,
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Tier::Tier1),
            2 => Ok(Tier::Tier2),
            3 => Ok(Tier::Tier3),
            other => Err(format!("invalid tier {}", other)),
        }
    }
}

impl From<Tier> for u8 {
    fn from(t: Tier) -> u8 {
        t.as_u8()
    }
}

/// Per-conversation aggregate, recomputed whenever membership changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub chain_id: String,
    pub chain_type: ChainType,
    pub completeness_score: f64,
    pub member_count: u32,
    pub workflow_stage: WorkflowStage,
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// One unit of work: a single message moving through the tiers.
///
/// Records are never deleted; terminal states preserve the audit trail.
/// `current_tier` only ever increases, and `result` is present exactly when
/// the status is a success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub chain_id: String,
    /// Id of the member message this record analyzes. Unique within a
    /// chain; re-ingesting a conversation never duplicates a member.
    pub message_id: String,
    /// Text of the unit of work (subject + body of the member message).
    pub payload: String,
    pub status: RecordStatus,
    pub current_tier: Tier,
    pub attempt_count: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisResult>,
}
