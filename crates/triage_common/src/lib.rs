//! Shared types for the conversation triage pipeline.
//!
//! Everything the daemon and the operator CLI agree on lives here:
//! conversation and record models, the persisted analysis result shape,
//! the error taxonomy, and the tunable configuration.

pub mod config;
pub mod conversation;
pub mod error;
pub mod record;
pub mod result;

pub use config::TriageConfig;
pub use conversation::{Conversation, Message, WorkflowStage};
pub use error::TriageError;
pub use record::{AnalysisRecord, ChainType, ConversationRecord, RecordStatus, Tier};
pub use result::{ActionableItem, AnalysisResult, BusinessSignals, RevenueOpportunity, RiskLevel};
