//! The structured outcome of one analysis invocation.
//!
//! This is the shape persisted as JSON alongside the record, so every field
//! must round-trip losslessly through serde.

use crate::record::Tier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Estimated risk carried by a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Estimated revenue opportunity in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RevenueOpportunity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// Coarse business signals extracted from a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BusinessSignals {
    #[serde(default)]
    pub estimated_value: f64,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub revenue_opportunity: RevenueOpportunity,
}

/// A follow-up action surfaced by the analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionableItem {
    pub action: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    pub impact: String,
}

/// Outcome of one tier's analysis of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub tier: Tier,
    /// Name of the backend/model (or rule engine) that produced this result.
    pub method: String,
    pub confidence: f64,
    #[serde(default)]
    pub extracted_entities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub business_signals: BusinessSignals,
    #[serde(default)]
    pub actionable_items: Vec<ActionableItem>,
    pub summary: String,
    pub processing_time_ms: u64,
    /// True when structured parsing of the raw backend output failed and a
    /// fallback summary was substituted. Degraded results carry a confidence
    /// low enough to force escalation.
    #[serde(default)]
    pub parse_degraded: bool,
}
