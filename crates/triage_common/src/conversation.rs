//! Conversation and message models.
//!
//! A conversation ("chain") is the set of messages sharing a thread
//! identifier. The pipeline only looks at structural features of these
//! messages; it never interprets their content itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message inside a conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub subject: String,
    pub body: String,
}

/// A threaded conversation as handed to the pipeline by the ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub chain_id: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn member_count(&self) -> usize {
        self.messages.len()
    }

    /// Earliest and latest message timestamps, None for an empty chain.
    pub fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.messages.iter().map(|m| m.sent_at).min()?;
        let last = self.messages.iter().map(|m| m.sent_at).max()?;
        Some((first, last))
    }

    /// Subject and body of every message, lowercased, for marker scans.
    pub fn combined_text(&self) -> String {
        let mut text = String::new();
        for msg in &self.messages {
            text.push_str(&msg.subject.to_lowercase());
            text.push('\n');
            text.push_str(&msg.body.to_lowercase());
            text.push('\n');
        }
        text
    }
}

/// Where in the business lifecycle a conversation appears to sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Inquiry,
    Negotiation,
    Fulfillment,
    Closed,
    Unknown,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Inquiry => "inquiry",
            WorkflowStage::Negotiation => "negotiation",
            WorkflowStage::Fulfillment => "fulfillment",
            WorkflowStage::Closed => "closed",
            WorkflowStage::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inquiry" => WorkflowStage::Inquiry,
            "negotiation" => WorkflowStage::Negotiation,
            "fulfillment" => WorkflowStage::Fulfillment,
            "closed" => WorkflowStage::Closed,
            _ => WorkflowStage::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: &str, hour: u32) -> Message {
        Message {
            id: id.to_string(),
            sender: "alice@example.com".to_string(),
            recipients: vec!["bob@example.com".to_string()],
            sent_at: Utc.with_ymd_and_hms(2025, 3, 10, hour, 0, 0).unwrap(),
            subject: "Quote request".to_string(),
            body: "Please send pricing.".to_string(),
        }
    }

    #[test]
    fn date_range_spans_messages() {
        let conv = Conversation {
            chain_id: "c1".to_string(),
            messages: vec![msg("m2", 15), msg("m1", 9)],
        };
        let (start, end) = conv.date_range().unwrap();
        assert!(start < end);
        assert_eq!(start.format("%H").to_string(), "09");
    }

    #[test]
    fn empty_conversation_has_no_range() {
        let conv = Conversation {
            chain_id: "c0".to_string(),
            messages: vec![],
        };
        assert!(conv.date_range().is_none());
        assert_eq!(conv.member_count(), 0);
    }

    #[test]
    fn workflow_stage_round_trip() {
        for stage in [
            WorkflowStage::Inquiry,
            WorkflowStage::Negotiation,
            WorkflowStage::Fulfillment,
            WorkflowStage::Closed,
            WorkflowStage::Unknown,
        ] {
            assert_eq!(WorkflowStage::parse(stage.as_str()), stage);
        }
    }
}
