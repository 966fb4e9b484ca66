//! Conversation completeness scoring.
//!
//! Pure structural scoring: no inference, no side effects. A conversation
//! earns credit for each lifecycle marker present (request, response,
//! resolution), a bonus when all three are present, and a saturating
//! contribution from reply count.

use triage_common::{Conversation, WorkflowStage};

/// Reply count at which the length contribution saturates.
const LENGTH_SATURATION: usize = 8;

const LENGTH_WEIGHT: f64 = 0.40;
const MARKER_WEIGHT: f64 = 0.15;
const FULL_LIFECYCLE_BONUS: f64 = 0.15;

const REQUEST_MARKERS: &[&str] = &[
    "please",
    "could you",
    "can you",
    "would you",
    "we need",
    "i need",
    "request",
    "quote",
    "inquiry",
    "looking for",
];

const RESPONSE_MARKERS: &[&str] = &[
    "thank you for",
    "thanks for",
    "in response to",
    "regarding your",
    "attached",
    "here is",
    "here are",
    "we can offer",
    "our answer",
];

const RESOLUTION_MARKERS: &[&str] = &[
    "resolved",
    "confirmed",
    "completed",
    "order placed",
    "deal closed",
    "signed",
    "shipped",
    "invoice paid",
    "all set",
    "case closed",
];

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

pub fn has_request_marker(text: &str) -> bool {
    contains_any(text, REQUEST_MARKERS)
}

pub fn has_response_marker(text: &str) -> bool {
    contains_any(text, RESPONSE_MARKERS)
}

pub fn has_resolution_marker(text: &str) -> bool {
    contains_any(text, RESOLUTION_MARKERS)
}

/// Score a conversation's structural completeness in [0, 1].
///
/// Empty conversations score exactly 0.0. Deterministic for a given input.
pub fn score(conv: &Conversation) -> f64 {
    if conv.messages.is_empty() {
        return 0.0;
    }

    let text = conv.combined_text();

    let length = conv.messages.len().min(LENGTH_SATURATION) as f64 / LENGTH_SATURATION as f64;
    let mut total = length * LENGTH_WEIGHT;

    let request = has_request_marker(&text);
    let response = has_response_marker(&text);
    let resolution = has_resolution_marker(&text);

    for present in [request, response, resolution] {
        if present {
            total += MARKER_WEIGHT;
        }
    }

    // All three lifecycle phases present is a distinct, stronger signal
    // than any two.
    if request && response && resolution {
        total += FULL_LIFECYCLE_BONUS;
    }

    total.clamp(0.0, 1.0)
}

/// Classify which lifecycle stage a conversation appears to be in.
pub fn classify_workflow(text: &str) -> WorkflowStage {
    let lower = text.to_lowercase();
    if has_resolution_marker(&lower) {
        return WorkflowStage::Closed;
    }
    if contains_any(
        &lower,
        &["discount", "pricing", "price", "counter", "negotiat", "terms"],
    ) {
        return WorkflowStage::Negotiation;
    }
    if contains_any(
        &lower,
        &["delivery", "shipment", "tracking", "invoice", "purchase order"],
    ) {
        return WorkflowStage::Fulfillment;
    }
    if has_request_marker(&lower) {
        return WorkflowStage::Inquiry;
    }
    WorkflowStage::Unknown
}
