//! Prompt building for the backend tiers.
//!
//! Prompts are capped in size; oversized conversation text is truncated
//! rather than rejected so a pathological thread cannot stall a tier.

use triage_common::{AnalysisRecord, Tier};

/// Hard cap on prompt size in bytes.
pub const MAX_PROMPT_BYTES: usize = 16_384;

const JSON_CONTRACT: &str = r#"Respond with ONLY a JSON object, no prose, matching:
{
  "confidence": <float 0..1, your certainty in this analysis>,
  "extracted_entities": {"<entity_type>": ["<value>", ...]},
  "business_signals": {
    "estimated_value": <float, 0 if unknown>,
    "risk_level": "low" | "medium" | "high",
    "revenue_opportunity": "none" | "low" | "medium" | "high"
  },
  "actionable_items": [
    {"action": "<what>", "owner": "<who>", "deadline": "<when, optional>", "impact": "<why>"}
  ],
  "summary": "<one or two sentences>"
}"#;

/// Truncate to the prompt cap, returning how many bytes were dropped.
fn cap(text: &str) -> (&str, usize) {
    if text.len() <= MAX_PROMPT_BYTES {
        return (text, 0);
    }
    // Cut on a char boundary at or below the cap.
    let mut end = MAX_PROMPT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], text.len() - end)
}

/// Mid-cost tier: entity extraction and a short summary.
pub fn build_tier2_prompt(record: &AnalysisRecord) -> (String, usize) {
    let (payload, truncated) = cap(&record.payload);
    let prompt = format!(
        "You are a business-communication analyst. Extract entities and \
         summarize the message below from conversation {}.\n\n\
         === MESSAGE ===\n{}\n=== END MESSAGE ===\n\n{}",
        record.chain_id, payload, JSON_CONTRACT
    );
    (prompt, truncated)
}

/// High-cost tier: full analysis, reserved for escalation. Asks for
/// actionable items and business signals in addition to entities.
pub fn build_tier3_prompt(record: &AnalysisRecord) -> (String, usize) {
    let (payload, truncated) = cap(&record.payload);
    let prompt = format!(
        "You are a senior business analyst reviewing an escalated message \
         from conversation {} that earlier, cheaper analysis could not \
         classify confidently (attempt {}). Read carefully. Identify every \
         entity, estimate deal value and risk, and list concrete follow-up \
         actions with owners and deadlines.\n\n\
         === MESSAGE ===\n{}\n=== END MESSAGE ===\n\n{}",
        record.chain_id, record.attempt_count, payload, JSON_CONTRACT
    );
    (prompt, truncated)
}

/// Dispatch on tier. Tier 1 never builds a prompt (local rule engine).
pub fn build_prompt(record: &AnalysisRecord, tier: Tier) -> Option<(String, usize)> {
    match tier {
        Tier::Tier1 => None,
        Tier::Tier2 => Some(build_tier2_prompt(record)),
        Tier::Tier3 => Some(build_tier3_prompt(record)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::RecordStatus;

    fn record(payload: String) -> AnalysisRecord {
        AnalysisRecord {
            id: "r1".to_string(),
            chain_id: "c1".to_string(),
            message_id: "m1".to_string(),
            payload,
            status: RecordStatus::Processing,
            current_tier: Tier::Tier2,
            attempt_count: 1,
            claimed_at: None,
            analyzed_at: None,
            result: None,
        }
    }

    #[test]
    fn tier2_prompt_contains_contract_and_payload() {
        let (prompt, truncated) = build_tier2_prompt(&record("please quote PO-4417".into()));
        assert!(prompt.contains("PO-4417"));
        assert!(prompt.contains("\"confidence\""));
        assert_eq!(truncated, 0);
    }

    #[test]
    fn oversized_payload_is_capped() {
        let (prompt, truncated) = build_tier3_prompt(&record("x".repeat(MAX_PROMPT_BYTES * 2)));
        assert!(truncated >= MAX_PROMPT_BYTES);
        assert!(prompt.len() < MAX_PROMPT_BYTES + 2048);
    }

    #[test]
    fn tier1_builds_no_prompt() {
        assert!(build_prompt(&record("text".into()), Tier::Tier1).is_none());
        assert!(build_prompt(&record("text".into()), Tier::Tier3).is_some());
    }

    #[test]
    fn cap_respects_char_boundaries() {
        let text = "é".repeat(MAX_PROMPT_BYTES); // 2 bytes per char
        let (capped, truncated) = cap(&text);
        assert!(capped.len() <= MAX_PROMPT_BYTES);
        assert!(truncated > 0);
        assert!(std::str::from_utf8(capped.as_bytes()).is_ok());
    }
}
