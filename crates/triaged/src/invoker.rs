//! Analysis invocation.
//!
//! Tier 1 runs the local pattern table. Tiers 2 and 3 call the inference
//! backend over HTTP with a hard per-tier timeout. Backend output comes in
//! three shapes: clean JSON, JSON wrapped in prose or code fences, and
//! unstructured text. The first two parse into a structured payload; the
//! third becomes a degraded result whose confidence is forced low enough
//! that the router escalates it.

use crate::patterns::PatternTable;
use crate::prompts;
use crate::scorer;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use triage_common::config::{BackendConfig, ThresholdConfig};
use triage_common::{
    ActionableItem, AnalysisRecord, AnalysisResult, BusinessSignals, RevenueOpportunity,
    RiskLevel, Tier, TriageError,
};

/// The opaque analysis seam: one tier applied to one record.
pub trait Analyzer: Send + Sync {
    fn analyze(
        &self,
        record: &AnalysisRecord,
        tier: Tier,
    ) -> impl Future<Output = Result<AnalysisResult, TriageError>> + Send;
}

/// What came back from parsing raw backend output.
#[derive(Debug)]
pub enum ParsedOutput {
    Structured(BackendPayload),
    Degraded(String),
}

/// The field contract tiers 2 and 3 are asked to produce.
#[derive(Debug, Deserialize, Default)]
pub struct BackendPayload {
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub extracted_entities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub business_signals: BusinessSignals,
    #[serde(default)]
    pub actionable_items: Vec<ActionableItem>,
    #[serde(default)]
    pub summary: String,
}

/// Strip code fences and surrounding prose down to the outermost JSON object.
fn extract_json(text: &str) -> &str {
    let inner = match text.find("```") {
        Some(open) => {
            let after = &text[open + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(close) => &after[..close],
                None => after,
            }
        }
        None => text,
    };
    if let (Some(start), Some(end)) = (inner.find('{'), inner.rfind('}')) {
        if start < end {
            return &inner[start..=end];
        }
    }
    inner
}

fn parse_entities(v: Option<&Value>) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    let Some(obj) = v.and_then(|v| v.as_object()) else {
        return out;
    };
    for (key, val) in obj {
        let values: Vec<String> = match val {
            // Models sometimes return a bare string instead of a list.
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect(),
            _ => vec![],
        };
        if !values.is_empty() {
            out.insert(key.clone(), values);
        }
    }
    out
}

fn parse_signals(v: Option<&Value>) -> BusinessSignals {
    let Some(s) = v else {
        return BusinessSignals::default();
    };
    let risk = match s.get("risk_level").and_then(|x| x.as_str()) {
        Some("high") => RiskLevel::High,
        Some("medium") => RiskLevel::Medium,
        _ => RiskLevel::Low,
    };
    let opportunity = match s.get("revenue_opportunity").and_then(|x| x.as_str()) {
        Some("high") => RevenueOpportunity::High,
        Some("medium") => RevenueOpportunity::Medium,
        Some("low") => RevenueOpportunity::Low,
        _ => RevenueOpportunity::None,
    };
    BusinessSignals {
        estimated_value: s
            .get("estimated_value")
            .and_then(|x| x.as_f64())
            .unwrap_or(0.0),
        risk_level: risk,
        revenue_opportunity: opportunity,
    }
}

fn parse_actionable_items(v: Option<&Value>) -> Vec<ActionableItem> {
    v.and_then(|a| a.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| {
                    let action = item.get("action").and_then(|x| x.as_str())?;
                    Some(ActionableItem {
                        action: action.to_string(),
                        owner: item
                            .get("owner")
                            .and_then(|x| x.as_str())
                            .unwrap_or("unassigned")
                            .to_string(),
                        deadline: item
                            .get("deadline")
                            .and_then(|x| if x.is_null() { None } else { x.as_str() })
                            .map(|s| s.to_string()),
                        impact: item
                            .get("impact")
                            .and_then(|x| x.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Field-by-field recovery for JSON that is valid but off-contract
/// (confidence as string, entities as bare strings, and so on).
fn value_to_payload(v: &Value) -> BackendPayload {
    let confidence = v
        .get("confidence")
        .and_then(|x| {
            x.as_f64()
                .or_else(|| x.as_str().and_then(|s| s.parse::<f64>().ok()))
        })
        .unwrap_or(0.0);
    BackendPayload {
        confidence: confidence.clamp(0.0, 1.0),
        extracted_entities: parse_entities(v.get("extracted_entities")),
        business_signals: parse_signals(v.get("business_signals")),
        actionable_items: parse_actionable_items(v.get("actionable_items")),
        summary: v
            .get("summary")
            .and_then(|x| x.as_str())
            .unwrap_or("")
            .to_string(),
    }
}

/// Parse raw backend output: direct serde, then fence/brace extraction,
/// then flexible recovery, then degraded.
pub fn parse_backend_output(raw: &str) -> ParsedOutput {
    if let Ok(payload) = serde_json::from_str::<BackendPayload>(raw) {
        return ParsedOutput::Structured(payload);
    }
    let stripped = extract_json(raw);
    if let Ok(payload) = serde_json::from_str::<BackendPayload>(stripped) {
        debug!("Parsed backend output after delimiter stripping");
        return ParsedOutput::Structured(payload);
    }
    match serde_json::from_str::<Value>(stripped) {
        Ok(v) if v.is_object() => {
            debug!("Parsed backend output via flexible recovery");
            ParsedOutput::Structured(value_to_payload(&v))
        }
        _ => ParsedOutput::Degraded(raw.to_string()),
    }
}

/// Truncate a degraded raw response down to a summary prefix.
fn degraded_summary(raw: &str) -> String {
    const MAX: usize = 240;
    let trimmed = raw.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_string();
    }
    let mut end = MAX;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

/// Concrete invoker: pattern table for tier 1, HTTP backend for tiers 2/3.
pub struct AnalysisInvoker {
    backend: BackendConfig,
    thresholds: ThresholdConfig,
    patterns: PatternTable,
}

impl AnalysisInvoker {
    pub fn new(
        backend: BackendConfig,
        thresholds: ThresholdConfig,
        patterns: PatternTable,
    ) -> Self {
        Self {
            backend,
            thresholds,
            patterns,
        }
    }

    pub fn patterns(&self) -> &PatternTable {
        &self.patterns
    }

    /// Cheap rule-based tier: no network, pure pattern matching.
    pub fn rule_based_analysis(&self, record: &AnalysisRecord) -> AnalysisResult {
        let start = Instant::now();
        let entities = self.patterns.extract(&record.payload);
        let confidence = self.patterns.coverage_confidence(&entities);

        let estimated_value = entities
            .get("monetary_amount")
            .and_then(|values| values.first())
            .and_then(|raw| {
                raw.trim_start_matches(['$', '€', '£', ' '])
                    .replace(',', "")
                    .parse::<f64>()
                    .ok()
            })
            .unwrap_or(0.0);

        let lower = record.payload.to_lowercase();
        let risk_level = if ["urgent", "complaint", "cancel", "legal", "escalate"]
            .iter()
            .any(|k| lower.contains(k))
        {
            RiskLevel::High
        } else if ["delay", "issue", "concern", "problem"]
            .iter()
            .any(|k| lower.contains(k))
        {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let revenue_opportunity = if estimated_value >= 50_000.0 {
            RevenueOpportunity::High
        } else if estimated_value >= 1_000.0 {
            RevenueOpportunity::Medium
        } else if estimated_value > 0.0 {
            RevenueOpportunity::Low
        } else {
            RevenueOpportunity::None
        };

        let actionable_items: Vec<ActionableItem> = record
            .payload
            .lines()
            .filter(|line| scorer::has_request_marker(&line.to_lowercase()))
            .take(3)
            .map(|line| ActionableItem {
                action: line.trim().chars().take(120).collect(),
                owner: "unassigned".to_string(),
                deadline: entities
                    .get("date")
                    .and_then(|dates| dates.first().cloned()),
                impact: "follow-up".to_string(),
            })
            .collect();

        let workflow = scorer::classify_workflow(&record.payload);
        let summary = format!(
            "Rule-based pass: {} entity type(s) across {} chars; workflow {}",
            entities.len(),
            record.payload.len(),
            workflow.as_str()
        );

        AnalysisResult {
            tier: Tier::Tier1,
            method: self.backend.tier_model(Tier::Tier1).to_string(),
            confidence,
            extracted_entities: entities,
            business_signals: BusinessSignals {
                estimated_value,
                risk_level,
                revenue_opportunity,
            },
            actionable_items,
            summary,
            processing_time_ms: start.elapsed().as_millis() as u64,
            parse_degraded: false,
        }
    }

    /// Raw backend call: one non-streaming generate request with a hard
    /// timeout. Timeouts and transport failures map to distinct errors.
    async fn call_backend(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, TriageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::Backend(format!("client build failed: {}", e)))?;

        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.backend.temperature,
                "num_predict": self.backend.max_tokens,
            },
        });

        info!("[>] backend call model={} timeout={:?}", model, timeout);
        let response = client
            .post(format!("{}/api/generate", self.backend.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TriageError::Timeout(format!("{} exceeded {:?}", model, timeout))
                } else {
                    TriageError::Backend(format!("request to {} failed: {}", model, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(TriageError::Backend(format!(
                "backend returned {}",
                response.status()
            )));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| TriageError::Backend(format!("unreadable backend body: {}", e)))?;
        Ok(json
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string())
    }

    /// Assemble the final result, degrading when parsing failed.
    fn finish_result(&self, raw: &str, tier: Tier, elapsed_ms: u64) -> AnalysisResult {
        let method = self.backend.tier_model(tier).to_string();
        match parse_backend_output(raw) {
            ParsedOutput::Structured(payload) => AnalysisResult {
                tier,
                method,
                confidence: payload.confidence.clamp(0.0, 1.0),
                extracted_entities: payload.extracted_entities,
                business_signals: payload.business_signals,
                actionable_items: payload.actionable_items,
                summary: payload.summary,
                processing_time_ms: elapsed_ms,
                parse_degraded: false,
            },
            ParsedOutput::Degraded(text) => {
                warn!(
                    "Unparseable backend output at tier {} ({} chars), degrading",
                    tier.as_u8(),
                    text.len()
                );
                AnalysisResult {
                    tier,
                    method,
                    confidence: self.thresholds.degraded_confidence,
                    extracted_entities: BTreeMap::new(),
                    business_signals: BusinessSignals::default(),
                    actionable_items: vec![],
                    summary: degraded_summary(&text),
                    processing_time_ms: elapsed_ms,
                    parse_degraded: true,
                }
            }
        }
    }

    /// Health probe against the backend.
    pub async fn is_available(&self) -> bool {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };
        client
            .get(format!("{}/api/tags", self.backend.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

impl Analyzer for AnalysisInvoker {
    fn analyze(
        &self,
        record: &AnalysisRecord,
        tier: Tier,
    ) -> impl Future<Output = Result<AnalysisResult, TriageError>> + Send {
        async move {
            if tier == Tier::Tier1 {
                return Ok(self.rule_based_analysis(record));
            }

            // Tier 1 is handled above, so a prompt always exists here.
            let (prompt, truncated) = prompts::build_prompt(record, tier)
                .ok_or_else(|| TriageError::Parse("no prompt for tier".to_string()))?;
            if truncated > 0 {
                warn!(
                    "Prompt for record {} truncated by {} chars",
                    record.id, truncated
                );
            }

            let model = self.backend.tier_model(tier).to_string();
            let timeout = self.backend.tier_timeout(tier);
            let start = Instant::now();
            let raw = self.call_backend(&model, &prompt, timeout).await?;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            Ok(self.finish_result(&raw, tier, elapsed_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::RecordStatus;

    fn invoker() -> AnalysisInvoker {
        AnalysisInvoker::new(
            BackendConfig::default(),
            ThresholdConfig::default(),
            PatternTable::builtin().unwrap(),
        )
    }

    fn record(payload: &str) -> AnalysisRecord {
        AnalysisRecord {
            id: "r1".to_string(),
            chain_id: "c1".to_string(),
            message_id: "m1".to_string(),
            payload: payload.to_string(),
            status: RecordStatus::Processing,
            current_tier: Tier::Tier1,
            attempt_count: 0,
            claimed_at: None,
            analyzed_at: None,
            result: None,
        }
    }

    #[test]
    fn clean_json_parses_directly() {
        let raw = r#"{"confidence": 0.8, "summary": "quote request",
                      "extracted_entities": {"order_number": ["PO-1"]}}"#;
        match parse_backend_output(raw) {
            ParsedOutput::Structured(p) => {
                assert_eq!(p.confidence, 0.8);
                assert_eq!(p.extracted_entities["order_number"], vec!["PO-1"]);
            }
            ParsedOutput::Degraded(_) => panic!("should parse"),
        }
    }

    #[test]
    fn fenced_json_in_prose_parses() {
        let raw = "Sure! Here is the analysis:\n```json\n{\"confidence\": 0.72, \
                   \"summary\": \"ok\"}\n```\nLet me know if you need more.";
        match parse_backend_output(raw) {
            ParsedOutput::Structured(p) => assert_eq!(p.confidence, 0.72),
            ParsedOutput::Degraded(_) => panic!("should parse fenced JSON"),
        }
    }

    #[test]
    fn braces_in_prose_parse() {
        let raw = "The result is {\"confidence\": 0.5, \"summary\": \"mid\"} as requested.";
        assert!(matches!(
            parse_backend_output(raw),
            ParsedOutput::Structured(_)
        ));
    }

    #[test]
    fn off_contract_json_recovers_flexibly() {
        // confidence as string, entity as bare string
        let raw = r#"{"confidence": "0.65", "extracted_entities": {"company": "Acme Inc"},
                      "business_signals": {"risk_level": "high"}, "summary": "x"}"#;
        match parse_backend_output(raw) {
            ParsedOutput::Structured(p) => {
                assert_eq!(p.confidence, 0.65);
                assert_eq!(p.extracted_entities["company"], vec!["Acme Inc"]);
                assert_eq!(p.business_signals.risk_level, RiskLevel::High);
            }
            ParsedOutput::Degraded(_) => panic!("should recover"),
        }
    }

    #[test]
    fn unparseable_prose_degrades() {
        let raw = "I'm sorry, I cannot analyze this message.";
        match parse_backend_output(raw) {
            ParsedOutput::Degraded(text) => assert_eq!(text, raw),
            ParsedOutput::Structured(_) => panic!("should degrade"),
        }
    }

    #[test]
    fn degraded_result_forces_low_confidence() {
        let inv = invoker();
        let result = inv.finish_result("no structure here at all", Tier::Tier2, 17);
        assert!(result.parse_degraded);
        assert_eq!(result.confidence, inv.thresholds.degraded_confidence);
        assert!(result.confidence < inv.thresholds.escalation_confidence);
        assert_eq!(result.summary, "no structure here at all");
        assert_eq!(result.processing_time_ms, 17);
    }

    #[test]
    fn degraded_summary_truncates_long_text() {
        let raw = "y".repeat(2000);
        let s = degraded_summary(&raw);
        assert!(s.chars().count() <= 241);
        assert!(s.ends_with('…'));
    }

    #[test]
    fn rule_based_tier_extracts_entities() {
        let inv = invoker();
        let result = inv.rule_based_analysis(&record(
            "please quote PO-4417 for $12,500.00 by 2025-03-14, urgent",
        ));
        assert_eq!(result.tier, Tier::Tier1);
        assert!(!result.parse_degraded);
        assert_eq!(result.extracted_entities["order_number"], vec!["PO-4417"]);
        assert_eq!(result.business_signals.estimated_value, 12500.0);
        assert_eq!(result.business_signals.risk_level, RiskLevel::High);
        assert_eq!(
            result.business_signals.revenue_opportunity,
            RevenueOpportunity::Medium
        );
        assert_eq!(result.actionable_items.len(), 1);
        assert_eq!(
            result.actionable_items[0].deadline.as_deref(),
            Some("2025-03-14")
        );
    }

    #[test]
    fn rule_based_tier_on_empty_text_is_low_confidence() {
        let inv = invoker();
        let result = inv.rule_based_analysis(&record("hello"));
        assert!(result.confidence < inv.thresholds.escalation_confidence);
        assert!(result.extracted_entities.is_empty());
    }

    #[tokio::test]
    async fn analyze_tier1_needs_no_backend() {
        let inv = invoker();
        let result = inv
            .analyze(&record("invoice $2,000.00 from ops@acme.com"), Tier::Tier1)
            .await
            .unwrap();
        assert_eq!(result.tier, Tier::Tier1);
        assert_eq!(result.method, "pattern-table");
    }
}
