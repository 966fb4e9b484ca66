//! Phase routing: which tier a record starts at, and whether a tier's
//! outcome finalizes the record or escalates it.
//!
//! Tier 1 is only chosen for complete, well-formed chains; tier 2 is the
//! default entry point for everything else; tier 3 is reserved for explicit
//! escalation and is never an initial tier. Confidence exactly at the
//! escalation threshold is not good enough: a tie escalates.

use tracing::debug;
use triage_common::config::ThresholdConfig;
use triage_common::{AnalysisResult, RecordStatus, Tier, TriageError};

/// Where a finished invocation sends the record next.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Persist the result and stamp this terminal status.
    Finalize(RecordStatus),
    /// Requeue at the next tier; the interim result is discarded.
    Escalate(Tier),
}

pub struct PhaseRouter {
    thresholds: ThresholdConfig,
}

impl PhaseRouter {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    /// Initial tier from the conversation's completeness score.
    pub fn initial_tier(&self, completeness_score: f64) -> Tier {
        if completeness_score >= self.thresholds.complete_min {
            Tier::Tier1
        } else {
            Tier::Tier2
        }
    }

    /// Route a successful invocation: finalize when confidence clears the
    /// threshold (strictly), otherwise escalate while a next tier exists.
    pub fn route(&self, tier: Tier, result: &AnalysisResult) -> Disposition {
        if result.confidence > self.thresholds.escalation_confidence {
            return Disposition::Finalize(tier.success_status());
        }
        match tier.next() {
            Some(next) => {
                debug!(
                    "Confidence {:.2} at tier {} not sufficient, escalating to {}",
                    result.confidence,
                    tier.as_u8(),
                    next.as_u8()
                );
                Disposition::Escalate(next)
            }
            // Tier 3 is the end of the line; its result stands.
            None => Disposition::Finalize(tier.success_status()),
        }
    }

    /// Status for a failed invocation. Store/config errors have no record
    /// status; they abort the worker instead.
    pub fn failure_status(&self, err: &TriageError) -> Option<RecordStatus> {
        err.failure_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use triage_common::BusinessSignals;

    fn router() -> PhaseRouter {
        PhaseRouter::new(ThresholdConfig::default())
    }

    fn result(tier: Tier, confidence: f64, degraded: bool) -> AnalysisResult {
        AnalysisResult {
            tier,
            method: "test".to_string(),
            confidence,
            extracted_entities: BTreeMap::new(),
            business_signals: BusinessSignals::default(),
            actionable_items: vec![],
            summary: String::new(),
            processing_time_ms: 1,
            parse_degraded: degraded,
        }
    }

    #[test]
    fn complete_chain_starts_at_tier_one() {
        // Scenario: completeness 0.85 on a full-lifecycle thread.
        assert_eq!(router().initial_tier(0.85), Tier::Tier1);
        assert_eq!(router().initial_tier(0.7), Tier::Tier1);
    }

    #[test]
    fn partial_and_broken_chains_start_at_tier_two() {
        // Scenario: completeness 0.2 with only a request marker.
        assert_eq!(router().initial_tier(0.2), Tier::Tier2);
        assert_eq!(router().initial_tier(0.5), Tier::Tier2);
        assert_eq!(router().initial_tier(0.0), Tier::Tier2);
    }

    #[test]
    fn tier_three_is_never_initial() {
        for score in [0.0, 0.3, 0.69, 0.7, 1.0] {
            assert_ne!(router().initial_tier(score), Tier::Tier3);
        }
    }

    #[test]
    fn confident_result_finalizes_at_its_tier() {
        let r = router();
        assert_eq!(
            r.route(Tier::Tier1, &result(Tier::Tier1, 0.9, false)),
            Disposition::Finalize(RecordStatus::Analyzed)
        );
        assert_eq!(
            r.route(Tier::Tier2, &result(Tier::Tier2, 0.61, false)),
            Disposition::Finalize(RecordStatus::Tier2Complete)
        );
    }

    #[test]
    fn tie_at_threshold_escalates() {
        let r = router();
        assert_eq!(
            r.route(Tier::Tier1, &result(Tier::Tier1, 0.6, false)),
            Disposition::Escalate(Tier::Tier2)
        );
        assert_eq!(
            r.route(Tier::Tier2, &result(Tier::Tier2, 0.6, false)),
            Disposition::Escalate(Tier::Tier3)
        );
    }

    #[test]
    fn degraded_tier_two_result_escalates_to_tier_three() {
        // Scenario: tier-2 invocation returned unparseable prose; degraded
        // confidence sits below the threshold by config validation.
        let r = router();
        let degraded = result(Tier::Tier2, ThresholdConfig::default().degraded_confidence, true);
        assert_eq!(r.route(Tier::Tier2, &degraded), Disposition::Escalate(Tier::Tier3));
    }

    #[test]
    fn tier_three_always_finalizes() {
        let r = router();
        assert_eq!(
            r.route(Tier::Tier3, &result(Tier::Tier3, 0.1, true)),
            Disposition::Finalize(RecordStatus::Tier3Complete)
        );
        assert_eq!(
            r.route(Tier::Tier3, &result(Tier::Tier3, 0.95, false)),
            Disposition::Finalize(RecordStatus::Tier3Complete)
        );
    }

    #[test]
    fn failure_status_follows_error_taxonomy() {
        let r = router();
        assert_eq!(
            r.failure_status(&TriageError::Timeout("t".into())),
            Some(RecordStatus::Timeout)
        );
        assert_eq!(
            r.failure_status(&TriageError::Backend("b".into())),
            Some(RecordStatus::Failed)
        );
        assert_eq!(r.failure_status(&TriageError::Config("c".into())), None);
    }
}
