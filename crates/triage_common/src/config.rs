//! Configuration for the triage pipeline.
//!
//! Loaded from a TOML file, every field individually defaulted so partial
//! configs work. The chain-type bands and the escalation confidence cutoff
//! are deliberately tunable rather than hardcoded; the defaults below are a
//! starting point, not a law.

use crate::error::TriageError;
use crate::record::{ChainType, Tier};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default config file path.
pub const CONFIG_PATH: &str = "/etc/triage/config.toml";

/// Score bands and the confidence cutoff for escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Completeness at or above this makes a chain `complete`.
    #[serde(default = "default_complete_min")]
    pub complete_min: f64,

    /// Completeness at or above this (but below `complete_min`) is `partial`.
    #[serde(default = "default_partial_min")]
    pub partial_min: f64,

    /// Confidence must be strictly above this to finalize at a tier.
    /// A tie escalates.
    #[serde(default = "default_escalation_confidence")]
    pub escalation_confidence: f64,

    /// Confidence stamped onto degraded results. Must sit below
    /// `escalation_confidence` so the router escalates them.
    #[serde(default = "default_degraded_confidence")]
    pub degraded_confidence: f64,
}

fn default_complete_min() -> f64 {
    0.7
}

fn default_partial_min() -> f64 {
    0.3
}

fn default_escalation_confidence() -> f64 {
    0.6
}

fn default_degraded_confidence() -> f64 {
    0.2
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            complete_min: default_complete_min(),
            partial_min: default_partial_min(),
            escalation_confidence: default_escalation_confidence(),
            degraded_confidence: default_degraded_confidence(),
        }
    }
}

impl ThresholdConfig {
    /// Quantize a completeness score into its chain-type band.
    pub fn chain_type_for(&self, score: f64) -> ChainType {
        if score >= self.complete_min {
            ChainType::Complete
        } else if score >= self.partial_min {
            ChainType::Partial
        } else {
            ChainType::Broken
        }
    }
}

/// Inference backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Mid-cost model for tier 2.
    #[serde(default = "default_tier2_model")]
    pub tier2_model: String,

    /// High-cost model for tier 3, reserved for escalation.
    #[serde(default = "default_tier3_model")]
    pub tier3_model: String,

    #[serde(default = "default_tier2_timeout")]
    pub tier2_timeout_secs: u64,

    #[serde(default = "default_tier3_timeout")]
    pub tier3_timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_tier2_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}

fn default_tier3_model() -> String {
    "qwen2.5:14b-instruct".to_string()
}

fn default_tier2_timeout() -> u64 {
    30
}

fn default_tier3_timeout() -> u64 {
    120 // most expensive tier gets the longest leash
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            tier2_model: default_tier2_model(),
            tier3_model: default_tier3_model(),
            tier2_timeout_secs: default_tier2_timeout(),
            tier3_timeout_secs: default_tier3_timeout(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl BackendConfig {
    /// Hard deadline for one invocation at the given tier. Tier 1 is local
    /// rule-based work and gets a nominal bound.
    pub fn tier_timeout(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Tier1 => Duration::from_secs(5),
            Tier::Tier2 => Duration::from_secs(self.tier2_timeout_secs),
            Tier::Tier3 => Duration::from_secs(self.tier3_timeout_secs),
        }
    }

    pub fn tier_model(&self, tier: Tier) -> &str {
        match tier {
            Tier::Tier1 => "pattern-table",
            Tier::Tier2 => &self.tier2_model,
            Tier::Tier3 => &self.tier3_model,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Backoff when the claim queue is empty.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_idle_backoff_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            idle_backoff_ms: default_idle_backoff_ms(),
        }
    }
}

/// Retry sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling; a record at the ceiling moves to `exhausted`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// A record in `processing` longer than this is considered stuck.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stale_after() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stale_after_secs: default_stale_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Optional TOML file overriding the built-in entity pattern table.
    #[serde(default)]
    pub pattern_table_path: Option<String>,
}

fn default_db_path() -> String {
    "/var/lib/triage/records.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pattern_table_path: None,
        }
    }
}

/// Top-level configuration object, passed explicitly to each component at
/// construction. There is no ambient global config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriageConfig {
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl TriageConfig {
    /// Load from a TOML file. A missing file falls back to defaults; a
    /// malformed file is a fatal config error.
    pub fn load(path: &Path) -> Result<Self, TriageError> {
        if !path.exists() {
            warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| TriageError::Config(format!("cannot read {:?}: {}", path, e)))?;
        let config: TriageConfig = toml::from_str(&raw)
            .map_err(|e| TriageError::Config(format!("cannot parse {:?}: {}", path, e)))?;

        config.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject impossible threshold and pool settings before any worker starts.
    pub fn validate(&self) -> Result<(), TriageError> {
        let t = &self.thresholds;
        for (name, v) in [
            ("complete_min", t.complete_min),
            ("partial_min", t.partial_min),
            ("escalation_confidence", t.escalation_confidence),
            ("degraded_confidence", t.degraded_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(TriageError::Config(format!(
                    "threshold {} = {} outside [0,1]",
                    name, v
                )));
            }
        }
        if t.partial_min >= t.complete_min {
            return Err(TriageError::Config(format!(
                "partial_min {} must be below complete_min {}",
                t.partial_min, t.complete_min
            )));
        }
        if t.degraded_confidence >= t.escalation_confidence {
            return Err(TriageError::Config(format!(
                "degraded_confidence {} must be below escalation_confidence {}",
                t.degraded_confidence, t.escalation_confidence
            )));
        }
        if self.workers.count == 0 {
            return Err(TriageError::Config("worker count must be nonzero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(TriageError::Config("max_attempts must be nonzero".into()));
        }
        Ok(())
    }
}
