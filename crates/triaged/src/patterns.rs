//! Data-driven entity pattern table.
//!
//! All business-pattern classification goes through one table loaded at
//! startup: each entry maps a regex to an entity type and a confidence
//! weight. The matching engine is generic; the patterns are configuration.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;
use triage_common::TriageError;

/// One pattern entry: regex, the entity type its matches belong to, and a
/// confidence weight in [0,1] used for tier-1 scoring.
#[derive(Debug)]
pub struct PatternEntry {
    pub entity_type: String,
    pub regex: Regex,
    pub confidence: f64,
}

/// TOML shape for an override table.
#[derive(Debug, Deserialize)]
struct PatternFile {
    pattern: Vec<PatternSpec>,
}

#[derive(Debug, Deserialize)]
struct PatternSpec {
    entity_type: String,
    regex: String,
    #[serde(default = "default_pattern_confidence")]
    confidence: f64,
}

fn default_pattern_confidence() -> f64 {
    0.7
}

/// Built-in pattern set: (entity type, regex, confidence).
const BUILTIN_PATTERNS: &[(&str, &str, f64)] = &[
    ("order_number", r"\b(?:PO|SO|ORD)-\d{3,8}\b", 0.9),
    (
        "monetary_amount",
        r"[$€£]\s?\d{1,3}(?:,\d{3})*(?:\.\d{2})?\b",
        0.85,
    ),
    ("date", r"\b\d{4}-\d{2}-\d{2}\b", 0.8),
    (
        "email_address",
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        0.9,
    ),
    ("part_number", r"\b[A-Z]{2,4}\d{4,8}\b", 0.6),
    (
        "company",
        r"\b[A-Z][A-Za-z&]+ (?:Inc|LLC|Ltd|GmbH|Corp)\.?\b",
        0.7,
    ),
    ("phone_number", r"\+\d{1,3}[ -]?\d{2,4}[ -]?\d{3,4}[ -]?\d{3,4}\b", 0.6),
];

/// The loaded pattern table.
pub struct PatternTable {
    entries: Vec<PatternEntry>,
}

impl PatternTable {
    /// Compile the built-in pattern set.
    pub fn builtin() -> Result<Self, TriageError> {
        Self::from_specs(
            BUILTIN_PATTERNS
                .iter()
                .map(|(t, r, c)| (t.to_string(), r.to_string(), *c)),
        )
    }

    /// Load a TOML override table, or the built-in set when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, TriageError> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let raw = fs::read_to_string(path)
            .map_err(|e| TriageError::Config(format!("cannot read pattern table {:?}: {}", path, e)))?;
        let file: PatternFile = toml::from_str(&raw)
            .map_err(|e| TriageError::Config(format!("cannot parse pattern table {:?}: {}", path, e)))?;
        let table = Self::from_specs(
            file.pattern
                .into_iter()
                .map(|p| (p.entity_type, p.regex, p.confidence)),
        )?;
        info!("Loaded {} patterns from {:?}", table.entries.len(), path);
        Ok(table)
    }

    fn from_specs(specs: impl Iterator<Item = (String, String, f64)>) -> Result<Self, TriageError> {
        let mut entries = Vec::new();
        for (entity_type, pattern, confidence) in specs {
            let regex = Regex::new(&pattern).map_err(|e| {
                TriageError::Config(format!("invalid pattern for {}: {}", entity_type, e))
            })?;
            if !(0.0..=1.0).contains(&confidence) {
                return Err(TriageError::Config(format!(
                    "pattern confidence {} for {} outside [0,1]",
                    confidence, entity_type
                )));
            }
            entries.push(PatternEntry {
                entity_type,
                regex,
                confidence,
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every pattern over the text. Matches are deduplicated per entity
    /// type, preserving first-seen order.
    pub fn extract(&self, text: &str) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &self.entries {
            for m in entry.regex.find_iter(text) {
                let values = out.entry(entry.entity_type.clone()).or_default();
                let found = m.as_str().to_string();
                if !values.contains(&found) {
                    values.push(found);
                }
            }
        }
        out
    }

    /// Confidence for a tier-1 result: the mean weight of the entity types
    /// that matched, scaled by how many distinct types were found. No
    /// matches at all stays well below any escalation cutoff.
    pub fn coverage_confidence(&self, entities: &BTreeMap<String, Vec<String>>) -> f64 {
        if entities.is_empty() {
            return 0.25;
        }
        let mut weight_sum = 0.0;
        let mut matched = 0usize;
        for entry in &self.entries {
            if entities.contains_key(&entry.entity_type) {
                weight_sum += entry.confidence;
                matched += 1;
            }
        }
        if matched == 0 {
            return 0.25;
        }
        let mean = weight_sum / matched as f64;
        let breadth = (matched as f64 / 4.0).min(1.0);
        (0.4 + 0.55 * mean * breadth).clamp(0.0, 0.95)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_compiles() {
        let table = PatternTable::builtin().unwrap();
        assert_eq!(table.len(), BUILTIN_PATTERNS.len());
    }

    #[test]
    fn extracts_and_dedupes() {
        let table = PatternTable::builtin().unwrap();
        let entities =
            table.extract("PO-4417 for $12,500.00, again PO-4417, contact ops@acme.com");
        assert_eq!(entities["order_number"], vec!["PO-4417"]);
        assert_eq!(entities["monetary_amount"], vec!["$12,500.00"]);
        assert_eq!(entities["email_address"], vec!["ops@acme.com"]);
    }

    #[test]
    fn no_matches_means_low_confidence() {
        let table = PatternTable::builtin().unwrap();
        let entities = table.extract("hello there");
        assert!(entities.is_empty());
        assert!(table.coverage_confidence(&entities) < 0.3);
    }

    #[test]
    fn broad_coverage_raises_confidence() {
        let table = PatternTable::builtin().unwrap();
        let rich = table.extract(
            "PO-4417, $12,500.00 due 2025-03-14, contact ops@acme.com at Acme Inc.",
        );
        let sparse = table.extract("call about 2025-03-14");
        assert!(table.coverage_confidence(&rich) > table.coverage_confidence(&sparse));
        assert!(table.coverage_confidence(&rich) <= 0.95);
    }

    #[test]
    fn override_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.toml");
        std::fs::write(
            &path,
            r#"
            [[pattern]]
            entity_type = "ticket"
            regex = 'TKT-\d+'
            confidence = 0.8
            "#,
        )
        .unwrap();
        let table = PatternTable::load(Some(&path)).unwrap();
        assert_eq!(table.len(), 1);
        let entities = table.extract("see TKT-991");
        assert_eq!(entities["ticket"], vec!["TKT-991"]);
    }

    #[test]
    fn bad_regex_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.toml");
        std::fs::write(
            &path,
            r#"
            [[pattern]]
            entity_type = "broken"
            regex = '(unclosed'
            "#,
        )
        .unwrap();
        assert!(matches!(
            PatternTable::load(Some(&path)),
            Err(TriageError::Config(_))
        ));
    }
}
