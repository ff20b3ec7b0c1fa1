//! Configuration for synthesis runs.
//!
//! A [`SynthesisConfig`] is an explicit, versioned value passed into every
//! call. Two runs with different weight tables can be compared side by side
//! because nothing is read from process-wide state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{CoverageDomain, Criticality, FrameworkTag, RecordKind};
use crate::scoring::Normalization;

/// Top-level configuration of a synthesis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Version of this configuration, echoed into every result.
    pub version: u32,
    pub resolver: ResolverConfig,
    pub conflicts: ConflictConfig,
    pub expertise: ExpertiseWeights,
    pub scoring: ScoringConfig,
    pub gaps: GapConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            version: 1,
            resolver: ResolverConfig::default(),
            conflicts: ConflictConfig::default(),
            expertise: ExpertiseWeights::default(),
            scoring: ScoringConfig::default(),
            gaps: GapConfig::default(),
        }
    }
}

impl SynthesisConfig {
    /// Parses a configuration from JSON. Missing sections take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes this configuration to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks ranges and table shapes.
    pub fn validate(&self) -> Result<()> {
        self.resolver.validate()?;
        if !self.conflicts.tolerance.is_finite() || self.conflicts.tolerance < 0.0 {
            return Err(Error::Configuration(format!(
                "conflict tolerance must be a non-negative number, got {}",
                self.conflicts.tolerance
            )));
        }
        self.expertise.validate()?;
        self.scoring.validate()?;
        self.gaps.validate()?;
        Ok(())
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_acceptance_threshold(mut self, threshold: f64) -> Self {
        self.resolver.acceptance_threshold = threshold;
        self
    }

    pub fn with_conflict_tolerance(mut self, tolerance: f64) -> Self {
        self.conflicts.tolerance = tolerance;
        self
    }

    pub fn with_expertise_weight(
        mut self,
        framework: impl Into<FrameworkTag>,
        kind: RecordKind,
        weight: f64,
    ) -> Self {
        self.expertise.set(framework, kind, weight);
        self
    }

    pub fn with_normalization(mut self, method: impl Into<String>, table: Normalization) -> Self {
        self.scoring.normalization.insert(method.into(), table);
        self
    }

    pub fn with_method_weight(mut self, method: impl Into<String>, weight: f64) -> Self {
        self.scoring.method_weights.insert(method.into(), weight);
        self
    }

    pub fn with_min_criticality(mut self, criticality: Criticality) -> Self {
        self.gaps.min_criticality = criticality;
        self
    }
}

/// Settings of the entity resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum resolution score (0–1) for a candidate to be accepted as a match.
    pub acceptance_threshold: f64,
    pub name_weight: f64,
    pub category_weight: f64,
    pub property_weight: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            name_weight: 0.6,
            category_weight: 0.25,
            property_weight: 0.15,
        }
    }
}

impl ResolverConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return Err(Error::Configuration(format!(
                "acceptance threshold must be within [0, 1], got {}",
                self.acceptance_threshold
            )));
        }
        let weights = [self.name_weight, self.category_weight, self.property_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Configuration(
                "similarity weights must be non-negative".to_string(),
            ));
        }
        if self.name_weight <= 0.0 {
            return Err(Error::Configuration(
                "name similarity weight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Similarity weights normalized to sum to one: (name, category, properties).
    pub fn normalized_weights(&self) -> (f64, f64, f64) {
        let total = self.name_weight + self.category_weight + self.property_weight;
        (
            self.name_weight / total,
            self.category_weight / total,
            self.property_weight / total,
        )
    }
}

/// Settings of the conflict detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Relative difference `(max - min) / max` above which numeric judgements conflict.
    pub tolerance: f64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self { tolerance: 0.25 }
    }
}

/// Per-framework expertise weights, by record kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpertiseWeights {
    pub version: u32,
    pub weights: BTreeMap<FrameworkTag, BTreeMap<RecordKind, f64>>,
    /// Weight used for frameworks or kinds missing from the table. `None` makes gaps fatal.
    pub fallback: Option<f64>,
}

impl Default for ExpertiseWeights {
    fn default() -> Self {
        let mut table = Self {
            version: 1,
            weights: BTreeMap::new(),
            fallback: None,
        };
        // threat enumeration / mitigation inventory / business impact
        for (framework, threat, control, risk) in [
            ("stride", 0.9, 0.6, 0.5),
            ("linddun", 0.8, 0.6, 0.5),
            ("octave", 0.5, 0.8, 0.9),
            ("dread", 0.6, 0.4, 0.8),
            ("generic", 0.3, 0.3, 0.3),
        ] {
            table.set(framework, RecordKind::Threat, threat);
            table.set(framework, RecordKind::Control, control);
            table.set(framework, RecordKind::Risk, risk);
        }
        table
    }
}

impl ExpertiseWeights {
    /// An empty table with no fallback.
    pub fn empty() -> Self {
        Self {
            version: 1,
            weights: BTreeMap::new(),
            fallback: None,
        }
    }

    /// Sets the weight of a framework for a record kind.
    pub fn set(&mut self, framework: impl Into<FrameworkTag>, kind: RecordKind, weight: f64) {
        self.weights
            .entry(framework.into())
            .or_default()
            .insert(kind, weight);
    }

    /// Looks up a weight, falling back to `fallback` when configured.
    pub fn weight(&self, framework: &FrameworkTag, kind: RecordKind) -> Option<f64> {
        self.weights
            .get(framework)
            .and_then(|kinds| kinds.get(&kind))
            .copied()
            .or(self.fallback)
    }

    /// Like [`ExpertiseWeights::weight`], but a missing weight is a configuration error.
    pub fn require(&self, framework: &FrameworkTag, kind: RecordKind) -> Result<f64> {
        self.weight(framework, kind).ok_or_else(|| {
            Error::Configuration(format!(
                "no expertise weight for framework '{}' and {} records",
                framework,
                kind.as_str()
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        let values = self
            .weights
            .values()
            .flat_map(|kinds| kinds.values())
            .chain(self.fallback.iter());
        for w in values {
            if !w.is_finite() || *w < 0.0 {
                return Err(Error::Configuration(format!(
                    "expertise weights must be non-negative, got {}",
                    w
                )));
            }
        }
        Ok(())
    }
}

/// Settings of the unified risk scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Normalization table per scoring method.
    pub normalization: BTreeMap<String, Normalization>,
    /// Combination weight per method; methods not listed weigh 1.0.
    pub method_weights: BTreeMap<String, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let mut normalization = BTreeMap::new();
        normalization.insert(
            "impact_likelihood".to_string(),
            Normalization::Linear { min: 1.0, max: 25.0 },
        );
        normalization.insert(
            "dread".to_string(),
            Normalization::Linear { min: 0.0, max: 50.0 },
        );
        normalization.insert("cvss".to_string(), Normalization::Cvss);
        normalization.insert(
            "percent".to_string(),
            Normalization::Linear {
                min: 0.0,
                max: 100.0,
            },
        );
        let entries = [
            ("info", 5.0),
            ("low", 25.0),
            ("medium", 50.0),
            ("high", 75.0),
            ("critical", 100.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        normalization.insert("qualitative".to_string(), Normalization::Table { entries });

        Self {
            normalization,
            method_weights: BTreeMap::new(),
        }
    }
}

impl ScoringConfig {
    /// Combination weight of a method.
    pub fn method_weight(&self, method: &str) -> f64 {
        self.method_weights.get(method).copied().unwrap_or(1.0)
    }

    /// Looks up a method's normalization, failing when the method is unconfigured.
    pub fn require(&self, method: &str) -> Result<&Normalization> {
        self.normalization.get(method).ok_or_else(|| {
            Error::Configuration(format!(
                "no normalization table for scoring method '{}'",
                method
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        for (method, table) in &self.normalization {
            table.validate().map_err(|reason| {
                Error::Configuration(format!("normalization for '{}': {}", method, reason))
            })?;
        }
        for (method, w) in &self.method_weights {
            if !w.is_finite() || *w < 0.0 {
                return Err(Error::Configuration(format!(
                    "method weight for '{}' must be non-negative",
                    method
                )));
            }
        }
        Ok(())
    }
}

/// Weights applied per gap rule in the severity lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleWeights {
    pub framework_coverage: f64,
    pub entity_coverage: f64,
    pub control_coverage: f64,
    pub compliance: f64,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            framework_coverage: 1.0,
            entity_coverage: 1.0,
            control_coverage: 0.75,
            compliance: 1.0,
        }
    }
}

/// Two coverage domains expected to appear together when sensitive data is involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplementaryPair {
    pub primary: CoverageDomain,
    pub complement: CoverageDomain,
    /// Data categories that make the missing side relevant.
    pub relevant_data: BTreeSet<String>,
}

impl ComplementaryPair {
    pub fn new(primary: CoverageDomain, complement: CoverageDomain, relevant: &[&str]) -> Self {
        Self {
            primary,
            complement,
            relevant_data: relevant.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Settings of the gap detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Entities at or above this criticality need at least one threat record.
    pub min_criticality: Criticality,
    pub rule_weights: RuleWeights,
    pub complementary_pairs: Vec<ComplementaryPair>,
    /// Regulated data category → required control category.
    pub required_controls: BTreeMap<String, String>,
    /// Controls below this effectiveness are a single point of failure when alone.
    pub low_effectiveness: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        let required_controls = [
            ("pii", "data-protection"),
            ("phi", "access-control"),
            ("pci", "encryption"),
            ("credentials", "secrets-management"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            min_criticality: Criticality::High,
            rule_weights: RuleWeights::default(),
            complementary_pairs: vec![
                ComplementaryPair::new(
                    CoverageDomain::Technical,
                    CoverageDomain::Privacy,
                    &["pii", "phi", "personal", "biometric"],
                ),
                ComplementaryPair::new(
                    CoverageDomain::Technical,
                    CoverageDomain::Business,
                    &["pci", "financial"],
                ),
            ],
            required_controls,
            low_effectiveness: 0.4,
        }
    }
}

impl GapConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.low_effectiveness) {
            return Err(Error::Configuration(format!(
                "low effectiveness threshold must be within [0, 1], got {}",
                self.low_effectiveness
            )));
        }
        let w = &self.rule_weights;
        for weight in [
            w.framework_coverage,
            w.entity_coverage,
            w.control_coverage,
            w.compliance,
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Configuration(
                    "gap rule weights must be non-negative".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SynthesisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.acceptance_threshold, 0.6);
        assert_eq!(config.conflicts.tolerance, 0.25);
        assert_eq!(config.gaps.min_criticality, Criticality::High);
    }

    #[test]
    fn test_json_round_trip_keeps_tables() {
        let config = SynthesisConfig::default().with_version(7);
        let json = config.to_json().unwrap();
        let parsed = SynthesisConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SynthesisConfig::from_json(r#"{"version": 3, "conflicts": {"tolerance": 0.5}}"#)
                .unwrap();
        assert_eq!(config.version, 3);
        assert_eq!(config.conflicts.tolerance, 0.5);
        assert_eq!(config.resolver, ResolverConfig::default());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = SynthesisConfig::default().with_acceptance_threshold(1.5);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_linear_table_rejected() {
        let config = SynthesisConfig::default()
            .with_normalization("broken", Normalization::Linear { min: 5.0, max: 5.0 });
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_expertise_lookup_and_fallback() {
        let mut weights = ExpertiseWeights::empty();
        weights.set("pasta", RecordKind::Risk, 0.7);

        let pasta = FrameworkTag::new("pasta");
        assert_eq!(weights.weight(&pasta, RecordKind::Risk), Some(0.7));
        assert!(weights.require(&pasta, RecordKind::Threat).is_err());

        weights.fallback = Some(0.2);
        assert_eq!(weights.weight(&pasta, RecordKind::Threat), Some(0.2));
    }

    #[test]
    fn test_normalized_resolver_weights() {
        let resolver = ResolverConfig {
            name_weight: 2.0,
            category_weight: 1.0,
            property_weight: 1.0,
            ..Default::default()
        };
        let (n, c, p) = resolver.normalized_weights();
        assert!((n - 0.5).abs() < 1e-12);
        assert!((c + p - 0.5).abs() < 1e-12);
    }
}
