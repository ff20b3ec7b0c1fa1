//! Gap Detector - finds what no source covered
//!
//! Gaps are produced by a set of independent [`GapRule`]s evaluated against a
//! shared [`GapContext`]. Each rule names the rule that fired and a rationale,
//! and every gap references the entity mappings (or, for entities no source
//! mentions, the canonical entity) it is about.
//!
//! # Severity
//!
//! Severity is a lookup over the criticality rank of the implicated entities
//! (low = 1 … critical = 4) multiplied by the rule's configured weight:
//!
//! | rank × weight | severity |
//! |---------------|----------|
//! | ≥ 3.5 | critical |
//! | ≥ 2.5 | high |
//! | ≥ 1.5 | medium |
//! | otherwise | low |

pub mod builtin;

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

pub use builtin::BuiltinGapRules;

use crate::config::GapConfig;
use crate::index::SynthesisIndex;
use crate::model::{
    CoverageDomain, Criticality, EntityId, MappingId, RecordRef, Severity, SystemModel,
};
use crate::resolver::{ElementRef, ResolvedAnalysis};

/// The category of a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// A complementary analysis is missing while sensitive data is involved.
    FrameworkCoverage,
    /// A critical entity has no threat records at all.
    EntityCoverage,
    /// A present threat has no control, or only one weak control.
    ControlCoverage,
    /// Regulated data is handled without the required kind of control.
    Compliance,
}

/// A derived finding that some part of the system is not covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    /// Content hash of the gap, stable across runs.
    pub id: String,
    pub kind: GapKind,
    /// Id of the rule that fired.
    pub rule: String,
    pub severity: Severity,
    pub entities: Vec<EntityId>,
    pub mappings: Vec<MappingId>,
    pub records: Vec<RecordRef>,
    pub rationale: String,
}

impl Gap {
    /// Creates a gap. The id is assigned by the detector.
    pub fn new(
        rule: impl Into<String>,
        kind: GapKind,
        severity: Severity,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            kind,
            rule: rule.into(),
            severity,
            entities: Vec::new(),
            mappings: Vec::new(),
            records: Vec::new(),
            rationale: rationale.into(),
        }
    }

    pub fn with_entities(mut self, entities: impl IntoIterator<Item = EntityId>) -> Self {
        self.entities = entities.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        self
    }

    pub fn with_mappings(mut self, mappings: impl IntoIterator<Item = MappingId>) -> Self {
        self.mappings = mappings.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        self
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item = RecordRef>) -> Self {
        self.records = records.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        self
    }

    fn content_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.rule.as_bytes());
        for part in self.entities.iter().chain(self.mappings.iter()) {
            hasher.update(b"|");
            hasher.update(part.as_bytes());
        }
        for record in &self.records {
            hasher.update(b"|");
            hasher.update(record.to_string().as_bytes());
        }
        hasher.update(b"|");
        hasher.update(self.rationale.as_bytes());
        format!("gap-{}", &hex::encode(hasher.finalize().as_bytes())[..16])
    }
}

/// Looks up gap severity from a criticality and a rule weight.
pub fn gap_severity(criticality: Criticality, weight: f64) -> Severity {
    let product = criticality.rank() as f64 * weight;
    if product >= 3.5 {
        Severity::Critical
    } else if product >= 2.5 {
        Severity::High
    } else if product >= 1.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Everything a gap rule may look at.
pub struct GapContext<'a> {
    pub resolved: &'a [ResolvedAnalysis<'a>],
    pub index: &'a SynthesisIndex<'a>,
    pub model: &'a SystemModel,
    pub config: &'a GapConfig,
    /// Union of the coverage domains of all analyses.
    pub coverage: BTreeSet<CoverageDomain>,
}

impl<'a> GapContext<'a> {
    pub fn new(
        resolved: &'a [ResolvedAnalysis<'a>],
        index: &'a SynthesisIndex<'a>,
        model: &'a SystemModel,
        config: &'a GapConfig,
    ) -> Self {
        let coverage = resolved
            .iter()
            .flat_map(|ra| ra.analysis.coverage.iter().copied())
            .collect();
        Self {
            resolved,
            index,
            model,
            config,
            coverage,
        }
    }

    /// Criticality of an element. Unresolved and unscoped elements count as medium.
    pub fn criticality_of(&self, element: &ElementRef) -> Criticality {
        match element {
            ElementRef::Entity { id } => self
                .model
                .get(id)
                .map(|e| e.criticality)
                .unwrap_or(Criticality::Medium),
            ElementRef::Unresolved { .. } | ElementRef::Unscoped { .. } => Criticality::Medium,
            ElementRef::Flow { from, to } => {
                self.criticality_of(from).max(self.criticality_of(to))
            }
        }
    }

    /// Canonical entities that at least one mapping resolved to, with those mapping ids.
    pub fn resolved_entities(&self) -> BTreeMap<EntityId, Vec<MappingId>> {
        let mut entities: BTreeMap<EntityId, Vec<MappingId>> = BTreeMap::new();
        for ra in self.resolved {
            for m in &ra.mappings {
                if let Some(id) = &m.canonical_id {
                    entities.entry(id.clone()).or_default().push(m.id.clone());
                }
            }
        }
        entities
    }

    /// Data categories of an entity, as declared by the model and by any resolved source.
    pub fn data_categories_of(&self, entity_id: &str) -> BTreeSet<String> {
        let mut categories: BTreeSet<String> = self
            .model
            .get(entity_id)
            .map(|e| e.data_categories.clone())
            .unwrap_or_default();
        for ra in self.resolved {
            for m in &ra.mappings {
                if m.canonical_id.as_deref() == Some(entity_id) {
                    categories.extend(m.data_categories.iter().map(|c| c.to_ascii_lowercase()));
                }
            }
        }
        categories
    }
}

/// A single gap heuristic.
pub trait GapRule: Send + Sync {
    /// Stable identifier of the rule, recorded on every gap it produces.
    fn id(&self) -> &str;

    fn kind(&self) -> GapKind;

    /// Evaluates the rule.
    fn evaluate(&self, ctx: &GapContext<'_>) -> Vec<Gap>;
}

/// Runs a set of gap rules.
pub struct GapDetector {
    config: GapConfig,
    rules: Vec<Box<dyn GapRule>>,
}

impl std::fmt::Debug for GapDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapDetector")
            .field("config", &self.config)
            .field("rules", &self.rule_ids())
            .finish()
    }
}

impl GapDetector {
    /// Creates a detector running the built-in rules.
    pub fn new(config: GapConfig) -> Self {
        Self::with_rules(config, BuiltinGapRules::all())
    }

    /// Creates a detector running the given rules.
    pub fn with_rules(config: GapConfig, rules: Vec<Box<dyn GapRule>>) -> Self {
        Self { config, rules }
    }

    pub fn add_rule(&mut self, rule: Box<dyn GapRule>) {
        self.rules.push(rule);
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Detects gaps across resolved analyses.
    pub fn detect(&self, resolved: &[ResolvedAnalysis<'_>], model: &SystemModel) -> Vec<Gap> {
        let index = SynthesisIndex::build(resolved);
        self.detect_indexed(resolved, &index, model)
    }

    pub(crate) fn detect_indexed(
        &self,
        resolved: &[ResolvedAnalysis<'_>],
        index: &SynthesisIndex<'_>,
        model: &SystemModel,
    ) -> Vec<Gap> {
        let ctx = GapContext::new(resolved, index, model, &self.config);
        let mut gaps: BTreeMap<String, Gap> = BTreeMap::new();
        for rule in &self.rules {
            let found = rule.evaluate(&ctx);
            debug!("Gap rule {} produced {} gaps", rule.id(), found.len());
            for mut gap in found {
                gap.id = gap.content_id();
                gaps.entry(gap.id.clone()).or_insert(gap);
            }
        }
        let mut gaps: Vec<Gap> = gaps.into_values().collect();
        gaps.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.kind.cmp(&b.kind))
                .then_with(|| a.id.cmp(&b.id))
        });
        gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_lookup() {
        assert_eq!(gap_severity(Criticality::Critical, 1.0), Severity::Critical);
        assert_eq!(gap_severity(Criticality::Critical, 0.75), Severity::High);
        assert_eq!(gap_severity(Criticality::High, 1.0), Severity::High);
        assert_eq!(gap_severity(Criticality::Medium, 1.0), Severity::Medium);
        assert_eq!(gap_severity(Criticality::Low, 1.0), Severity::Low);
        assert_eq!(gap_severity(Criticality::Medium, 0.5), Severity::Low);
    }

    #[test]
    fn test_gap_ids_are_content_hashes() {
        let a = Gap::new("rule", GapKind::EntityCoverage, Severity::High, "why")
            .with_entities(vec!["e1".to_string()]);
        let b = Gap::new("rule", GapKind::EntityCoverage, Severity::High, "why")
            .with_entities(vec!["e1".to_string()]);
        let c = Gap::new("rule", GapKind::EntityCoverage, Severity::High, "why")
            .with_entities(vec!["e2".to_string()]);
        assert_eq!(a.content_id(), b.content_id());
        assert_ne!(a.content_id(), c.content_id());
    }

    #[test]
    fn test_builders_sort_and_dedup() {
        let gap = Gap::new("rule", GapKind::Compliance, Severity::Low, "why")
            .with_mappings(vec!["b/x".to_string(), "a/x".to_string(), "b/x".to_string()]);
        assert_eq!(gap.mappings, vec!["a/x".to_string(), "b/x".to_string()]);
    }

    struct AlwaysFires;

    impl GapRule for AlwaysFires {
        fn id(&self) -> &str {
            "always"
        }

        fn kind(&self) -> GapKind {
            GapKind::EntityCoverage
        }

        fn evaluate(&self, _ctx: &GapContext<'_>) -> Vec<Gap> {
            vec![
                Gap::new(self.id(), self.kind(), Severity::Low, "same"),
                Gap::new(self.id(), self.kind(), Severity::Low, "same"),
            ]
        }
    }

    #[test]
    fn test_custom_rule_output_is_deduplicated() {
        let detector = GapDetector::with_rules(GapConfig::default(), vec![Box::new(AlwaysFires)]);
        let gaps = detector.detect(&[], &SystemModel::default());
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].rule, "always");
        assert!(gaps[0].id.starts_with("gap-"));
    }
}
