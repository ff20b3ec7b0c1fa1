//! Synthesis Orchestrator
//!
//! Sequences one run: import (with per-source failure isolation), entity
//! resolution, gap detection, conflict resolution and unified scoring, then
//! computes the two roll-ups.
//!
//! ```text
//!  RawSource ──► AdapterRegistry ──► StandardizedAnalysis ─┐
//!      │ (malformed / unrecognized)                        │
//!      ▼                                                   ▼
//!  skipped_sources                                  EntityResolver
//!                                                          │
//!                                                   SynthesisIndex
//!                                          ┌───────────────┼───────────────┐
//!                                          ▼               ▼               ▼
//!                                     GapDetector  ConflictResolver ─► UnifiedRiskScorer
//!                                          └───────────────┼───────────────┘
//!                                                          ▼
//!                                                   SynthesisResult
//! ```
//!
//! A run is a pure function of its inputs and the [`SynthesisConfig`]: the
//! System Model is never mutated and repeated runs serialize byte-identically.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::adapter::AdapterRegistry;
use crate::config::SynthesisConfig;
use crate::conflict::{Conflict, ConflictAttribute, ConflictResolver};
use crate::error::{Error, ErrorKind, Result};
use crate::gap::{Gap, GapDetector};
use crate::index::SynthesisIndex;
use crate::model::{
    CoverageDomain, EntityMapping, FormatTag, FrameworkTag, MappingId, RawSource, RecordKind,
    RecordRef, RecordTarget, Severity, SourceId, StandardizedAnalysis, SystemModel, ThreatStatus,
};
use crate::provider::SystemModelProvider;
use crate::resolver::{
    ElementRef, EntityProposal, EntityResolver, ResolutionCollision, ResolvedAnalysis,
};
use crate::scoring::{UnifiedRiskScorer, UnifiedScore};

/// A source excluded from the run, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub source_id: SourceId,
    pub kind: ErrorKind,
    pub message: String,
    /// Offending field for malformed sources.
    #[serde(default)]
    pub field_path: Option<String>,
}

impl SkippedSource {
    fn new(source_id: &str, error: &Error) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind: error.kind(),
            message: error.to_string(),
            field_path: error.field_path().map(str::to_string),
        }
    }
}

/// Per-source statistics of an included analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source_id: SourceId,
    pub format: FormatTag,
    pub framework: FrameworkTag,
    pub source_confidence: f64,
    pub coverage: BTreeSet<CoverageDomain>,
    pub entities: usize,
    pub resolved_entities: usize,
    pub threats: usize,
    pub controls: usize,
    pub risks: usize,
}

/// A relationship placed between resolved elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRelationship {
    /// `<source>/<key>`.
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub element: ElementRef,
}

/// Every report of one threat on one element, merged across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedThreat {
    /// `<element key>#<merge key>`.
    pub key: String,
    pub element: ElementRef,
    pub name: String,
    pub members: Vec<RecordRef>,
    pub mappings: Vec<MappingId>,
    pub status: ThreatStatus,
    pub severity: Severity,
    pub frameworks: BTreeSet<FrameworkTag>,
    /// Ids of the conflicts raised about this threat.
    pub conflicts: Vec<String>,
}

/// The output of one synthesis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub config_version: u32,
    pub sources: Vec<SourceSummary>,
    pub skipped_sources: Vec<SkippedSource>,
    pub entity_mappings: Vec<EntityMapping>,
    pub relationship_mappings: Vec<ResolvedRelationship>,
    pub collisions: Vec<ResolutionCollision>,
    pub proposals: Vec<EntityProposal>,
    pub threats: Vec<MergedThreat>,
    pub gaps: Vec<Gap>,
    pub conflicts: Vec<Conflict>,
    pub risk_scores: BTreeMap<String, UnifiedScore>,
    /// Criticality-weighted fraction of System Model entities with a threat record.
    pub completeness: f64,
    /// Mean confidence over entity mappings and conflict resolutions.
    pub confidence: f64,
}

impl SynthesisResult {
    /// Serializes the result to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Looks up a merged threat by key.
    pub fn threat(&self, key: &str) -> Option<&MergedThreat> {
        self.threats.iter().find(|t| t.key == key)
    }

    /// Looks up an entity mapping by id.
    pub fn mapping(&self, id: &str) -> Option<&EntityMapping> {
        self.entity_mappings.iter().find(|m| m.id == id)
    }
}

/// Runs synthesis with a fixed configuration.
#[derive(Debug)]
pub struct Synthesizer {
    config: SynthesisConfig,
    registry: AdapterRegistry,
    resolver: EntityResolver,
    gaps: GapDetector,
    conflicts: ConflictResolver,
    scorer: UnifiedRiskScorer,
}

impl Synthesizer {
    /// Creates a synthesizer with the built-in adapters and gap rules.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if the configuration does not validate.
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: AdapterRegistry::with_builtin_adapters(),
            resolver: EntityResolver::new(config.resolver.clone()),
            gaps: GapDetector::new(config.gaps.clone()),
            conflicts: ConflictResolver::new(&config),
            scorer: UnifiedRiskScorer::new(config.scoring.clone()),
            config,
        })
    }

    /// Replaces the adapter registry.
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the entity resolver, e.g. to swap the similarity strategy.
    pub fn with_resolver(mut self, resolver: EntityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replaces the gap detector, e.g. to add custom rules.
    pub fn with_gap_detector(mut self, detector: GapDetector) -> Self {
        self.gaps = detector;
        self
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AdapterRegistry {
        &mut self.registry
    }

    /// Imports raw sources and synthesizes them.
    ///
    /// Sources that fail to import are recorded in
    /// [`SynthesisResult::skipped_sources`]; the rest proceed.
    ///
    /// # Errors
    ///
    /// Only [`Error::Configuration`]; per-source failures never abort the run.
    pub fn synthesize(&self, raws: &[RawSource], model: &SystemModel) -> Result<SynthesisResult> {
        info!("Starting synthesis of {} raw sources", raws.len());
        let mut analyses = Vec::with_capacity(raws.len());
        let mut skipped = Vec::new();
        for (raw, imported) in raws.iter().zip(self.registry.import_all(raws)) {
            match imported {
                Ok(analysis) => analyses.push(analysis),
                Err(e) => {
                    warn!("Skipping source {}: {}", raw.id, e);
                    skipped.push(SkippedSource::new(&raw.id, &e));
                }
            }
        }
        skipped.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let mut result = self.synthesize_analyses(&analyses, model)?;
        result.skipped_sources = skipped;
        Ok(result)
    }

    /// Reads the model from a provider, synthesizes, and submits any proposals back.
    pub fn synthesize_from_provider(
        &self,
        raws: &[RawSource],
        provider: &dyn SystemModelProvider,
    ) -> Result<SynthesisResult> {
        let model = provider.system_model()?;
        let result = self.synthesize(raws, &model)?;
        if !result.proposals.is_empty() {
            provider.submit_proposals(&result.proposals)?;
        }
        Ok(result)
    }

    /// Synthesizes already-standardized analyses.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when an analysis uses a framework without an
    /// expertise weight for one of its record kinds, or a scoring method
    /// without a normalization table.
    pub fn synthesize_analyses(
        &self,
        analyses: &[StandardizedAnalysis],
        model: &SystemModel,
    ) -> Result<SynthesisResult> {
        self.check_configuration(analyses)?;

        let outcome = self.resolver.resolve_all(analyses, model);
        debug!(
            "Resolved {} analyses with {} collisions and {} proposals",
            outcome.analyses.len(),
            outcome.collisions.len(),
            outcome.proposals.len()
        );
        let resolved = &outcome.analyses;
        let index = SynthesisIndex::build(resolved);

        let gaps = self.gaps.detect_indexed(resolved, &index, model);
        let conflicts = self.conflicts.find_conflicts_indexed(&index)?;
        let risk_scores = self.scorer.score_indexed(&index, &conflicts)?;
        let threats = merge_threats(&index, &conflicts);

        let entity_mappings: Vec<EntityMapping> =
            resolved.iter().flat_map(|ra| ra.mappings.iter().cloned()).collect();
        let completeness = completeness(&index, model);
        let confidence = mean(
            entity_mappings
                .iter()
                .map(|m| m.confidence)
                .chain(conflicts.iter().map(|c| c.resolution.confidence)),
        );

        let result = SynthesisResult {
            config_version: self.config.version,
            sources: resolved.iter().map(summarize).collect(),
            skipped_sources: Vec::new(),
            relationship_mappings: resolved.iter().flat_map(resolve_relationships).collect(),
            entity_mappings,
            collisions: outcome.collisions.clone(),
            proposals: outcome.proposals.clone(),
            threats,
            gaps,
            conflicts,
            risk_scores,
            completeness,
            confidence,
        };
        info!(
            "Synthesis {} sources, {} threats, {} gaps, {} conflicts, {} risks, completeness {:.3}",
            result.sources.len(),
            result.threats.len(),
            result.gaps.len(),
            result.conflicts.len(),
            result.risk_scores.len(),
            result.completeness
        );
        Ok(result)
    }

    /// Fails before any work when the data needs weights or tables the config lacks.
    fn check_configuration(&self, analyses: &[StandardizedAnalysis]) -> Result<()> {
        for analysis in analyses {
            for kind in analysis.record_kinds() {
                self.config.expertise.require(&analysis.framework, kind)?;
            }
            for risk in &analysis.risks {
                for score in &risk.scores {
                    self.config.scoring.require(&score.method)?;
                }
            }
        }
        debug!("Configuration covers {} analyses", analyses.len());
        Ok(())
    }
}

fn summarize(ra: &ResolvedAnalysis<'_>) -> SourceSummary {
    let a = ra.analysis;
    SourceSummary {
        source_id: a.source_id.clone(),
        format: a.format.clone(),
        framework: a.framework.clone(),
        source_confidence: a.source_confidence,
        coverage: a.coverage.clone(),
        entities: a.entities.len(),
        resolved_entities: ra.mappings.iter().filter(|m| m.is_resolved()).count(),
        threats: a.threats.len(),
        controls: a.controls.len(),
        risks: a.risks.len(),
    }
}

fn resolve_relationships(ra: &ResolvedAnalysis<'_>) -> Vec<ResolvedRelationship> {
    ra.analysis
        .relationships
        .iter()
        .map(|rel| ResolvedRelationship {
            id: crate::model::mapping_id(ra.source_id(), &rel.key),
            label: rel.label.clone(),
            element: ra.element_of_target(&RecordTarget::Relationship(rel.key.clone())),
        })
        .collect()
}

/// One merged threat per threat group; every input threat lands in exactly one.
fn merge_threats(index: &SynthesisIndex<'_>, conflicts: &[Conflict]) -> Vec<MergedThreat> {
    index
        .threat_groups
        .values()
        .map(|group| {
            let key = format!("{}#{}", group.element.key(), group.merge_key);
            let related: Vec<&Conflict> = conflicts
                .iter()
                .filter(|c| c.kind == RecordKind::Threat && c.subject == key)
                .collect();
            let members: Vec<_> = group.members.iter().map(|&i| &index.threats[i]).collect();

            let status = match related
                .iter()
                .find(|c| c.attribute == ConflictAttribute::Existence)
                .and_then(|c| c.resolution.label.as_deref())
            {
                Some(label) if label == "absent" => ThreatStatus::Absent,
                Some(_) => ThreatStatus::Present,
                None if index.group_present(group) => ThreatStatus::Present,
                None => ThreatStatus::Absent,
            };

            let severity = related
                .iter()
                .find(|c| c.attribute == ConflictAttribute::Severity)
                .and_then(|c| c.resolution.value)
                .map(Severity::from_score)
                .unwrap_or_else(|| {
                    let present = members
                        .iter()
                        .filter(|t| t.record.status == ThreatStatus::Present)
                        .map(|t| t.record.severity)
                        .max();
                    present
                        .or_else(|| members.iter().map(|t| t.record.severity).max())
                        .unwrap_or(Severity::Medium)
                });

            MergedThreat {
                element: group.element.clone(),
                name: members
                    .first()
                    .map(|t| t.record.name.clone())
                    .unwrap_or_else(|| group.merge_key.clone()),
                members: members.iter().map(|t| t.record_ref.clone()).collect(),
                mappings: index.group_mappings(group),
                status,
                severity,
                frameworks: members.iter().map(|t| t.framework.clone()).collect(),
                conflicts: related.iter().map(|c| c.id.clone()).collect(),
                key,
            }
        })
        .collect()
}

/// Criticality-weighted fraction of System Model entities with at least one threat record.
///
/// 1.0 for an empty model. Threats on flows count for both endpoints.
pub fn completeness(index: &SynthesisIndex<'_>, model: &SystemModel) -> f64 {
    if model.is_empty() {
        return 1.0;
    }
    let reported: BTreeSet<&str> = index
        .threats
        .iter()
        .flat_map(|entry| entry.element.entity_ids())
        .collect();

    let mut covered = 0.0;
    let mut total = 0.0;
    for entity in &model.entities {
        let weight = f64::from(entity.criticality.rank());
        if reported.contains(entity.id.as_str()) {
            covered += weight;
        }
        total += weight;
    }
    (covered / total).clamp(0.0, 1.0)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Criticality, EntityCategory, SystemEntity};
    use serde_json::json;

    fn model() -> SystemModel {
        SystemModel::new(vec![
            SystemEntity::new("ent-auth", "Authentication Service", EntityCategory::Software)
                .with_criticality(Criticality::High),
            SystemEntity::new("ent-db", "Customer Database", EntityCategory::Software)
                .with_criticality(Criticality::Low),
        ])
    }

    fn catalog(framework: &str, threats: serde_json::Value) -> serde_json::Value {
        json!({
            "format": "dfd-threat-catalog",
            "framework": framework,
            "elements": [
                {"id": "p1", "name": "Authentication Service", "type": "process"},
                {"id": "d1", "name": "Customer Database", "type": "process"}
            ],
            "threats": threats
        })
    }

    #[test]
    fn test_empty_run() {
        let synthesizer = Synthesizer::new(SynthesisConfig::default()).unwrap();
        let result = synthesizer.synthesize(&[], &SystemModel::default()).unwrap();
        assert_eq!(result.completeness, 1.0);
        assert_eq!(result.confidence, 0.0);
        assert!(result.gaps.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_completeness_weighting() {
        let synthesizer = Synthesizer::new(SynthesisConfig::default()).unwrap();
        let raw = RawSource::new(
            "a",
            catalog("stride", json!([{"id": "t1", "target": "p1", "title": "Spoofing"}])),
        );
        let result = synthesizer.synthesize(&[raw], &model()).unwrap();
        // high (3) covered, low (1) not
        assert!((result.completeness - 0.75).abs() < 1e-9);

        let raw = RawSource::new(
            "a",
            catalog(
                "stride",
                json!([
                    {"id": "t1", "target": "p1", "title": "Spoofing"},
                    {"id": "t2", "target": "d1", "title": "Tampering"}
                ]),
            ),
        );
        let result = synthesizer.synthesize(&[raw], &model()).unwrap();
        assert_eq!(result.completeness, 1.0);
    }

    #[test]
    fn test_missing_weight_is_fatal() {
        let synthesizer = Synthesizer::new(SynthesisConfig::default()).unwrap();
        let raw = RawSource::new(
            "a",
            catalog("trike", json!([{"id": "t1", "target": "p1", "title": "Spoofing"}])),
        );
        let err = synthesizer.synthesize(&[raw], &model()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SynthesisConfig::default().with_acceptance_threshold(1.5);
        assert!(Synthesizer::new(config).is_err());
    }

    #[test]
    fn test_merged_threat_status_and_severity() {
        let raws = vec![
            RawSource::new(
                "a",
                catalog(
                    "stride",
                    json!([{"id": "t1", "target": "p1", "title": "Token replay",
                            "severity": "high"}]),
                ),
            ),
            RawSource::new(
                "b",
                catalog(
                    "pasta",
                    json!([{"id": "x", "target": "p1", "title": "token  replay",
                            "severity": "high"}]),
                ),
            ),
        ];
        let config = SynthesisConfig::default()
            .with_expertise_weight("pasta", RecordKind::Threat, 0.6);
        let synthesizer = Synthesizer::new(config).unwrap();
        let result = synthesizer.synthesize(&raws, &model()).unwrap();

        let merged = result.threat("entity:ent-auth#token replay").unwrap();
        assert_eq!(merged.members.len(), 2);
        assert_eq!(merged.status, ThreatStatus::Present);
        assert_eq!(merged.severity, Severity::High);
        assert!(merged.conflicts.is_empty());
        assert_eq!(result.relationship_mappings.len(), 0);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(std::iter::empty()), 0.0);
        assert_eq!(mean([0.5, 1.0].into_iter()), 0.75);
    }
}
