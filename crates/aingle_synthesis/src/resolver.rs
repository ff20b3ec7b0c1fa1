//! Entity Resolver - maps source entities onto the canonical System Model
//!
//! Every source entity is scored against every System Model entity using a
//! weighted combination of:
//! - Name similarity (pluggable [`NameSimilarity`] strategy)
//! - Category compatibility
//! - Property overlap
//!
//! The best candidate at or above the acceptance threshold becomes the match.
//! Ties go to the entity with more inbound mappings so repeated runs settle on
//! the same match, then to the smallest entity id.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ResolverConfig;
use crate::model::{
    mapping_id, CandidateScore, EntityCategory, EntityId, EntityMapping, FrameworkTag, MappingId,
    MatchMethod, RecordTarget, StandardizedAnalysis, SystemEntity, SystemModel,
};
use crate::similarity::{normalize_name, EditDistanceSimilarity, NameSimilarity};

/// Scores closer than this are treated as tied.
const TIE_EPSILON: f64 = 1e-9;

/// Category score when the source did not state a category.
const UNKNOWN_CATEGORY_SCORE: f64 = 0.5;

/// The element a record is about, expressed in resolved terms.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementRef {
    /// A canonical System Model entity.
    Entity { id: EntityId },
    /// A source entity that did not resolve.
    Unresolved { mapping: MappingId },
    /// A relationship between two elements.
    Flow {
        from: Box<ElementRef>,
        to: Box<ElementRef>,
    },
    /// A record that names no entity, relationship or threat.
    ///
    /// `record` is the record's own `<source>#<record>` reference, not a mapping id.
    Unscoped { record: String },
}

impl ElementRef {
    /// Stable string key used for grouping.
    pub fn key(&self) -> String {
        match self {
            ElementRef::Entity { id } => format!("entity:{}", id),
            ElementRef::Unresolved { mapping } => format!("unresolved:{}", mapping),
            ElementRef::Flow { from, to } => format!("flow:{}->{}", from.key(), to.key()),
            ElementRef::Unscoped { record } => format!("record:{}", record),
        }
    }

    /// Canonical entity ids this element touches.
    pub fn entity_ids(&self) -> Vec<&str> {
        match self {
            ElementRef::Entity { id } => vec![id.as_str()],
            ElementRef::Unresolved { .. } | ElementRef::Unscoped { .. } => Vec::new(),
            ElementRef::Flow { from, to } => {
                let mut ids = from.entity_ids();
                ids.extend(to.entity_ids());
                ids
            }
        }
    }
}

/// A standardized analysis together with its resolved entity mappings.
#[derive(Debug, Clone)]
pub struct ResolvedAnalysis<'a> {
    pub analysis: &'a StandardizedAnalysis,
    /// Resolved copies of `analysis.entities`, in the same order.
    pub mappings: Vec<EntityMapping>,
}

impl<'a> ResolvedAnalysis<'a> {
    pub fn framework(&self) -> &FrameworkTag {
        &self.analysis.framework
    }

    pub fn source_id(&self) -> &str {
        &self.analysis.source_id
    }

    /// Looks up a resolved mapping by source-local key.
    pub fn mapping(&self, key: &str) -> Option<&EntityMapping> {
        self.mappings.iter().find(|m| m.key == key)
    }

    /// The element of a source entity key.
    pub fn element_of_entity(&self, key: &str) -> ElementRef {
        match self.mapping(key) {
            Some(EntityMapping {
                canonical_id: Some(id),
                ..
            }) => ElementRef::Entity { id: id.clone() },
            Some(m) => ElementRef::Unresolved {
                mapping: m.id.clone(),
            },
            None => ElementRef::Unresolved {
                mapping: mapping_id(self.source_id(), key),
            },
        }
    }

    /// The element a record target points at.
    pub fn element_of_target(&self, target: &RecordTarget) -> ElementRef {
        match target {
            RecordTarget::Entity(key) => self.element_of_entity(key),
            RecordTarget::Relationship(key) => match self.analysis.relationship(key) {
                Some(rel) => ElementRef::Flow {
                    from: Box::new(self.element_of_entity(&rel.from)),
                    to: Box::new(self.element_of_entity(&rel.to)),
                },
                None => ElementRef::Unresolved {
                    mapping: mapping_id(self.source_id(), key),
                },
            },
        }
    }

    /// Mapping ids implicated by a record target.
    pub fn mappings_of_target(&self, target: &RecordTarget) -> Vec<MappingId> {
        match target {
            RecordTarget::Entity(key) => vec![mapping_id(self.source_id(), key)],
            RecordTarget::Relationship(key) => match self.analysis.relationship(key) {
                Some(rel) => vec![
                    mapping_id(self.source_id(), &rel.from),
                    mapping_id(self.source_id(), &rel.to),
                ],
                None => Vec::new(),
            },
        }
    }
}

/// Per-component breakdown of a resolution score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub name: f64,
    pub category: f64,
    pub properties: f64,
    pub total: f64,
}

/// Two or more canonical entities tied for the best match of one source entity.
///
/// Never surfaced to callers: the stability-bias tie-break settles it.
#[derive(Debug)]
struct AmbiguousResolution<'m> {
    mapping: &'m str,
    candidates: Vec<&'m str>,
}

/// A many-to-one resolution collision across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionCollision {
    /// The normalized source name shared by the colliding mappings.
    pub normalized_name: String,
    /// The canonical entity the policy settled on.
    pub chosen: EntityId,
    /// Name of the policy applied.
    pub policy: String,
    pub claims: Vec<CollisionClaim>,
}

/// One mapping's claim inside a [`ResolutionCollision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionClaim {
    pub mapping: MappingId,
    /// The entity this mapping originally resolved to.
    pub claimed: EntityId,
    pub confidence: f64,
    pub source_confidence: f64,
    /// Whether the mapping was re-pointed to the chosen entity.
    pub repointed: bool,
}

/// A suggestion to add a canonical entity, derived from unresolved mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProposal {
    pub name: String,
    pub normalized_name: String,
    pub category: Option<EntityCategory>,
    pub mappings: Vec<MappingId>,
    /// The closest existing entity, below threshold.
    pub best_candidate: Option<CandidateScore>,
}

/// Output of resolving a whole batch of analyses.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome<'a> {
    /// Resolved analyses, ordered by (framework, source id).
    pub analyses: Vec<ResolvedAnalysis<'a>>,
    pub collisions: Vec<ResolutionCollision>,
    pub proposals: Vec<EntityProposal>,
}

/// Resolves source entities onto System Model entities.
pub struct EntityResolver {
    config: ResolverConfig,
    similarity: Box<dyn NameSimilarity>,
}

impl std::fmt::Debug for EntityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityResolver")
            .field("config", &self.config)
            .field("similarity", &self.similarity.name())
            .finish()
    }
}

impl EntityResolver {
    /// Creates a resolver using edit-distance name similarity.
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_similarity(config, Box::new(EditDistanceSimilarity))
    }

    /// Creates a resolver with a custom name similarity strategy.
    pub fn with_similarity(config: ResolverConfig, similarity: Box<dyn NameSimilarity>) -> Self {
        Self { config, similarity }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Scores a source entity against a canonical entity, with the component breakdown.
    ///
    /// A non-finite name similarity from a custom strategy scores as 0.
    pub fn score_components(
        &self,
        mapping: &EntityMapping,
        entity: &SystemEntity,
    ) -> ScoreBreakdown {
        let (wn, wc, wp) = self.config.normalized_weights();
        let raw = self.similarity.similarity(&mapping.source_name, &entity.name);
        let name = if raw.is_finite() {
            raw.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let category = match mapping.category {
            None => UNKNOWN_CATEGORY_SCORE,
            Some(c) if c == entity.category => 1.0,
            Some(_) => 0.0,
        };
        let properties = property_overlap(&mapping.properties, &entity.properties);
        ScoreBreakdown {
            name,
            category,
            properties,
            total: wn * name + wc * category + wp * properties,
        }
    }

    /// Scores a source entity against a canonical entity.
    pub fn score(&self, mapping: &EntityMapping, entity: &SystemEntity) -> f64 {
        self.score_components(mapping, entity).total
    }

    /// Resolves the entities of a single analysis.
    ///
    /// Tie-breaks use the model's prior mapping counts plus the matches made
    /// earlier in this same analysis.
    pub fn resolve(
        &self,
        analysis: &StandardizedAnalysis,
        model: &SystemModel,
    ) -> Vec<EntityMapping> {
        let mut ledger = model.prior_mappings.clone();
        self.resolve_with_ledger(analysis, model, &mut ledger)
    }

    fn resolve_with_ledger(
        &self,
        analysis: &StandardizedAnalysis,
        model: &SystemModel,
        ledger: &mut BTreeMap<EntityId, u32>,
    ) -> Vec<EntityMapping> {
        analysis
            .entities
            .iter()
            .map(|mapping| {
                let resolved = self.resolve_one(mapping, model, ledger);
                if let Some(id) = &resolved.canonical_id {
                    *ledger.entry(id.clone()).or_insert(0) += 1;
                }
                resolved
            })
            .collect()
    }

    fn resolve_one(
        &self,
        mapping: &EntityMapping,
        model: &SystemModel,
        ledger: &BTreeMap<EntityId, u32>,
    ) -> EntityMapping {
        let mut resolved = mapping.clone();
        resolved.canonical_id = None;
        resolved.confidence = 0.0;
        resolved.method = MatchMethod::Unresolved;
        resolved.best_candidate = None;

        let scored: Vec<(&SystemEntity, ScoreBreakdown)> = model
            .entities
            .iter()
            .map(|entity| {
                let breakdown = self.score_components(mapping, entity);
                trace!(
                    "Scored {} against {}: {:.4} (name {:.4}, category {:.2}, properties {:.2})",
                    mapping.id,
                    entity.id,
                    breakdown.total,
                    breakdown.name,
                    breakdown.category,
                    breakdown.properties
                );
                (entity, breakdown)
            })
            .collect();

        let best = match scored.iter().map(|(_, b)| b.total).reduce(f64::max) {
            Some(best) => best,
            None => return resolved,
        };

        let mut tied: Vec<&(&SystemEntity, ScoreBreakdown)> = scored
            .iter()
            .filter(|(_, b)| (best - b.total).abs() <= TIE_EPSILON)
            .collect();
        // stability bias, then smallest id
        tied.sort_by(|(a, _), (b, _)| {
            let inbound_a = ledger.get(&a.id).copied().unwrap_or(0);
            let inbound_b = ledger.get(&b.id).copied().unwrap_or(0);
            inbound_b.cmp(&inbound_a).then_with(|| a.id.cmp(&b.id))
        });

        if tied.len() > 1 && best >= self.config.acceptance_threshold {
            let ambiguity = AmbiguousResolution {
                mapping: &mapping.id,
                candidates: tied.iter().map(|(e, _)| e.id.as_str()).collect(),
            };
            debug!("Settled by stability bias: {:?}", ambiguity);
        }

        let Some(&&(entity, ref breakdown)) = tied.first() else {
            return resolved;
        };
        resolved.best_candidate = Some(CandidateScore {
            entity_id: entity.id.clone(),
            score: breakdown.total,
        });

        if breakdown.total >= self.config.acceptance_threshold {
            let exact = normalize_name(&mapping.source_name) == normalize_name(&entity.name)
                && mapping.category == Some(entity.category);
            resolved.canonical_id = Some(entity.id.clone());
            resolved.confidence = breakdown.total;
            resolved.method = if exact {
                MatchMethod::Exact
            } else {
                MatchMethod::Fuzzy
            };
            debug!(
                "Resolved {} ('{}') to {} with confidence {:.3}",
                mapping.id, mapping.source_name, entity.id, breakdown.total
            );
        } else {
            debug!(
                "Left {} ('{}') unresolved; best candidate {} scored {:.3}",
                mapping.id, mapping.source_name, entity.id, breakdown.total
            );
        }

        resolved
    }

    /// Resolves a batch of analyses, applies the collision policy and derives proposals.
    ///
    /// Analyses are processed in (framework, source id) order so the outcome
    /// does not depend on the order they were supplied in.
    pub fn resolve_all<'a>(
        &self,
        analyses: &'a [StandardizedAnalysis],
        model: &SystemModel,
    ) -> ResolutionOutcome<'a> {
        let mut ordered: Vec<&'a StandardizedAnalysis> = analyses.iter().collect();
        ordered.sort_by(|a, b| {
            a.framework
                .cmp(&b.framework)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let mut ledger = model.prior_mappings.clone();
        let mut resolved: Vec<ResolvedAnalysis<'a>> = ordered
            .into_iter()
            .map(|analysis| ResolvedAnalysis {
                analysis,
                mappings: self.resolve_with_ledger(analysis, model, &mut ledger),
            })
            .collect();

        let collisions = self.apply_collision_policy(&mut resolved, model);
        let proposals = derive_proposals(&resolved);

        ResolutionOutcome {
            analyses: resolved,
            collisions,
            proposals,
        }
    }

    /// Settles the same source name resolving to different entities in different sources.
    ///
    /// The claim from the most confident source wins; losing mappings are
    /// re-pointed only when they clear the threshold against the winner.
    fn apply_collision_policy(
        &self,
        resolved: &mut [ResolvedAnalysis<'_>],
        model: &SystemModel,
    ) -> Vec<ResolutionCollision> {
        // normalized name -> (analysis index, mapping index)
        let mut by_name: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();
        for (ai, ra) in resolved.iter().enumerate() {
            for (mi, m) in ra.mappings.iter().enumerate() {
                if m.canonical_id.is_some() {
                    by_name
                        .entry(normalize_name(&m.source_name))
                        .or_default()
                        .push((ai, mi));
                }
            }
        }

        let mut collisions = Vec::new();
        for (name, claims) in by_name {
            let candidates = claims
                .iter()
                .filter_map(|&(ai, mi)| resolved[ai].mappings[mi].canonical_id.as_deref())
                .collect::<BTreeSet<&str>>()
                .len();
            let sources = claims
                .iter()
                .map(|&(ai, _)| resolved[ai].source_id())
                .collect::<BTreeSet<&str>>()
                .len();
            if candidates < 2 || sources < 2 {
                continue;
            }

            let winner = claims
                .iter()
                .copied()
                .max_by(|&(a_ai, a_mi), &(b_ai, b_mi)| {
                    let a = &resolved[a_ai];
                    let b = &resolved[b_ai];
                    a.analysis
                        .source_confidence
                        .total_cmp(&b.analysis.source_confidence)
                        .then_with(|| {
                            a.mappings[a_mi]
                                .confidence
                                .total_cmp(&b.mappings[b_mi].confidence)
                        })
                        // smaller (framework, source) wins the final tie
                        .then_with(|| b.framework().cmp(a.framework()))
                        .then_with(|| b.source_id().cmp(a.source_id()))
                });
            let Some((w_ai, w_mi)) = winner else { continue };
            let chosen = match resolved[w_ai].mappings[w_mi].canonical_id.clone() {
                Some(id) => id,
                None => continue,
            };
            let Some(chosen_entity) = model.get(&chosen) else {
                continue;
            };

            let mut collision_claims = Vec::new();
            for &(ai, mi) in &claims {
                let source_confidence = resolved[ai].analysis.source_confidence;
                let mapping = &mut resolved[ai].mappings[mi];
                let claimed = mapping.canonical_id.clone().unwrap_or_default();
                let confidence = mapping.confidence;
                let mut repointed = false;
                if claimed != chosen {
                    let rescored = self.score(mapping, chosen_entity);
                    if rescored >= self.config.acceptance_threshold {
                        mapping.canonical_id = Some(chosen.clone());
                        mapping.confidence = rescored;
                        mapping.method = MatchMethod::CollisionPolicy;
                        repointed = true;
                    }
                }
                collision_claims.push(CollisionClaim {
                    mapping: mapping.id.clone(),
                    claimed,
                    confidence,
                    source_confidence,
                    repointed,
                });
            }

            warn!(
                "Resolution collision on '{}': {} candidates, settled on {} by source confidence",
                name,
                candidates,
                chosen
            );
            collision_claims.sort_by(|a, b| a.mapping.cmp(&b.mapping));
            collisions.push(ResolutionCollision {
                normalized_name: name,
                chosen,
                policy: "highest_source_confidence".to_string(),
                claims: collision_claims,
            });
        }
        collisions
    }
}

/// Overlap of two property bags in `[0, 1]`.
///
/// Over the union of keys, a shared key counts half and a shared key with an
/// equal value counts in full.
pub fn property_overlap(a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> f64 {
    let union: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    if union.is_empty() {
        return 0.0;
    }
    let shared: f64 = a
        .iter()
        .filter_map(|(k, v)| b.get(k).map(|other| if other == v { 1.0 } else { 0.5 }))
        .sum();
    shared / union.len() as f64
}

/// Groups unresolved mappings by normalized name into entity proposals.
fn derive_proposals(resolved: &[ResolvedAnalysis<'_>]) -> Vec<EntityProposal> {
    let mut grouped: BTreeMap<String, EntityProposal> = BTreeMap::new();
    for ra in resolved {
        for m in ra.mappings.iter().filter(|m| m.canonical_id.is_none()) {
            let normalized = normalize_name(&m.source_name);
            let proposal = grouped
                .entry(normalized.clone())
                .or_insert_with(|| EntityProposal {
                    name: m.source_name.clone(),
                    normalized_name: normalized,
                    category: None,
                    mappings: Vec::new(),
                    best_candidate: None,
                });
            if proposal.category.is_none() {
                proposal.category = m.category;
            }
            proposal.mappings.push(m.id.clone());
            if let Some(candidate) = &m.best_candidate {
                let better = proposal
                    .best_candidate
                    .as_ref()
                    .map_or(true, |b| candidate.score > b.score);
                if better {
                    proposal.best_candidate = Some(candidate.clone());
                }
            }
        }
    }
    grouped
        .into_values()
        .map(|mut p| {
            p.mappings.sort();
            p
        })
        .collect()
}
