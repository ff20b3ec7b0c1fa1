//! Built-in gap rules
//!
//! - Framework coverage: complementary analyses present together when sensitive data is involved
//! - Entity coverage: critical entities have at least one threat record
//! - Control coverage: present threats have a control, and not only one weak one
//! - Compliance: regulated data is protected by the required control category

use std::collections::BTreeSet;

use crate::gap::{gap_severity, Gap, GapContext, GapKind, GapRule};
use crate::model::{Criticality, MappingId, RecordRef};

/// The pre-defined gap rules.
pub struct BuiltinGapRules;

impl BuiltinGapRules {
    /// Every built-in rule, in evaluation order.
    pub fn all() -> Vec<Box<dyn GapRule>> {
        vec![
            Box::new(FrameworkCoverageRule),
            Box::new(EntityCoverageRule),
            Box::new(ControlCoverageRule),
            Box::new(ComplianceRule),
        ]
    }
}

/// Fires when one side of a complementary coverage pair is present without the other
/// while a resolved entity handles data that makes the missing side relevant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameworkCoverageRule;

impl GapRule for FrameworkCoverageRule {
    fn id(&self) -> &str {
        "framework_coverage"
    }

    fn kind(&self) -> GapKind {
        GapKind::FrameworkCoverage
    }

    fn evaluate(&self, ctx: &GapContext<'_>) -> Vec<Gap> {
        let weight = ctx.config.rule_weights.framework_coverage;
        let resolved = ctx.resolved_entities();
        let mut gaps = Vec::new();

        for pair in &ctx.config.complementary_pairs {
            let (present, missing) = match (
                ctx.coverage.contains(&pair.primary),
                ctx.coverage.contains(&pair.complement),
            ) {
                (true, false) => (pair.primary, pair.complement),
                (false, true) => (pair.complement, pair.primary),
                _ => continue,
            };

            let mut entities = Vec::new();
            let mut mappings: Vec<MappingId> = Vec::new();
            let mut data = BTreeSet::new();
            let mut criticality = Criticality::Low;
            for (entity_id, mapping_ids) in &resolved {
                let sensitive: BTreeSet<String> = ctx
                    .data_categories_of(entity_id)
                    .intersection(&pair.relevant_data)
                    .cloned()
                    .collect();
                if sensitive.is_empty() {
                    continue;
                }
                if let Some(entity) = ctx.model.get(entity_id) {
                    criticality = criticality.max(entity.criticality);
                }
                entities.push(entity_id.clone());
                mappings.extend(mapping_ids.iter().cloned());
                data.extend(sensitive);
            }
            if entities.is_empty() {
                continue;
            }

            let data: Vec<String> = data.into_iter().collect();
            gaps.push(
                Gap::new(
                    self.id(),
                    self.kind(),
                    gap_severity(criticality, weight),
                    format!(
                        "{} analysis present without {} analysis while {} entities handle {} data",
                        present.as_str(),
                        missing.as_str(),
                        entities.len(),
                        data.join(", ")
                    ),
                )
                .with_entities(entities)
                .with_mappings(mappings),
            );
        }
        gaps
    }
}

/// Fires for every entity at or above the criticality floor with no threat records.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityCoverageRule;

impl GapRule for EntityCoverageRule {
    fn id(&self) -> &str {
        "entity_coverage"
    }

    fn kind(&self) -> GapKind {
        GapKind::EntityCoverage
    }

    fn evaluate(&self, ctx: &GapContext<'_>) -> Vec<Gap> {
        let weight = ctx.config.rule_weights.entity_coverage;
        let resolved = ctx.resolved_entities();
        ctx.model
            .entities
            .iter()
            .filter(|e| e.criticality >= ctx.config.min_criticality)
            .filter(|e| !ctx.index.mentions_entity(&e.id))
            .map(|e| {
                let mappings = resolved.get(&e.id).cloned().unwrap_or_default();
                let rationale = if mappings.is_empty() {
                    format!(
                        "{} entity '{}' is not mentioned by any source",
                        criticality_label(e.criticality),
                        e.name
                    )
                } else {
                    format!(
                        "{} entity '{}' appears in {} sources but has no threat records",
                        criticality_label(e.criticality),
                        e.name,
                        mappings.len()
                    )
                };
                Gap::new(
                    self.id(),
                    self.kind(),
                    gap_severity(e.criticality, weight),
                    rationale,
                )
                .with_entities(vec![e.id.clone()])
                .with_mappings(mappings)
            })
            .collect()
    }
}

/// Fires for every present threat with no control, or with a single control
/// below the low-effectiveness threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCoverageRule;

impl GapRule for ControlCoverageRule {
    fn id(&self) -> &str {
        "control_coverage"
    }

    fn kind(&self) -> GapKind {
        GapKind::ControlCoverage
    }

    fn evaluate(&self, ctx: &GapContext<'_>) -> Vec<Gap> {
        let weight = ctx.config.rule_weights.control_coverage;
        let mut gaps = Vec::new();

        for group in ctx.index.threat_groups.values() {
            if !ctx.index.group_present(group) {
                continue;
            }
            let controls = ctx.index.controls_for_group(group);
            let name = &ctx.index.threats[group.members[0]].record.name;
            let rationale = match controls.as_slice() {
                [] => format!("threat '{}' has no control", name),
                [only] if only.record.effectiveness < ctx.config.low_effectiveness => format!(
                    "threat '{}' relies on a single control '{}' with effectiveness {:.2}",
                    name, only.record.name, only.record.effectiveness
                ),
                _ => continue,
            };

            let mut records: Vec<RecordRef> = group
                .members
                .iter()
                .map(|&i| ctx.index.threats[i].record_ref.clone())
                .collect();
            records.extend(controls.iter().map(|c| c.record_ref.clone()));

            gaps.push(
                Gap::new(
                    self.id(),
                    self.kind(),
                    gap_severity(ctx.criticality_of(&group.element), weight),
                    rationale,
                )
                .with_entities(group.element.entity_ids().into_iter().map(String::from))
                .with_mappings(ctx.index.group_mappings(group))
                .with_records(records),
            );
        }
        gaps
    }
}

/// Fires when an entity handles a regulated data category and no control on
/// that entity belongs to the required control category.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplianceRule;

impl GapRule for ComplianceRule {
    fn id(&self) -> &str {
        "compliance"
    }

    fn kind(&self) -> GapKind {
        GapKind::Compliance
    }

    fn evaluate(&self, ctx: &GapContext<'_>) -> Vec<Gap> {
        let weight = ctx.config.rule_weights.compliance;
        let mut gaps = Vec::new();

        for (entity_id, mappings) in ctx.resolved_entities() {
            let controls: Vec<_> = ctx
                .index
                .controls
                .iter()
                .filter(|c| {
                    c.element
                        .as_ref()
                        .is_some_and(|e| e.entity_ids().contains(&entity_id.as_str()))
                })
                .collect();
            let criticality = ctx
                .model
                .get(&entity_id)
                .map(|e| e.criticality)
                .unwrap_or_default();

            for data in ctx.data_categories_of(&entity_id) {
                let Some(required) = ctx.config.required_controls.get(&data) else {
                    continue;
                };
                let covered = controls.iter().any(|c| {
                    c.record
                        .categories
                        .iter()
                        .any(|cat| cat.eq_ignore_ascii_case(required))
                });
                if covered {
                    continue;
                }
                gaps.push(
                    Gap::new(
                        self.id(),
                        self.kind(),
                        gap_severity(criticality, weight),
                        format!(
                            "entity '{}' handles {} data without a {} control",
                            entity_id, data, required
                        ),
                    )
                    .with_entities(vec![entity_id.clone()])
                    .with_mappings(mappings.clone())
                    .with_records(controls.iter().map(|c| c.record_ref.clone())),
                );
            }
        }
        gaps
    }
}

fn criticality_label(criticality: Criticality) -> &'static str {
    match criticality {
        Criticality::Low => "low-criticality",
        Criticality::Medium => "medium-criticality",
        Criticality::High => "high-criticality",
        Criticality::Critical => "critical",
    }
}
