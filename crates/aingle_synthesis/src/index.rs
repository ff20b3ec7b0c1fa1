//! Cross-source record index.
//!
//! Flattens resolved analyses into threat, control and risk entries keyed by
//! the element they are about, so gap detection, conflict detection and
//! scoring all group records the same way.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    mapping_id, ControlRecord, FrameworkTag, MappingId, RecordRef, RiskRecord, ThreatRecord,
    ThreatStatus,
};
use crate::resolver::{ElementRef, ResolvedAnalysis};
use crate::similarity::normalize_name;

/// Threat key used by risks that name no threat.
pub const ANY_THREAT: &str = "*";

/// A threat record placed on its resolved element.
#[derive(Debug, Clone)]
pub struct ThreatEntry<'a> {
    pub record_ref: RecordRef,
    pub framework: FrameworkTag,
    pub source_confidence: f64,
    pub record: &'a ThreatRecord,
    pub element: ElementRef,
    pub mappings: Vec<MappingId>,
    pub merge_key: String,
}

/// A control record placed on its resolved element, if it has one.
#[derive(Debug, Clone)]
pub struct ControlEntry<'a> {
    pub record_ref: RecordRef,
    pub framework: FrameworkTag,
    pub record: &'a ControlRecord,
    pub element: Option<ElementRef>,
    /// Threat records this control claims to address.
    pub addresses: Vec<RecordRef>,
    pub mappings: Vec<MappingId>,
}

/// A risk record keyed by its risk item.
#[derive(Debug, Clone)]
pub struct RiskEntry<'a> {
    pub record_ref: RecordRef,
    pub framework: FrameworkTag,
    pub record: &'a RiskRecord,
    pub element: ElementRef,
    pub threat_key: String,
    pub mappings: Vec<MappingId>,
}

impl RiskEntry<'_> {
    /// Identifier of the risk item this record scores.
    pub fn item_id(&self) -> String {
        risk_item_id(&self.element, &self.threat_key)
    }
}

/// Builds the identifier of a risk item.
pub fn risk_item_id(element: &ElementRef, threat_key: &str) -> String {
    format!("{}#{}", element.key(), threat_key)
}

/// Reports of one threat on one element, possibly from several sources.
#[derive(Debug, Clone)]
pub struct ThreatGroup {
    pub element: ElementRef,
    pub merge_key: String,
    /// Indices into [`SynthesisIndex::threats`].
    pub members: Vec<usize>,
}

/// All records of a run, flattened and grouped.
#[derive(Debug, Clone, Default)]
pub struct SynthesisIndex<'a> {
    pub threats: Vec<ThreatEntry<'a>>,
    pub controls: Vec<ControlEntry<'a>>,
    pub risks: Vec<RiskEntry<'a>>,
    /// Threat groups keyed by (element key, merge key).
    pub threat_groups: BTreeMap<(String, String), ThreatGroup>,
}

impl<'a> SynthesisIndex<'a> {
    /// Flattens resolved analyses. Entry order follows analysis order then record order.
    pub fn build(resolved: &[ResolvedAnalysis<'a>]) -> Self {
        let mut index = SynthesisIndex::default();

        for ra in resolved {
            let analysis = ra.analysis;
            for threat in &analysis.threats {
                index.threats.push(ThreatEntry {
                    record_ref: analysis.record_ref(&threat.id),
                    framework: analysis.framework.clone(),
                    source_confidence: analysis.source_confidence,
                    record: threat,
                    element: ra.element_of_target(&threat.target),
                    mappings: ra.mappings_of_target(&threat.target),
                    merge_key: threat.merge_key(),
                });
            }

            for control in &analysis.controls {
                let addresses: Vec<RecordRef> = control
                    .addresses
                    .iter()
                    .filter(|id| analysis.threat(id).is_some())
                    .map(|id| analysis.record_ref(id))
                    .collect();
                let (element, mappings) = match &control.entity {
                    Some(key) => (
                        Some(ra.element_of_entity(key)),
                        vec![mapping_id(&analysis.source_id, key)],
                    ),
                    None => {
                        let first = control.addresses.iter().find_map(|id| analysis.threat(id));
                        match first {
                            Some(t) => (
                                Some(ra.element_of_target(&t.target)),
                                ra.mappings_of_target(&t.target),
                            ),
                            None => (None, Vec::new()),
                        }
                    }
                };
                index.controls.push(ControlEntry {
                    record_ref: analysis.record_ref(&control.id),
                    framework: analysis.framework.clone(),
                    record: control,
                    element,
                    addresses,
                    mappings,
                });
            }

            for risk in &analysis.risks {
                let linked = risk.threat.as_deref().and_then(|t| analysis.threat(t));
                let threat_key = match (linked, risk.threat.as_deref()) {
                    (Some(t), _) => t.merge_key(),
                    (None, Some(name)) => normalize_name(name),
                    (None, None) => ANY_THREAT.to_string(),
                };
                let (element, mappings) = match (&risk.entity, linked) {
                    (Some(key), _) => (
                        ra.element_of_entity(key),
                        vec![mapping_id(&analysis.source_id, key)],
                    ),
                    (None, Some(t)) => (
                        ra.element_of_target(&t.target),
                        ra.mappings_of_target(&t.target),
                    ),
                    (None, None) => (
                        ElementRef::Unscoped {
                            record: analysis.record_ref(&risk.id).to_string(),
                        },
                        Vec::new(),
                    ),
                };
                index.risks.push(RiskEntry {
                    record_ref: analysis.record_ref(&risk.id),
                    framework: analysis.framework.clone(),
                    record: risk,
                    element,
                    threat_key,
                    mappings,
                });
            }
        }

        for (i, entry) in index.threats.iter().enumerate() {
            index
                .threat_groups
                .entry((entry.element.key(), entry.merge_key.clone()))
                .or_insert_with(|| ThreatGroup {
                    element: entry.element.clone(),
                    merge_key: entry.merge_key.clone(),
                    members: Vec::new(),
                })
                .members
                .push(i);
        }

        index
    }

    /// Whether any member of a threat group asserts the threat applies.
    pub fn group_present(&self, group: &ThreatGroup) -> bool {
        group
            .members
            .iter()
            .any(|&i| self.threats[i].record.status == ThreatStatus::Present)
    }

    /// Controls addressing any member of a threat group.
    pub fn controls_for_group(&self, group: &ThreatGroup) -> Vec<&ControlEntry<'a>> {
        let members: BTreeSet<&RecordRef> = group
            .members
            .iter()
            .map(|&i| &self.threats[i].record_ref)
            .collect();
        self.controls
            .iter()
            .filter(|c| c.addresses.iter().any(|r| members.contains(r)))
            .collect()
    }

    /// Mapping ids implicated by a threat group.
    pub fn group_mappings(&self, group: &ThreatGroup) -> Vec<MappingId> {
        let set: BTreeSet<&MappingId> = group
            .members
            .iter()
            .flat_map(|&i| self.threats[i].mappings.iter())
            .collect();
        set.into_iter().cloned().collect()
    }

    /// Risk entries grouped by risk item id.
    pub fn risk_items(&self) -> BTreeMap<String, Vec<&RiskEntry<'a>>> {
        let mut items: BTreeMap<String, Vec<&RiskEntry<'a>>> = BTreeMap::new();
        for entry in &self.risks {
            items.entry(entry.item_id()).or_default().push(entry);
        }
        items
    }

    /// Whether any threat record touches a canonical entity.
    pub fn mentions_entity(&self, entity_id: &str) -> bool {
        self.threats
            .iter()
            .any(|t| t.element.entity_ids().contains(&entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::model::{
        EntityCategory, EntityMapping, RecordTarget, Severity, StandardizedAnalysis, SystemEntity,
        SystemModel,
    };
    use crate::resolver::EntityResolver;

    fn threat(id: &str, name: &str, target: &str, status: ThreatStatus) -> ThreatRecord {
        ThreatRecord {
            id: id.into(),
            name: name.into(),
            target: RecordTarget::Entity(target.into()),
            category: None,
            severity: Severity::High,
            status,
            reference: None,
        }
    }

    fn fixture() -> (SystemModel, Vec<StandardizedAnalysis>) {
        let model = SystemModel::new(vec![SystemEntity::new(
            "ent-auth",
            "Authentication Service",
            EntityCategory::Software,
        )]);

        let mut a = StandardizedAnalysis::new("a", "dfd-threat-catalog", "stride", 0.9);
        a.entities.push(EntityMapping::new("a", "p1", "Auth Service"));
        a.threats.push(threat("t1", "Credential Stuffing", "p1", ThreatStatus::Present));
        a.controls.push(ControlRecord {
            id: "m1".into(),
            name: "Rate limiting".into(),
            entity: None,
            addresses: vec!["t1".into()],
            effectiveness: 0.5,
            categories: BTreeSet::new(),
        });

        let mut b = StandardizedAnalysis::new("b", "risk-scorecard", "dread", 0.8);
        b.entities.push(EntityMapping::new("b", "x", "Authentication Service"));
        b.threats.push(threat("t9", "credential-stuffing", "x", ThreatStatus::Absent));
        b.risks.push(RiskRecord {
            id: "r1".into(),
            entity: None,
            threat: Some("t9".into()),
            scores: Vec::new(),
        });
        (model, vec![a, b])
    }

    #[test]
    fn test_threats_merge_across_sources() {
        let (model, analyses) = fixture();
        let resolver = EntityResolver::new(ResolverConfig::default());
        let outcome = resolver.resolve_all(&analyses, &model);
        let index = SynthesisIndex::build(&outcome.analyses);

        assert_eq!(index.threats.len(), 2);
        assert_eq!(index.threat_groups.len(), 1);
        let group = index.threat_groups.values().next().unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.merge_key, "credential stuffing");
        assert!(index.group_present(group));
        assert_eq!(index.controls_for_group(group).len(), 1);
        assert_eq!(index.group_mappings(group), vec!["a/p1".to_string(), "b/x".to_string()]);
        assert!(index.mentions_entity("ent-auth"));
    }

    #[test]
    fn test_risk_inherits_element_from_linked_threat() {
        let (model, analyses) = fixture();
        let resolver = EntityResolver::new(ResolverConfig::default());
        let outcome = resolver.resolve_all(&analyses, &model);
        let index = SynthesisIndex::build(&outcome.analyses);

        let items = index.risk_items();
        let ids: Vec<&String> = items.keys().collect();
        assert_eq!(ids, vec!["entity:ent-auth#credential stuffing"]);
    }

    #[test]
    fn test_control_element_from_addressed_threat() {
        let (model, analyses) = fixture();
        let resolver = EntityResolver::new(ResolverConfig::default());
        let outcome = resolver.resolve_all(&analyses, &model);
        let index = SynthesisIndex::build(&outcome.analyses);

        let control = &index.controls[0];
        assert_eq!(
            control.element,
            Some(ElementRef::Entity {
                id: "ent-auth".into()
            })
        );
        assert_eq!(control.mappings, vec!["a/p1".to_string()]);
    }

    #[test]
    fn test_unscoped_risk_is_not_a_mapping() {
        let (model, mut analyses) = fixture();
        analyses[1].risks.push(RiskRecord {
            id: "r2".into(),
            entity: None,
            threat: None,
            scores: Vec::new(),
        });
        let resolver = EntityResolver::new(ResolverConfig::default());
        let outcome = resolver.resolve_all(&analyses, &model);
        let index = SynthesisIndex::build(&outcome.analyses);

        let risk = index
            .risks
            .iter()
            .find(|r| r.record.id == "r2")
            .expect("unscoped risk indexed");
        assert_eq!(
            risk.element,
            ElementRef::Unscoped {
                record: "b#r2".into()
            }
        );
        assert!(risk.mappings.is_empty());
        assert!(risk.element.entity_ids().is_empty());
        assert_eq!(risk.item_id(), "record:b#r2#*");
        assert!(!risk.item_id().starts_with("unresolved:"));
    }
}
