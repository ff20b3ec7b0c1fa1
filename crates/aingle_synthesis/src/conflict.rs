//! Conflict Resolver - detects and settles cross-source disagreements
//!
//! Records about the same resolved element are grouped, and a group whose
//! records come from at least two frameworks is checked for disagreement:
//!
//! | Group | Attribute | Basis |
//! |-------|-----------|-------|
//! | Threats by (element, merge key) | existence | categorical disagreement |
//! | Threats by (element, merge key) | severity | numeric spread |
//! | Controls by (element, name) | effectiveness | numeric spread |
//! | Risks by risk item | score | numeric spread, categorical disagreement, scale mismatch |
//!
//! Every detected conflict is settled by weighted consensus over per-framework
//! expertise weights and reported, however low the resolution confidence.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{ExpertiseWeights, SynthesisConfig};
use crate::error::Result;
use crate::index::{risk_item_id, SynthesisIndex};
use crate::model::{FrameworkTag, MappingId, RecordKind, RecordRef, Severity, ThreatStatus};
use crate::resolver::{ElementRef, ResolvedAnalysis};
use crate::scoring::UnifiedRiskScorer;
use crate::similarity::normalize_name;

/// The judged attribute a conflict is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAttribute {
    Existence,
    Severity,
    Effectiveness,
    Score,
}

impl ConflictAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictAttribute::Existence => "existence",
            ConflictAttribute::Severity => "severity",
            ConflictAttribute::Effectiveness => "effectiveness",
            ConflictAttribute::Score => "score",
        }
    }

    /// The record kind whose expertise weights apply.
    pub fn record_kind(&self) -> RecordKind {
        match self {
            ConflictAttribute::Existence | ConflictAttribute::Severity => RecordKind::Threat,
            ConflictAttribute::Effectiveness => RecordKind::Control,
            ConflictAttribute::Score => RecordKind::Risk,
        }
    }
}

/// Why a group of records was judged to be in conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictBasis {
    /// Numeric values differ by more than the tolerance, relative to the largest.
    NumericSpread { spread: f64, tolerance: f64 },
    /// Sources chose different categorical options.
    CategoricalDisagreement { options: Vec<String> },
    /// Some sources judged only with labels, others only with numbers.
    ScaleMismatch,
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    WeightedConsensus,
}

/// One source's judgement inside a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetingValue {
    pub record: RecordRef,
    pub framework: FrameworkTag,
    /// Expertise weight of the framework for this record kind.
    pub weight: f64,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
}

/// The settled value of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Weight-normalized mean of the numeric values, if any.
    pub value: Option<f64>,
    /// Highest-weighted option of the categorical values, if any.
    pub label: Option<String>,
    /// Concentration of the weight distribution in `[0, 1]`.
    pub confidence: f64,
}

/// A disagreement between sources about one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub kind: RecordKind,
    pub attribute: ConflictAttribute,
    /// Grouping key of the disputed item (a risk item id for scores).
    pub subject: String,
    pub element: ElementRef,
    pub mappings: Vec<MappingId>,
    pub frameworks: BTreeSet<FrameworkTag>,
    pub values: Vec<CompetingValue>,
    pub basis: ConflictBasis,
    pub strategy: ResolutionStrategy,
    pub resolution: Resolution,
}

/// Builds the stable id of a conflict.
fn conflict_id(attribute: ConflictAttribute, subject: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(attribute.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(subject.as_bytes());
    let hash = hasher.finalize();
    format!("conflict-{}", &hex::encode(hash.as_bytes())[..16])
}

/// Relative difference `(max - min) / max` of non-negative values.
pub fn relative_spread(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    if values.len() < 2 || max <= 0.0 {
        return 0.0;
    }
    (max - min) / max
}

/// Concentration of a weight distribution: `1 - H(w) / ln(n)`.
///
/// Uniform weights give 0, a single weight gives 1.
pub fn weight_concentration(weights: &[f64]) -> f64 {
    let positive: Vec<f64> = weights.iter().copied().filter(|w| *w > 0.0).collect();
    let n = if positive.is_empty() {
        weights.len()
    } else {
        positive.len()
    };
    if n <= 1 {
        return 1.0;
    }
    if positive.is_empty() {
        return 0.0;
    }
    let total: f64 = positive.iter().sum();
    let entropy: f64 = positive
        .iter()
        .map(|w| {
            let p = w / total;
            -p * p.ln()
        })
        .sum();
    (1.0 - entropy / (n as f64).ln()).clamp(0.0, 1.0)
}

/// Severity ordering of categorical options, used to break ties conservatively.
fn option_rank(label: &str) -> f64 {
    match label {
        "present" => 1.0,
        "absent" => 0.0,
        other => Severity::parse(other).map(|s| s.score()).unwrap_or(0.0),
    }
}

fn status_label(status: ThreatStatus) -> &'static str {
    match status {
        ThreatStatus::Present => "present",
        ThreatStatus::Absent => "absent",
    }
}

/// A group of records judged together, before conflict detection.
struct Group {
    kind: RecordKind,
    element: ElementRef,
    subject: String,
    mappings: BTreeSet<MappingId>,
    values: Vec<CompetingValue>,
}

impl Group {
    fn frameworks(&self) -> BTreeSet<FrameworkTag> {
        self.values.iter().map(|v| v.framework.clone()).collect()
    }
}

/// Detects and settles conflicts across resolved analyses.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    tolerance: f64,
    expertise: ExpertiseWeights,
    scorer: UnifiedRiskScorer,
}

impl ConflictResolver {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            tolerance: config.conflicts.tolerance,
            expertise: config.expertise.clone(),
            scorer: UnifiedRiskScorer::new(config.scoring.clone()),
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Finds every conflict across the analyses, each with its resolution.
    pub fn find_conflicts(&self, resolved: &[ResolvedAnalysis<'_>]) -> Result<Vec<Conflict>> {
        let index = SynthesisIndex::build(resolved);
        self.find_conflicts_indexed(&index)
    }

    pub(crate) fn find_conflicts_indexed(
        &self,
        index: &SynthesisIndex<'_>,
    ) -> Result<Vec<Conflict>> {
        let mut conflicts = Vec::new();
        self.threat_conflicts(index, &mut conflicts)?;
        self.control_conflicts(index, &mut conflicts)?;
        self.risk_conflicts(index, &mut conflicts)?;
        conflicts.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("Detected {} conflicts", conflicts.len());
        Ok(conflicts)
    }

    fn weight(&self, framework: &FrameworkTag, kind: RecordKind) -> Result<f64> {
        self.expertise.require(framework, kind)
    }

    fn threat_conflicts(&self, index: &SynthesisIndex<'_>, out: &mut Vec<Conflict>) -> Result<()> {
        for group in index.threat_groups.values() {
            let subject = format!("{}#{}", group.element.key(), group.merge_key);
            let mut existence = Group {
                kind: RecordKind::Threat,
                element: group.element.clone(),
                subject: subject.clone(),
                mappings: BTreeSet::new(),
                values: Vec::new(),
            };
            let mut severity = Group {
                kind: RecordKind::Threat,
                element: group.element.clone(),
                subject,
                mappings: BTreeSet::new(),
                values: Vec::new(),
            };
            for &i in &group.members {
                let entry = &index.threats[i];
                let weight = self.weight(&entry.framework, RecordKind::Threat)?;
                existence.mappings.extend(entry.mappings.iter().cloned());
                existence.values.push(CompetingValue {
                    record: entry.record_ref.clone(),
                    framework: entry.framework.clone(),
                    weight,
                    value: None,
                    label: Some(status_label(entry.record.status).to_string()),
                });
                if entry.record.status == ThreatStatus::Present {
                    severity.mappings.extend(entry.mappings.iter().cloned());
                    severity.values.push(CompetingValue {
                        record: entry.record_ref.clone(),
                        framework: entry.framework.clone(),
                        weight,
                        value: Some(entry.record.severity.score()),
                        label: Some(entry.record.severity.as_str().to_string()),
                    });
                }
            }

            if existence.frameworks().len() >= 2 {
                let options = distinct_labels(&existence.values);
                if options.len() > 1 {
                    self.push(
                        out,
                        existence,
                        ConflictAttribute::Existence,
                        ConflictBasis::CategoricalDisagreement { options },
                    );
                }
            }
            if severity.frameworks().len() >= 2 {
                let values: Vec<f64> = severity.values.iter().filter_map(|v| v.value).collect();
                let spread = relative_spread(&values);
                if spread > self.tolerance {
                    self.push(
                        out,
                        severity,
                        ConflictAttribute::Severity,
                        ConflictBasis::NumericSpread {
                            spread,
                            tolerance: self.tolerance,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn control_conflicts(&self, index: &SynthesisIndex<'_>, out: &mut Vec<Conflict>) -> Result<()> {
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for entry in &index.controls {
            let Some(element) = &entry.element else {
                continue;
            };
            let subject = format!("{}#{}", element.key(), normalize_name(&entry.record.name));
            let weight = self.weight(&entry.framework, RecordKind::Control)?;
            let group = groups.entry(subject.clone()).or_insert_with(|| Group {
                kind: RecordKind::Control,
                element: element.clone(),
                subject,
                mappings: BTreeSet::new(),
                values: Vec::new(),
            });
            group.mappings.extend(entry.mappings.iter().cloned());
            group.values.push(CompetingValue {
                record: entry.record_ref.clone(),
                framework: entry.framework.clone(),
                weight,
                value: Some(entry.record.effectiveness),
                label: None,
            });
        }

        for group in groups.into_values() {
            if group.frameworks().len() < 2 {
                continue;
            }
            let values: Vec<f64> = group.values.iter().filter_map(|v| v.value).collect();
            let spread = relative_spread(&values);
            if spread > self.tolerance {
                self.push(
                    out,
                    group,
                    ConflictAttribute::Effectiveness,
                    ConflictBasis::NumericSpread {
                        spread,
                        tolerance: self.tolerance,
                    },
                );
            }
        }
        Ok(())
    }

    fn risk_conflicts(&self, index: &SynthesisIndex<'_>, out: &mut Vec<Conflict>) -> Result<()> {
        for (item, entries) in index.risk_items() {
            let first = entries[0];
            let mut group = Group {
                kind: RecordKind::Risk,
                element: first.element.clone(),
                subject: risk_item_id(&first.element, &first.threat_key),
                mappings: BTreeSet::new(),
                values: Vec::new(),
            };
            let mut categorical_only = Vec::new();
            for entry in &entries {
                let Some(judgement) = self.scorer.judge(entry.record)? else {
                    continue;
                };
                let weight = self.weight(&entry.framework, RecordKind::Risk)?;
                group.mappings.extend(entry.mappings.iter().cloned());
                categorical_only.push(judgement.categorical_only);
                group.values.push(CompetingValue {
                    record: entry.record_ref.clone(),
                    framework: entry.framework.clone(),
                    weight,
                    value: Some(judgement.value),
                    label: judgement.label,
                });
            }
            if group.frameworks().len() < 2 {
                continue;
            }

            let values: Vec<f64> = group.values.iter().filter_map(|v| v.value).collect();
            let spread = relative_spread(&values);
            let labels = distinct_labels(&group.values);
            let basis = if spread > self.tolerance {
                ConflictBasis::NumericSpread {
                    spread,
                    tolerance: self.tolerance,
                }
            } else if labels.len() > 1 {
                ConflictBasis::CategoricalDisagreement { options: labels }
            } else if categorical_only.iter().any(|c| *c)
                && group.values.iter().any(|v| v.label.is_none())
            {
                ConflictBasis::ScaleMismatch
            } else {
                continue;
            };
            debug!("Risk item {} conflicts: {:?}", item, basis);
            self.push(out, group, ConflictAttribute::Score, basis);
        }
        Ok(())
    }

    fn push(
        &self,
        out: &mut Vec<Conflict>,
        mut group: Group,
        attribute: ConflictAttribute,
        basis: ConflictBasis,
    ) {
        group.values.sort_by(|a, b| a.record.cmp(&b.record));
        let frameworks = group.frameworks();
        let mut conflict = Conflict {
            id: conflict_id(attribute, &group.subject),
            kind: group.kind,
            attribute,
            subject: group.subject,
            element: group.element,
            mappings: group.mappings.into_iter().collect(),
            frameworks,
            values: group.values,
            basis,
            strategy: ResolutionStrategy::WeightedConsensus,
            resolution: Resolution {
                value: None,
                label: None,
                confidence: 0.0,
            },
        };
        conflict.resolution = self.resolve(&conflict);
        debug!(
            "Conflict {} on {} ({}) settled with confidence {:.3}",
            conflict.id,
            conflict.subject,
            attribute.as_str(),
            conflict.resolution.confidence
        );
        out.push(conflict);
    }

    /// Settles a conflict by weighted consensus.
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        let numeric: Vec<(f64, f64)> = conflict
            .values
            .iter()
            .filter_map(|v| v.value.map(|x| (v.weight, x)))
            .collect();
        let value = if numeric.is_empty() {
            None
        } else {
            let total: f64 = numeric.iter().map(|(w, _)| w).sum();
            if total > 0.0 {
                Some(numeric.iter().map(|(w, x)| w * x).sum::<f64>() / total)
            } else {
                Some(numeric.iter().map(|(_, x)| x).sum::<f64>() / numeric.len() as f64)
            }
        };

        let mut options: BTreeMap<&str, f64> = BTreeMap::new();
        for v in &conflict.values {
            if let Some(label) = &v.label {
                *options.entry(label.as_str()).or_insert(0.0) += v.weight;
            }
        }
        let label = options
            .iter()
            .max_by(|(a, wa), (b, wb)| {
                wa.total_cmp(wb)
                    .then_with(|| option_rank(a).total_cmp(&option_rank(b)))
                    // prefer the lexically smaller label last
                    .then_with(|| b.cmp(a))
            })
            .map(|(label, _)| label.to_string());

        let weights: Vec<f64> = match conflict.basis {
            ConflictBasis::CategoricalDisagreement { .. } => options.values().copied().collect(),
            _ => conflict.values.iter().map(|v| v.weight).collect(),
        };

        Resolution {
            value,
            label,
            confidence: weight_concentration(&weights),
        }
    }
}

fn distinct_labels(values: &[CompetingValue]) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v.label.clone())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EntityCategory, EntityMapping, RecordTarget, RiskRecord, ScoreValue, StandardizedAnalysis,
        SystemEntity, SystemModel, ThreatRecord,
    };
    use crate::resolver::EntityResolver;

    fn model() -> SystemModel {
        SystemModel::new(vec![SystemEntity::new(
            "ent-pay",
            "Payment Gateway",
            EntityCategory::Software,
        )])
    }

    fn analysis(source: &str, framework: &str) -> StandardizedAnalysis {
        let mut a = StandardizedAnalysis::new(source, "test", framework, 0.9);
        a.entities.push(EntityMapping::new(source, "gw", "Payment Gateway"));
        a
    }

    fn threat(status: ThreatStatus, severity: Severity) -> ThreatRecord {
        ThreatRecord {
            id: "t".into(),
            name: "Card data skimming".into(),
            target: RecordTarget::Entity("gw".into()),
            category: None,
            severity,
            status,
            reference: None,
        }
    }

    fn risk(scores: Vec<ScoreValue>) -> RiskRecord {
        RiskRecord {
            id: "r".into(),
            entity: Some("gw".into()),
            threat: Some("Card data skimming".into()),
            scores,
        }
    }

    fn run(config: &SynthesisConfig, analyses: &[StandardizedAnalysis]) -> Vec<Conflict> {
        let resolver = EntityResolver::new(config.resolver.clone());
        let outcome = resolver.resolve_all(analyses, &model());
        ConflictResolver::new(config)
            .find_conflicts(&outcome.analyses)
            .unwrap()
    }

    #[test]
    fn test_categorical_vs_numeric_is_scale_mismatch() {
        let config = SynthesisConfig::default();
        let mut a = analysis("a", "octave");
        a.risks.push(risk(vec![ScoreValue::text("qualitative", "critical")]));
        let mut b = analysis("b", "dread");
        b.risks.push(risk(vec![ScoreValue::number("percent", 92.0)]));

        let conflicts = run(&config, &[a, b]);
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.attribute, ConflictAttribute::Score);
        assert_eq!(conflict.basis, ConflictBasis::ScaleMismatch);
        assert_eq!(conflict.values.len(), 2);
        assert_eq!(conflict.resolution.label.as_deref(), Some("critical"));
        // (0.9 * 100 + 0.8 * 92) / 1.7
        let expected = (0.9 * 100.0 + 0.8 * 92.0) / 1.7;
        assert!((conflict.resolution.value.unwrap() - expected).abs() < 1e-9);
        assert_eq!(conflict.mappings, vec!["a/gw".to_string(), "b/gw".to_string()]);
    }

    #[test]
    fn test_existence_tie_keeps_threat() {
        let config = SynthesisConfig::default()
            .with_expertise_weight("stride", RecordKind::Threat, 0.5)
            .with_expertise_weight("octave", RecordKind::Threat, 0.5);
        let mut a = analysis("a", "stride");
        a.threats.push(threat(ThreatStatus::Present, Severity::High));
        let mut b = analysis("b", "octave");
        b.threats.push(threat(ThreatStatus::Absent, Severity::High));

        let conflicts = run(&config, &[a, b]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].attribute, ConflictAttribute::Existence);
        assert_eq!(conflicts[0].resolution.label.as_deref(), Some("present"));
        assert!(conflicts[0].resolution.confidence.abs() < 1e-12);
    }

    #[test]
    fn test_severity_spread_within_tolerance_is_not_a_conflict() {
        let config = SynthesisConfig::default();
        let mut a = analysis("a", "stride");
        a.threats.push(threat(ThreatStatus::Present, Severity::High));
        let mut b = analysis("b", "octave");
        b.threats.push(threat(ThreatStatus::Present, Severity::Critical));
        assert!(run(&config, &[a.clone(), b]).is_empty());

        let mut c = analysis("c", "octave");
        c.threats.push(threat(ThreatStatus::Present, Severity::Low));
        let conflicts = run(&config, &[a, c]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].attribute, ConflictAttribute::Severity);
    }

    #[test]
    fn test_same_framework_never_conflicts() {
        let config = SynthesisConfig::default();
        let mut a = analysis("a", "stride");
        a.threats.push(threat(ThreatStatus::Present, Severity::High));
        let mut b = analysis("b", "stride");
        b.threats.push(threat(ThreatStatus::Absent, Severity::High));
        assert!(run(&config, &[a, b]).is_empty());
    }

    #[test]
    fn test_detection_is_symmetric() {
        let config = SynthesisConfig::default();
        let mut a = analysis("a", "octave");
        a.risks.push(risk(vec![ScoreValue::number("impact_likelihood", 25.0)]));
        let mut b = analysis("b", "dread");
        b.risks.push(risk(vec![ScoreValue::number("dread", 10.0)]));

        let ab = run(&config, &[a.clone(), b.clone()]);
        let ba = run(&config, &[b, a]);
        assert_eq!(ab.len(), 1);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_missing_expertise_weight_is_configuration_error() {
        let config = SynthesisConfig::default();
        let mut a = analysis("a", "pasta");
        a.threats.push(threat(ThreatStatus::Present, Severity::High));
        let outcome = EntityResolver::new(config.resolver.clone()).resolve_all(
            std::slice::from_ref(&a),
            &model(),
        );
        let err = ConflictResolver::new(&config)
            .find_conflicts(&outcome.analyses)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_weight_concentration() {
        assert_eq!(weight_concentration(&[1.0]), 1.0);
        assert_eq!(weight_concentration(&[]), 1.0);
        assert!(weight_concentration(&[0.5, 0.5]).abs() < 1e-12);
        let skewed = weight_concentration(&[0.9, 0.1]);
        assert!(skewed > 0.5 && skewed < 1.0);
    }

    #[test]
    fn test_relative_spread() {
        assert_eq!(relative_spread(&[50.0]), 0.0);
        assert!((relative_spread(&[100.0, 92.0]) - 0.08).abs() < 1e-12);
        assert_eq!(relative_spread(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_conflict_ids_are_stable() {
        let a = conflict_id(ConflictAttribute::Score, "entity:x#*");
        assert_eq!(a, conflict_id(ConflictAttribute::Score, "entity:x#*"));
        assert_ne!(a, conflict_id(ConflictAttribute::Existence, "entity:x#*"));
        assert!(a.starts_with("conflict-"));
        assert_eq!(a.len(), "conflict-".len() + 16);
    }
}
