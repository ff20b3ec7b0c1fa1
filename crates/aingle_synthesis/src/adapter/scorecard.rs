//! Quantitative risk scorecards (DREAD-style).
//!
//! ```json
//! {
//!   "format": "risk-scorecard",
//!   "entities": [{"id": "e1", "name": "Authentication Service", "category": "software"}],
//!   "risks": [{"id": "r1", "entity": "e1", "threat": "Token replay",
//!              "scores": [{"method": "dread", "value": 38},
//!                         {"method": "cvss",
//!                          "vector": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H"},
//!                         {"method": "qualitative", "label": "critical"}]}]
//! }
//! ```
//!
//! A scorecard names the threats it scores without listing them separately, so
//! one present threat record is emitted per distinct `(entity, threat)` pair.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::adapter::fields::{has_signature, Node};
use crate::adapter::ImportAdapter;
use crate::error::Result;
use crate::model::{
    CoverageDomain, EntityCategory, EntityMapping, RawScore, RawSource, RecordTarget, RiskRecord,
    ScoreValue, Severity, StandardizedAnalysis, ThreatRecord, ThreatStatus,
};
use crate::scoring::cvss;
use crate::similarity::normalize_name;

pub const FORMAT: &str = "risk-scorecard";

const SCORECARD_CONFIDENCE: f64 = 0.8;

pub fn adapter() -> ImportAdapter {
    ImportAdapter::new(
        |payload| {
            has_signature(payload, FORMAT)
                || payload
                    .get("risks")
                    .and_then(|r| r.as_array())
                    .is_some_and(|risks| {
                        !risks.is_empty()
                            && risks.iter().all(|r| r.get("scores").is_some_and(|s| s.is_array()))
                    })
        },
        transform,
    )
    .with_priority(80)
}

/// Parses one `{method, value|vector|label}` entry.
fn score_value(node: &Node<'_>) -> Result<ScoreValue> {
    let method = node.str("method")?.to_ascii_lowercase();
    let value = match node.get("value") {
        Some(Value::String(text)) => RawScore::Text(text.clone()),
        Some(_) => match node.opt_number("value") {
            Ok(Some(v)) => RawScore::Number(v),
            _ => return Err(node.error_at("value", "expected a number or a string")),
        },
        None => match node.opt_first_str(&["vector", "label"])? {
            Some(text) => RawScore::Text(text),
            None => return Err(node.error_at("value", "missing required field")),
        },
    };
    Ok(ScoreValue { method, value })
}

/// A severity readable from the scores themselves, without any normalization table.
fn implied_severity(scores: &[ScoreValue]) -> Option<Severity> {
    scores.iter().find_map(|s| match &s.value {
        RawScore::Text(text) if text.starts_with("CVSS:") => {
            cvss::base_score(text).ok().map(cvss_band)
        }
        RawScore::Text(text) => Severity::parse(text),
        RawScore::Number(_) => None,
    })
}

fn cvss_band(base: f64) -> Severity {
    if base >= 9.0 {
        Severity::Critical
    } else if base >= 7.0 {
        Severity::High
    } else if base >= 4.0 {
        Severity::Medium
    } else if base >= 0.1 {
        Severity::Low
    } else {
        Severity::Info
    }
}

fn transform(raw: &RawSource) -> Result<StandardizedAnalysis> {
    let root = Node::root(&raw.id, &raw.payload)?;
    let framework = root.opt_str("framework")?.unwrap_or_else(|| "dread".to_string());
    let mut analysis =
        StandardizedAnalysis::new(raw.id.as_str(), FORMAT, framework, SCORECARD_CONFIDENCE)
            .with_coverage(CoverageDomain::Business);

    for entity in root.array("entities")? {
        let id = entity.str("id")?;
        if analysis.entity(&id).is_some() {
            return Err(entity.error_at("id", format!("duplicate entity id '{}'", id)));
        }
        let category = entity.opt_str("category")?.and_then(|c| EntityCategory::parse(&c));
        let mut mapping =
            EntityMapping::new(&raw.id, id, entity.str("name")?).with_category(category);
        mapping.data_categories = entity.str_set("data_categories")?;
        mapping.properties = entity.properties("properties")?;
        analysis.entities.push(mapping);
    }

    // (entity key, normalized threat name) -> index into analysis.threats
    let mut emitted: BTreeMap<(String, String), usize> = BTreeMap::new();

    for risk in root.array("risks")? {
        let entity = risk.str("entity")?;
        if analysis.entity(&entity).is_none() {
            return Err(risk.error_at("entity", format!("unknown entity '{}'", entity)));
        }
        let threat_name = risk.str("threat")?;
        let normalized = normalize_name(&threat_name);
        if normalized.is_empty() {
            return Err(risk.error_at("threat", "threat name has no usable characters"));
        }

        let score_nodes = risk.array("scores")?;
        if score_nodes.is_empty() {
            return Err(risk.error_at("scores", "at least one score is required"));
        }
        let scores = score_nodes.iter().map(score_value).collect::<Result<Vec<_>>>()?;

        let severity = if risk.get("severity").is_some() {
            risk.severity("severity", Severity::Medium)?
        } else {
            implied_severity(&scores).unwrap_or(Severity::Medium)
        };

        let threat_id = format!("{}::{}", entity, normalized);
        let key = (entity.clone(), normalized);
        match emitted.get(&key).copied() {
            Some(i) => {
                let threat = &mut analysis.threats[i];
                threat.severity = threat.severity.max(severity);
            }
            None => {
                emitted.insert(key, analysis.threats.len());
                analysis.threats.push(ThreatRecord {
                    id: threat_id.clone(),
                    name: threat_name,
                    target: RecordTarget::Entity(entity.clone()),
                    category: risk.opt_str("category")?,
                    severity,
                    status: ThreatStatus::Present,
                    reference: risk.opt_first_str(&["ref", "reference"])?,
                });
            }
        }

        analysis.risks.push(RiskRecord {
            id: risk.str("id")?,
            entity: Some(entity),
            threat: Some(threat_id),
            scores,
        });
    }

    Ok(analysis)
}
