//! Asset/control inventories (OCTAVE-style).
//!
//! ```json
//! {
//!   "format": "asset-control-inventory",
//!   "assets": [{"id": "a1", "name": "Customer Database", "category": "software",
//!               "criticality": "critical", "data_categories": ["pii"]}],
//!   "relationships": [{"from": "a1", "to": "a2", "label": "replicates to"}],
//!   "concerns": [{"id": "c1", "asset": "a1", "title": "Data exfiltration",
//!                 "severity": "high", "status": "open"}],
//!   "controls": [{"id": "k1", "name": "Field encryption", "asset": "a1",
//!                 "addresses": ["c1"], "effectiveness": 0.7,
//!                 "categories": ["data-protection"]}],
//!   "risks": [{"id": "r1", "asset": "a1", "concern": "c1", "impact": 5, "likelihood": 4}]
//! }
//! ```
//!
//! Risk rows score with the `impact_likelihood` method (impact × likelihood on 1–25).

use serde_json::Value;

use crate::adapter::fields::{has_array, has_signature, Node};
use crate::adapter::ImportAdapter;
use crate::error::Result;
use crate::model::{
    ControlRecord, CoverageDomain, EntityCategory, EntityMapping, RawSource, RecordTarget,
    RelationshipMapping, RiskRecord, ScoreValue, Severity, StandardizedAnalysis, ThreatRecord,
};

pub const FORMAT: &str = "asset-control-inventory";

const INVENTORY_CONFIDENCE: f64 = 0.85;
const DEFAULT_EFFECTIVENESS: f64 = 0.5;

pub fn adapter() -> ImportAdapter {
    ImportAdapter::new(
        |payload| {
            has_signature(payload, FORMAT)
                || (has_array(payload, "assets") && has_array(payload, "controls"))
        },
        transform,
    )
    .with_priority(90)
}

fn factor(node: &Node<'_>, key: &str) -> Result<f64> {
    match node.opt_number(key)? {
        Some(v) if (1.0..=5.0).contains(&v) => Ok(v),
        Some(v) => Err(node.error_at(key, format!("expected a rating in 1..=5, got {}", v))),
        None => Err(node.error_at(key, "missing required field")),
    }
}

fn transform(raw: &RawSource) -> Result<StandardizedAnalysis> {
    let root = Node::root(&raw.id, &raw.payload)?;
    let framework = root.opt_str("framework")?.unwrap_or_else(|| "octave".to_string());
    let mut analysis =
        StandardizedAnalysis::new(raw.id.as_str(), FORMAT, framework, INVENTORY_CONFIDENCE)
            .with_coverage(CoverageDomain::Business)
            .with_coverage(CoverageDomain::Compliance);

    for asset in root.array("assets")? {
        let id = asset.str("id")?;
        if analysis.entity(&id).is_some() {
            return Err(asset.error_at("id", format!("duplicate asset id '{}'", id)));
        }
        let category = match asset.opt_str("category")? {
            None => None,
            Some(c) => Some(EntityCategory::parse(&c).ok_or_else(|| {
                asset.error_at("category", format!("unknown asset category '{}'", c))
            })?),
        };
        let mut mapping =
            EntityMapping::new(&raw.id, id, asset.str("name")?).with_category(category);
        mapping.data_categories = asset.str_set("data_categories")?;
        mapping.properties = asset.properties("properties")?;
        if let Some(criticality) = asset.opt_str("criticality")? {
            mapping
                .properties
                .insert("criticality".to_string(), Value::String(criticality.to_ascii_lowercase()));
        }
        analysis.entities.push(mapping);
    }

    for (i, rel) in root.opt_array("relationships")?.into_iter().enumerate() {
        let from = rel.str("from")?;
        let to = rel.str("to")?;
        for (field, end) in [("from", &from), ("to", &to)] {
            if analysis.entity(end).is_none() {
                return Err(rel.error_at(field, format!("unknown asset '{}'", end)));
            }
        }
        analysis.relationships.push(RelationshipMapping {
            key: rel.opt_str("id")?.unwrap_or_else(|| format!("rel-{}", i)),
            from,
            to,
            label: rel.opt_str("label")?,
        });
    }

    for concern in root.opt_array("concerns")? {
        let asset = concern.str("asset")?;
        if analysis.entity(&asset).is_none() {
            return Err(concern.error_at("asset", format!("unknown asset '{}'", asset)));
        }
        analysis.threats.push(ThreatRecord {
            id: concern.str("id")?,
            name: concern.first_str(&["title", "name"])?,
            target: RecordTarget::Entity(asset),
            category: concern.opt_str("category")?,
            severity: concern.severity("severity", Severity::Medium)?,
            status: concern.status("status")?,
            reference: concern.opt_first_str(&["ref", "reference"])?,
        });
    }

    for control in root.array("controls")? {
        let entity = control.opt_str("asset")?;
        if let Some(key) = &entity {
            if analysis.entity(key).is_none() {
                return Err(control.error_at("asset", format!("unknown asset '{}'", key)));
            }
        }
        let addresses = control.str_list("addresses", false)?;
        for (i, concern_id) in addresses.iter().enumerate() {
            if analysis.threat(concern_id).is_none() {
                return Err(control.error_at(
                    &format!("addresses[{}]", i),
                    format!("unknown concern '{}'", concern_id),
                ));
            }
        }
        analysis.controls.push(ControlRecord {
            id: control.str("id")?,
            name: control.str("name")?,
            entity,
            addresses,
            effectiveness: control.effectiveness("effectiveness", DEFAULT_EFFECTIVENESS)?,
            categories: control.str_set("categories")?,
        });
    }

    for risk in root.opt_array("risks")? {
        let asset = risk.str("asset")?;
        if analysis.entity(&asset).is_none() {
            return Err(risk.error_at("asset", format!("unknown asset '{}'", asset)));
        }
        let concern = risk.opt_str("concern")?;
        if let Some(c) = &concern {
            if analysis.threat(c).is_none() {
                return Err(risk.error_at("concern", format!("unknown concern '{}'", c)));
            }
        }
        let impact = factor(&risk, "impact")?;
        let likelihood = factor(&risk, "likelihood")?;
        analysis.risks.push(RiskRecord {
            id: risk.str("id")?,
            entity: Some(asset),
            threat: concern,
            scores: vec![ScoreValue::number("impact_likelihood", impact * likelihood)],
        });
    }

    Ok(analysis)
}
