//! Lenient fallback for payloads no strict adapter recognizes.
//!
//! Reads whatever entity-like array it can find (`entities`, `components`,
//! `assets` or `elements`) plus optional `threats`/`findings`,
//! `controls`/`mitigations` and `risks`. Items it cannot read are dropped with
//! a warning instead of failing the source. The result carries a low source
//! confidence and the fixed `generic` framework tag.

use log::warn;
use serde_json::Value;

use crate::adapter::fields::{has_array, parse_effectiveness, parse_status, Node};
use crate::adapter::ImportAdapter;
use crate::error::{Error, Result};
use crate::model::{
    ControlRecord, CoverageDomain, EntityCategory, EntityMapping, RawScore, RawSource,
    RecordTarget, RiskRecord, ScoreValue, Severity, StandardizedAnalysis, ThreatRecord,
    ThreatStatus,
};

pub const FORMAT: &str = "generic";
pub const FRAMEWORK: &str = "generic";

const GENERIC_CONFIDENCE: f64 = 0.3;
const DEFAULT_EFFECTIVENESS: f64 = 0.5;

const ENTITY_KEYS: [&str; 4] = ["entities", "components", "assets", "elements"];

pub fn adapter() -> ImportAdapter {
    ImportAdapter::new(
        |payload| ENTITY_KEYS.iter().any(|key| has_array(payload, key)),
        transform,
    )
    .as_fallback()
}

/// First present array among alternative keys.
fn first_array<'a>(root: &Node<'a>, keys: &[&str]) -> Vec<Node<'a>> {
    for key in keys {
        if root.get(key).is_some() {
            return match root.opt_array(key) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Generic import ignoring '{}': {}", key, e);
                    Vec::new()
                }
            };
        }
    }
    Vec::new()
}

/// A lenient string read: malformed values count as absent.
fn text(node: &Node<'_>, keys: &[&str]) -> Option<String> {
    node.opt_first_str(keys).ok().flatten()
}

fn transform(raw: &RawSource) -> Result<StandardizedAnalysis> {
    let unrecognized = || Error::UnrecognizedFormat {
        source_id: raw.id.clone(),
    };
    let root = Node::root(&raw.id, &raw.payload).map_err(|_| unrecognized())?;
    let mut analysis =
        StandardizedAnalysis::new(raw.id.as_str(), FORMAT, FRAMEWORK, GENERIC_CONFIDENCE)
            .with_coverage(CoverageDomain::Technical);

    for item in first_array(&root, &ENTITY_KEYS) {
        let name = text(&item, &["name", "title", "label"]);
        let key = text(&item, &["id", "key"]).or_else(|| name.clone());
        let (Some(key), Some(name)) = (key, name.or_else(|| text(&item, &["id", "key"]))) else {
            warn!("Dropping unreadable entity at {} in source {}", item.path(), raw.id);
            continue;
        };
        if analysis.entity(&key).is_some() {
            warn!("Dropping duplicate entity '{}' in source {}", key, raw.id);
            continue;
        }
        let category = text(&item, &["category", "type"]).and_then(|c| EntityCategory::parse(&c));
        let mut mapping = EntityMapping::new(&raw.id, key, name).with_category(category);
        mapping.data_categories = item.str_set("data_categories").unwrap_or_default();
        mapping.properties = item.properties("properties").unwrap_or_default();
        analysis.entities.push(mapping);
    }

    if analysis.entities.is_empty() {
        return Err(unrecognized());
    }

    for (i, item) in first_array(&root, &["threats", "findings"]).into_iter().enumerate() {
        let target = text(&item, &["target", "entity", "asset", "component"]);
        let Some(target) = target.filter(|t| analysis.entity(t).is_some()) else {
            warn!("Dropping threat at {} in source {}: no known target", item.path(), raw.id);
            continue;
        };
        let Some(name) = text(&item, &["title", "name", "description"]) else {
            warn!("Dropping threat at {} in source {}: no name", item.path(), raw.id);
            continue;
        };
        let severity = text(&item, &["severity", "rating"])
            .and_then(|s| Severity::parse(&s))
            .unwrap_or(Severity::Medium);
        let status = text(&item, &["status"])
            .and_then(|s| parse_status(&s))
            .unwrap_or(ThreatStatus::Present);
        let id = text(&item, &["id"]).unwrap_or_else(|| format!("threat-{}", i));
        if analysis.threat(&id).is_some() {
            warn!("Dropping duplicate threat '{}' in source {}", id, raw.id);
            continue;
        }
        analysis.threats.push(ThreatRecord {
            id,
            name,
            target: RecordTarget::Entity(target),
            category: text(&item, &["category"]),
            severity,
            status,
            reference: text(&item, &["ref", "reference", "cwe", "capec"]),
        });
    }

    for (i, item) in first_array(&root, &["controls", "mitigations"]).into_iter().enumerate() {
        let Some(name) = text(&item, &["name", "title"]) else {
            warn!("Dropping control at {} in source {}: no name", item.path(), raw.id);
            continue;
        };
        let entity = text(&item, &["entity", "asset", "component", "element"])
            .filter(|e| analysis.entity(e).is_some());
        let addresses: Vec<String> = ["addresses", "threats"]
            .iter()
            .find_map(|key| item.str_list(key, false).ok().filter(|l| !l.is_empty()))
            .unwrap_or_default()
            .into_iter()
            .filter(|id| analysis.threat(id).is_some())
            .collect();
        let effectiveness = item
            .get("effectiveness")
            .and_then(parse_effectiveness)
            .unwrap_or(DEFAULT_EFFECTIVENESS);
        analysis.controls.push(ControlRecord {
            id: text(&item, &["id"]).unwrap_or_else(|| format!("control-{}", i)),
            name,
            entity,
            addresses,
            effectiveness,
            categories: item.str_set("categories").unwrap_or_default(),
        });
    }

    for (i, item) in root.opt_array("risks").unwrap_or_default().into_iter().enumerate() {
        let scores = lenient_scores(&item);
        if scores.is_empty() {
            warn!("Dropping risk at {} in source {}: no usable score", item.path(), raw.id);
            continue;
        }
        let entity = text(&item, &["entity", "asset", "component"])
            .filter(|e| analysis.entity(e).is_some());
        analysis.risks.push(RiskRecord {
            id: text(&item, &["id"]).unwrap_or_else(|| format!("risk-{}", i)),
            entity,
            threat: text(&item, &["threat"]),
            scores,
        });
    }

    Ok(analysis)
}

/// Scores from a `scores` list, or a bare `score` read as a percentage.
fn lenient_scores(item: &Node<'_>) -> Vec<ScoreValue> {
    if let Some(Value::Number(n)) = item.get("score") {
        return n
            .as_f64()
            .map(|v| vec![ScoreValue::number("percent", v)])
            .unwrap_or_default();
    }
    let Ok(entries) = item.opt_array("scores") else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let method = text(entry, &["method"])?.to_ascii_lowercase();
            let value = match entry.get("value") {
                Some(Value::Number(n)) => RawScore::Number(n.as_f64()?),
                _ => RawScore::Text(text(entry, &["value", "vector", "label"])?),
            };
            Some(ScoreValue { method, value })
        })
        .collect()
}
