//! Data-flow-diagram threat catalogs.
//!
//! Covers both the technical (`dfd-threat-catalog`, STRIDE-style) and the
//! privacy (`privacy-threat-catalog`, LINDDUN-style) exports, which share one
//! shape:
//!
//! ```json
//! {
//!   "format": "dfd-threat-catalog",
//!   "framework": "stride",
//!   "elements": [{"id": "p1", "name": "Auth Service", "type": "process",
//!                 "data_categories": ["credentials"], "properties": {}}],
//!   "flows": [{"id": "f1", "from": "u1", "to": "p1", "label": "login"}],
//!   "threats": [{"id": "t1", "target": "p1", "title": "Credential stuffing",
//!                "category": "spoofing", "severity": "high", "status": "open",
//!                "ref": "CAPEC-600"}],
//!   "mitigations": [{"id": "m1", "name": "Rate limiting", "threats": ["t1"],
//!                    "element": "p1", "effectiveness": "medium",
//!                    "categories": ["authentication"]}]
//! }
//! ```

use crate::adapter::fields::{has_array, has_signature, Node};
use crate::adapter::ImportAdapter;
use crate::error::Result;
use crate::model::{
    ControlRecord, CoverageDomain, EntityCategory, EntityMapping, RawSource, RecordTarget,
    RelationshipMapping, Severity, StandardizedAnalysis, ThreatRecord,
};

pub const DFD_FORMAT: &str = "dfd-threat-catalog";
pub const PRIVACY_FORMAT: &str = "privacy-threat-catalog";

const CATALOG_CONFIDENCE: f64 = 0.9;
const DEFAULT_EFFECTIVENESS: f64 = 0.5;

/// The technical threat catalog adapter.
pub fn dfd_adapter() -> ImportAdapter {
    ImportAdapter::new(
        |payload| {
            has_signature(payload, DFD_FORMAT)
                || (has_array(payload, "elements") && has_array(payload, "threats"))
        },
        |raw| transform(raw, DFD_FORMAT, "stride", CoverageDomain::Technical),
    )
    .with_priority(100)
}

/// The privacy threat catalog adapter.
pub fn privacy_adapter() -> ImportAdapter {
    ImportAdapter::new(
        |payload| has_signature(payload, PRIVACY_FORMAT),
        |raw| transform(raw, PRIVACY_FORMAT, "linddun", CoverageDomain::Privacy),
    )
    .with_priority(110)
}

/// Maps a diagram element type onto an entity category.
fn element_category(kind: &str) -> Option<EntityCategory> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "process" | "service" | "data_store" | "datastore" | "data store" => {
            Some(EntityCategory::Software)
        }
        "external_entity" | "external entity" | "actor" | "user" => Some(EntityCategory::Human),
        other => EntityCategory::parse(other),
    }
}

fn transform(
    raw: &RawSource,
    format: &str,
    default_framework: &str,
    coverage: CoverageDomain,
) -> Result<StandardizedAnalysis> {
    let root = Node::root(&raw.id, &raw.payload)?;
    let framework = root
        .opt_str("framework")?
        .unwrap_or_else(|| default_framework.to_string());
    let mut analysis =
        StandardizedAnalysis::new(raw.id.as_str(), format, framework, CATALOG_CONFIDENCE)
            .with_coverage(coverage);

    for element in root.array("elements")? {
        let id = element.str("id")?;
        if analysis.entity(&id).is_some() {
            return Err(element.error_at("id", format!("duplicate element id '{}'", id)));
        }
        let category = element.opt_str("type")?.and_then(|t| element_category(&t));
        let mut mapping =
            EntityMapping::new(&raw.id, id, element.str("name")?).with_category(category);
        mapping.data_categories = element.str_set("data_categories")?;
        mapping.properties = element.properties("properties")?;
        analysis.entities.push(mapping);
    }

    for flow in root.opt_array("flows")? {
        let key = flow.str("id")?;
        let from = flow.str("from")?;
        let to = flow.str("to")?;
        for (field, end) in [("from", &from), ("to", &to)] {
            if analysis.entity(end).is_none() {
                return Err(flow.error_at(field, format!("unknown element '{}'", end)));
            }
        }
        analysis.relationships.push(RelationshipMapping {
            key,
            from,
            to,
            label: flow.opt_str("label")?,
        });
    }

    for threat in root.array("threats")? {
        let id = threat.str("id")?;
        let target_key = threat.str("target")?;
        let target = if analysis.entity(&target_key).is_some() {
            RecordTarget::Entity(target_key)
        } else if analysis.relationship(&target_key).is_some() {
            RecordTarget::Relationship(target_key)
        } else {
            return Err(threat.error_at(
                "target",
                format!("unknown element or flow '{}'", target_key),
            ));
        };
        analysis.threats.push(ThreatRecord {
            id,
            name: threat.first_str(&["title", "name"])?,
            target,
            category: threat.opt_str("category")?,
            severity: threat.severity("severity", Severity::Medium)?,
            status: threat.status("status")?,
            reference: threat.opt_first_str(&["ref", "reference"])?,
        });
    }

    for mitigation in root.opt_array("mitigations")? {
        let addresses = mitigation.str_list("threats", false)?;
        for (i, threat_id) in addresses.iter().enumerate() {
            if analysis.threat(threat_id).is_none() {
                return Err(mitigation.error_at(
                    &format!("threats[{}]", i),
                    format!("unknown threat '{}'", threat_id),
                ));
            }
        }
        let entity = mitigation.opt_str("element")?;
        if let Some(key) = &entity {
            if analysis.entity(key).is_none() {
                return Err(mitigation.error_at("element", format!("unknown element '{}'", key)));
            }
        }
        analysis.controls.push(ControlRecord {
            id: mitigation.str("id")?,
            name: mitigation.str("name")?,
            entity,
            addresses,
            effectiveness: mitigation.effectiveness("effectiveness", DEFAULT_EFFECTIVENESS)?,
            categories: mitigation.str_set("categories")?,
        });
    }

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::ThreatStatus;
    use serde_json::{json, Value};

    fn payload() -> Value {
        json!({
            "format": "dfd-threat-catalog",
            "elements": [
                {"id": "u1", "name": "Customer", "type": "external_entity"},
                {"id": "p1", "name": "Auth Service", "type": "process",
                 "data_categories": ["Credentials"], "properties": {"tier": "web"}}
            ],
            "flows": [{"id": "f1", "from": "u1", "to": "p1", "label": "login"}],
            "threats": [
                {"id": "t1", "target": "p1", "title": "Credential stuffing",
                 "category": "spoofing", "severity": "high", "ref": "CAPEC-600"},
                {"id": "t2", "target": "f1", "title": "Session hijack", "status": "not_applicable"}
            ],
            "mitigations": [
                {"id": "m1", "name": "Rate limiting", "threats": ["t1"], "effectiveness": "medium",
                 "categories": ["Authentication"]}
            ]
        })
    }

    fn stride(raw: RawSource) -> Result<StandardizedAnalysis> {
        transform(&raw, DFD_FORMAT, "stride", CoverageDomain::Technical)
    }

    #[test]
    fn test_transform_catalog() {
        let raw = RawSource::new("src-a", payload());
        let analysis = transform(&raw, DFD_FORMAT, "stride", CoverageDomain::Technical).unwrap();

        assert_eq!(analysis.framework.as_str(), "stride");
        assert_eq!(analysis.source_confidence, 0.9);
        assert_eq!(analysis.entities.len(), 2);
        assert_eq!(analysis.entities[0].category, Some(EntityCategory::Human));
        assert_eq!(analysis.entities[1].id, "src-a/p1");
        assert!(analysis.entities[1].data_categories.contains("credentials"));
        assert_eq!(analysis.threats[0].reference.as_deref(), Some("CAPEC-600"));
        assert_eq!(analysis.threats[0].severity, Severity::High);
        assert_eq!(analysis.threats[1].target, RecordTarget::Relationship("f1".into()));
        assert_eq!(analysis.threats[1].status, ThreatStatus::Absent);
        assert_eq!(analysis.controls[0].effectiveness, 0.5);
        assert!(analysis.controls[0].categories.contains("authentication"));
    }

    #[test]
    fn test_missing_target_reports_path() {
        let mut bad = payload();
        bad["threats"][1].as_object_mut().unwrap().remove("target");
        let err = stride(RawSource::new("src-c", bad)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedSource);
        assert_eq!(err.field_path(), Some("threats[1].target"));
    }

    #[test]
    fn test_unknown_references_are_malformed() {
        let mut bad = payload();
        bad["mitigations"][0]["threats"] = json!(["t1", "t9"]);
        let err = stride(RawSource::new("s", bad)).unwrap_err();
        assert_eq!(err.field_path(), Some("mitigations[0].threats[1]"));

        let mut bad = payload();
        bad["flows"][0]["to"] = json!("nowhere");
        let err = stride(RawSource::new("s", bad)).unwrap_err();
        assert_eq!(err.field_path(), Some("flows[0].to"));
    }

    #[test]
    fn test_framework_override_and_format_checks() {
        let mut p = payload();
        p["framework"] = json!("pasta");
        let analysis = stride(RawSource::new("s", p.clone())).unwrap();
        assert_eq!(analysis.framework.as_str(), "pasta");

        assert!(dfd_adapter().matches(&p));
        assert!(!privacy_adapter().matches(&p));
        assert!(privacy_adapter().matches(&json!({"format": "privacy-threat-catalog"})));
    }
}
