//! Integration tests for the synthesis engine
//!
//! Runs whole synthesis passes over mixed-framework fixtures: import,
//! resolution, gaps, conflicts and unified scoring together.

use std::collections::BTreeSet;

use aingle_synthesis::{
    AdapterRegistry, ConflictAttribute, ConflictBasis, Criticality, EditDistanceSimilarity,
    EntityCategory, EntityMapping, EntityResolver, ErrorKind, GapKind, InMemoryModelProvider,
    NameSimilarity, RawSource, RecordRef, ResolverConfig, Severity, SynthesisConfig, Synthesizer,
    SystemEntity, SystemModel, SystemModelProvider, ThreatStatus,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn system_model() -> SystemModel {
    SystemModel::new(vec![
        SystemEntity::new("ent-auth", "Authentication Service", EntityCategory::Software)
            .with_criticality(Criticality::High),
        SystemEntity::new("ent-db", "Customer Database", EntityCategory::Software),
        SystemEntity::new("ent-vault", "Key Vault", EntityCategory::Hardware)
            .with_criticality(Criticality::Critical),
    ])
}

fn stride_catalog() -> Value {
    json!({
        "format": "dfd-threat-catalog",
        "elements": [
            {"id": "u1", "name": "Customer", "type": "external_entity"},
            {"id": "p1", "name": "Auth Service", "type": "process"},
            {"id": "d1", "name": "Customer Database", "type": "data_store"}
        ],
        "flows": [{"id": "f1", "from": "u1", "to": "p1", "label": "login"}],
        "threats": [
            {"id": "t1", "target": "p1", "title": "Credential stuffing", "severity": "high"},
            {"id": "t2", "target": "f1", "title": "Session hijack"},
            {"id": "t3", "target": "d1", "title": "SQL injection", "severity": "critical"}
        ],
        "mitigations": [
            {"id": "m1", "name": "Rate limiting", "threats": ["t1"], "effectiveness": 0.7,
             "categories": ["authentication"]}
        ]
    })
}

fn scorecard(framework: &str, score: Value) -> Value {
    json!({
        "format": "risk-scorecard",
        "framework": framework,
        "entities": [{"id": "e1", "name": "Authentication Service", "category": "software"}],
        "risks": [{"id": "r1", "entity": "e1", "threat": "Credential Stuffing", "scores": [score]}]
    })
}

fn sources() -> Vec<RawSource> {
    vec![
        RawSource::new("src-a", stride_catalog()),
        RawSource::new("src-b", scorecard("dread", json!({"method": "percent", "value": 92}))),
        RawSource::new(
            "src-o",
            scorecard("octave", json!({"method": "qualitative", "label": "critical"})),
        ),
    ]
}

fn malformed_source() -> RawSource {
    let mut payload = stride_catalog();
    payload["threats"][2]
        .as_object_mut()
        .unwrap()
        .remove("target");
    RawSource::new("src-c", payload)
}

fn synthesizer() -> Synthesizer {
    Synthesizer::new(SynthesisConfig::default()).unwrap()
}

// ============================================================================
// Determinism and symmetry
// ============================================================================

#[test]
fn test_repeated_runs_are_byte_identical() {
    init_logging();
    let synthesizer = synthesizer();
    let model = system_model();

    let first = synthesizer.synthesize(&sources(), &model).unwrap().to_json().unwrap();
    let second = synthesizer.synthesize(&sources(), &model).unwrap().to_json().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_source_order_does_not_change_findings() {
    let synthesizer = synthesizer();
    let model = system_model();

    let forward = synthesizer.synthesize(&sources(), &model).unwrap();
    let mut reversed_sources = sources();
    reversed_sources.reverse();
    let reversed = synthesizer.synthesize(&reversed_sources, &model).unwrap();

    assert!(!forward.conflicts.is_empty());
    assert_eq!(forward.conflicts, reversed.conflicts);
    assert_eq!(forward.gaps, reversed.gaps);
    assert_eq!(forward.risk_scores, reversed.risk_scores);
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_auth_service_variants_resolve_to_same_entity() {
    let result = synthesizer().synthesize(&sources(), &system_model()).unwrap();

    let catalog = result.mapping("src-a/p1").unwrap();
    let card = result.mapping("src-b/e1").unwrap();
    assert_eq!(catalog.canonical_id.as_deref(), Some("ent-auth"));
    assert_eq!(card.canonical_id.as_deref(), Some("ent-auth"));
    assert!(catalog.confidence >= 0.6);
    assert!(catalog.confidence < card.confidence);
}

#[test]
fn test_resolution_is_monotonic_in_name_similarity() {
    let resolver = EntityResolver::new(ResolverConfig::default());
    let similarity = EditDistanceSimilarity;
    let entity = SystemEntity::new("ent-auth", "Authentication Service", EntityCategory::Software);

    let mut pairs: Vec<(f64, f64)> = [
        "Zebra Feed",
        "Authorization Gateway",
        "Auth Svc",
        "Auth Service",
        "Authentication Svc",
        "Authentication Service",
    ]
    .iter()
    .map(|name| {
        let mapping =
            EntityMapping::new("src", "k", *name).with_category(Some(EntityCategory::Software));
        (similarity.similarity(name, &entity.name), resolver.score(&mapping, &entity))
    })
    .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    for window in pairs.windows(2) {
        assert!(window[0].1 <= window[1].1 + 1e-12, "{:?}", window);
    }
}

#[test]
fn test_unresolved_entity_becomes_proposal() {
    let provider = InMemoryModelProvider::new(system_model());
    let result = synthesizer()
        .synthesize_from_provider(&sources(), &provider)
        .unwrap();

    let customer = result.mapping("src-a/u1").unwrap();
    assert!(customer.canonical_id.is_none());
    assert!(result.proposals.iter().any(|p| p.normalized_name == "customer"));

    // proposals are queued, never applied
    assert_eq!(provider.system_model().unwrap(), system_model());
    assert!(provider
        .pending_proposals()
        .unwrap()
        .iter()
        .any(|p| p.normalized_name == "customer"));
}

// ============================================================================
// Threats
// ============================================================================

#[test]
fn test_no_threat_is_lost() {
    let raws = sources();
    let result = synthesizer().synthesize(&raws, &system_model()).unwrap();

    let merged: BTreeSet<&RecordRef> =
        result.threats.iter().flat_map(|t| t.members.iter()).collect();
    let registry = AdapterRegistry::with_builtin_adapters();
    let mut inputs = 0;
    for analysis in registry.import_all(&raws).into_iter().flatten() {
        for threat in &analysis.threats {
            inputs += 1;
            assert!(
                merged.contains(&analysis.record_ref(&threat.id)),
                "threat {}#{} missing from output",
                analysis.source_id,
                threat.id
            );
        }
    }
    assert_eq!(merged.len(), inputs);
}

#[test]
fn test_threats_merge_across_frameworks() {
    let result = synthesizer().synthesize(&sources(), &system_model()).unwrap();

    let merged = result.threat("entity:ent-auth#credential stuffing").unwrap();
    assert_eq!(merged.members.len(), 3);
    assert_eq!(merged.status, ThreatStatus::Present);
    let frameworks: Vec<&str> = merged.frameworks.iter().map(|f| f.as_str()).collect();
    assert_eq!(frameworks, vec!["dread", "octave", "stride"]);
    // 100 / 75 / 50 across frameworks disagrees beyond tolerance
    assert_eq!(merged.conflicts.len(), 1);

    let flow = result
        .threat("flow:unresolved:src-a/u1->entity:ent-auth#session hijack")
        .unwrap();
    assert_eq!(flow.members, vec![RecordRef::new("src-a", "t2")]);
}

// ============================================================================
// Conflicts and scoring
// ============================================================================

#[test]
fn test_categorical_rating_survives_numeric_blend() {
    let result = synthesizer().synthesize(&sources(), &system_model()).unwrap();
    let item = "entity:ent-auth#credential stuffing";

    let conflict = result
        .conflicts
        .iter()
        .find(|c| c.attribute == ConflictAttribute::Score && c.subject == item)
        .unwrap();
    assert_eq!(conflict.basis, ConflictBasis::ScaleMismatch);
    assert_eq!(conflict.frameworks.len(), 2);
    assert_eq!(conflict.resolution.label.as_deref(), Some("critical"));

    // octave (0.9) said critical = 100, dread (0.8) said 92
    let expected = (0.9 * 100.0 + 0.8 * 92.0) / 1.7;
    let value = conflict.resolution.value.unwrap();
    assert!((value - expected).abs() < 1e-9);

    let score = &result.risk_scores[item];
    assert_eq!(score.conflict.as_deref(), Some(conflict.id.as_str()));
    assert_eq!(score.label.as_deref(), Some("critical"));
    assert!((score.score - expected).abs() < 1e-9);
    assert_eq!(score.level, Severity::Critical);
}

#[test]
fn test_conflicts_need_two_frameworks() {
    let raws = vec![
        RawSource::new("src-b", scorecard("dread", json!({"method": "percent", "value": 92}))),
        RawSource::new("src-d", scorecard("dread", json!({"method": "percent", "value": 10}))),
    ];
    let result = synthesizer().synthesize(&raws, &system_model()).unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(result.risk_scores.len(), 1);
}

#[test]
fn test_missing_normalization_is_fatal() {
    let raws = vec![RawSource::new(
        "src-b",
        scorecard("dread", json!({"method": "fair", "value": 3})),
    )];
    let err = synthesizer().synthesize(&raws, &system_model()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

// ============================================================================
// Gaps
// ============================================================================

#[test]
fn test_uncovered_critical_entity_yields_one_critical_gap() {
    let result = synthesizer().synthesize(&sources(), &system_model()).unwrap();

    let vault: Vec<_> = result
        .gaps
        .iter()
        .filter(|g| g.entities.iter().any(|e| e == "ent-vault"))
        .collect();
    assert_eq!(vault.len(), 1);
    assert_eq!(vault[0].kind, GapKind::EntityCoverage);
    assert_eq!(vault[0].severity, Severity::Critical);
    assert_eq!(vault[0].rule, "entity_coverage");
    assert!(vault[0].mappings.is_empty());
}

#[test]
fn test_uncontrolled_threats_are_gaps() {
    let result = synthesizer().synthesize(&sources(), &system_model()).unwrap();

    let control_gaps: Vec<_> = result
        .gaps
        .iter()
        .filter(|g| g.kind == GapKind::ControlCoverage)
        .collect();
    let about = |record: &str| {
        control_gaps
            .iter()
            .any(|g| g.records.contains(&RecordRef::new("src-a", record)))
    };
    assert!(!about("t1"), "rate limiting covers credential stuffing");
    assert!(about("t2"));
    assert!(about("t3"));
}

// ============================================================================
// Partial failure and roll-ups
// ============================================================================

#[test]
fn test_malformed_source_is_skipped() {
    init_logging();
    let mut raws = sources();
    raws.push(malformed_source());
    let result = synthesizer().synthesize(&raws, &system_model()).unwrap();

    assert_eq!(result.skipped_sources.len(), 1);
    let skipped = &result.skipped_sources[0];
    assert_eq!(skipped.source_id, "src-c");
    assert_eq!(skipped.kind, ErrorKind::MalformedSource);
    assert_eq!(skipped.field_path.as_deref(), Some("threats[2].target"));

    let clean = synthesizer().synthesize(&sources(), &system_model()).unwrap();
    assert_eq!(result.sources.len(), 3);
    assert_eq!(result.conflicts, clean.conflicts);
    assert_eq!(result.gaps, clean.gaps);
}

#[test]
fn test_unrecognized_source_is_skipped() {
    let mut raws = sources();
    raws.push(RawSource::new("src-x", json!({"spreadsheet": true})));
    let result = synthesizer().synthesize(&raws, &system_model()).unwrap();

    assert_eq!(result.skipped_sources[0].kind, ErrorKind::UnrecognizedFormat);
    assert_eq!(result.skipped_sources[0].field_path, None);
}

#[test]
fn test_completeness_bounds() {
    let result = synthesizer().synthesize(&sources(), &system_model()).unwrap();
    // auth (high, 3) and db (medium, 2) have threats, vault (critical, 4) has none
    assert!((result.completeness - 5.0 / 9.0).abs() < 1e-9);
    assert!((0.0..=1.0).contains(&result.confidence));

    let model = SystemModel::new(vec![
        SystemEntity::new("ent-auth", "Authentication Service", EntityCategory::Software),
        SystemEntity::new("ent-db", "Customer Database", EntityCategory::Software)
            .with_criticality(Criticality::Critical),
    ]);
    let catalog = |format: &str| {
        json!({
            "format": format,
            "elements": [
                {"id": "p1", "name": "Authentication Service", "type": "process"},
                {"id": "d1", "name": "Customer Database", "type": "process"}
            ],
            "threats": [
                {"id": "t1", "target": "p1", "title": "Spoofed login"},
                {"id": "t2", "target": "d1", "title": "Record linkage"}
            ]
        })
    };
    let raws = vec![
        RawSource::new("tech", catalog("dfd-threat-catalog")),
        RawSource::new("privacy", catalog("privacy-threat-catalog")),
    ];
    let result = synthesizer().synthesize(&raws, &model).unwrap();
    assert_eq!(result.completeness, 1.0);
}

#[test]
fn test_framework_without_threats_keeps_full_completeness() {
    let model = SystemModel::new(vec![
        SystemEntity::new("ent-auth", "Authentication Service", EntityCategory::Software),
        SystemEntity::new("ent-db", "Customer Database", EntityCategory::Software),
    ]);
    let elements = json!([
        {"id": "p1", "name": "Authentication Service", "type": "process"},
        {"id": "d1", "name": "Customer Database", "type": "process"}
    ]);
    let raws = vec![
        RawSource::new(
            "tech",
            json!({
                "format": "dfd-threat-catalog",
                "elements": elements.clone(),
                "threats": [
                    {"id": "t1", "target": "p1", "title": "Spoofed login"},
                    {"id": "t2", "target": "d1", "title": "SQL injection"}
                ]
            }),
        ),
        RawSource::new(
            "privacy",
            json!({
                "format": "privacy-threat-catalog",
                "elements": elements,
                "threats": []
            }),
        ),
    ];

    let result = synthesizer().synthesize(&raws, &model).unwrap();
    assert_eq!(result.sources.len(), 2);
    assert_eq!(result.completeness, 1.0);
}

#[test]
fn test_config_version_is_echoed() {
    let synthesizer = Synthesizer::new(SynthesisConfig::default().with_version(7)).unwrap();
    let result = synthesizer.synthesize(&sources(), &system_model()).unwrap();
    assert_eq!(result.config_version, 7);

    let json: Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
    assert_eq!(json["config_version"], json!(7));
    assert!(json["risk_scores"].is_object());
}
