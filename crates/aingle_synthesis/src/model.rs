//! Standardized Analysis Model
//!
//! The canonical schema every imported source is normalized into, plus the
//! caller-owned System Model the engine reconciles against. These types carry
//! no behavior beyond construction and lookup helpers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::similarity::normalize_name;

/// Identifier of a canonical System Model entity.
pub type EntityId = String;

/// Identifier of an imported source.
pub type SourceId = String;

/// Identifier of an entity mapping, formatted as `<source>/<key>`.
pub type MappingId = String;

macro_rules! string_tag {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new tag.
            pub fn new(tag: impl Into<String>) -> Self {
                Self(tag.into())
            }

            /// Returns the tag as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_tag!(
    /// Tag of an external export format (e.g. `dfd-threat-catalog`).
    FormatTag
);

string_tag!(
    /// Tag of the threat-modeling methodology a source came from (e.g. `stride`).
    FrameworkTag
);

/// The kind of a canonical System Model entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCategory {
    Human,
    Software,
    Hardware,
    Physical,
    Organizational,
}

impl EntityCategory {
    /// Parses a category name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "person" | "user" | "actor" => Some(EntityCategory::Human),
            "software" | "service" | "application" | "process" => Some(EntityCategory::Software),
            "hardware" | "device" => Some(EntityCategory::Hardware),
            "physical" | "facility" | "site" => Some(EntityCategory::Physical),
            "organizational" | "organisational" | "organization" | "team" => {
                Some(EntityCategory::Organizational)
            }
            _ => None,
        }
    }
}

/// How critical a System Model entity is to the system under analysis.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Criticality {
    /// Numeric rank used by the gap severity lookup (low = 1 … critical = 4).
    pub fn rank(&self) -> u8 {
        match self {
            Criticality::Low => 1,
            Criticality::Medium => 2,
            Criticality::High => 3,
            Criticality::Critical => 4,
        }
    }

    /// Parses a criticality label, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Criticality::Low),
            "medium" | "moderate" => Some(Criticality::Medium),
            "high" => Some(Criticality::High),
            "critical" => Some(Criticality::Critical),
            _ => None,
        }
    }
}

/// Severity of a threat or finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Position of this severity on the common 0–100 scale.
    pub fn score(&self) -> f64 {
        match self {
            Severity::Info => 0.0,
            Severity::Low => 25.0,
            Severity::Medium => 50.0,
            Severity::High => 75.0,
            Severity::Critical => 100.0,
        }
    }

    /// Band a 0–100 score into a severity level.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Severity::Critical
        } else if score >= 70.0 {
            Severity::High
        } else if score >= 40.0 {
            Severity::Medium
        } else if score >= 10.0 {
            Severity::Low
        } else {
            Severity::Info
        }
    }

    /// Parses a severity label, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" | "none" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" | "very high" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Returns the lowercase label of this severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of the threat landscape a framework is designed to cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageDomain {
    Technical,
    Privacy,
    Business,
    Compliance,
}

impl CoverageDomain {
    /// Returns the lowercase label of this domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageDomain::Technical => "technical",
            CoverageDomain::Privacy => "privacy",
            CoverageDomain::Business => "business",
            CoverageDomain::Compliance => "compliance",
        }
    }
}

/// The kind of a judgement-bearing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Threat,
    Control,
    Risk,
}

impl RecordKind {
    /// Returns the lowercase label of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Threat => "threat",
            RecordKind::Control => "control",
            RecordKind::Risk => "risk",
        }
    }
}

// ============================================================================
// System Model
// ============================================================================

/// A canonical component of the system under analysis. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEntity {
    pub id: EntityId,
    pub name: String,
    pub category: EntityCategory,
    #[serde(default)]
    pub criticality: Criticality,
    /// Regulated or sensitive data categories handled by this entity (e.g. `pii`).
    #[serde(default)]
    pub data_categories: BTreeSet<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl SystemEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: EntityCategory) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            criticality: Criticality::default(),
            data_categories: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn with_data_category(mut self, category: impl Into<String>) -> Self {
        self.data_categories.insert(category.into().to_ascii_lowercase());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The canonical model of the system under analysis, read-only to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemModel {
    /// Ordered canonical entities.
    pub entities: Vec<SystemEntity>,
    /// Inbound mapping counts from earlier runs, seeding the resolver's stability bias.
    #[serde(default)]
    pub prior_mappings: BTreeMap<EntityId, u32>,
}

impl SystemModel {
    pub fn new(entities: Vec<SystemEntity>) -> Self {
        Self {
            entities,
            prior_mappings: BTreeMap::new(),
        }
    }

    /// Seeds the inbound mapping counts used to break resolution ties.
    pub fn with_prior_mappings(mut self, prior: BTreeMap<EntityId, u32>) -> Self {
        self.prior_mappings = prior;
        self
    }

    /// Looks up an entity by id.
    pub fn get(&self, id: &str) -> Option<&SystemEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// ============================================================================
// Raw input
// ============================================================================

/// A raw, already-parsed export from one external analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSource {
    pub id: SourceId,
    /// Declared format; detected from the payload when absent.
    #[serde(default)]
    pub format: Option<FormatTag>,
    pub payload: Value,
}

impl RawSource {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            format: None,
            payload,
        }
    }

    pub fn with_format(mut self, format: impl Into<FormatTag>) -> Self {
        self.format = Some(format.into());
        self
    }
}

// ============================================================================
// Standardized Analysis
// ============================================================================

/// The normalized output of one import. Immutable once produced by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizedAnalysis {
    pub source_id: SourceId,
    pub format: FormatTag,
    pub framework: FrameworkTag,
    /// How structured the source format is, in `[0, 1]`.
    pub source_confidence: f64,
    pub coverage: BTreeSet<CoverageDomain>,
    pub entities: Vec<EntityMapping>,
    pub relationships: Vec<RelationshipMapping>,
    pub threats: Vec<ThreatRecord>,
    pub controls: Vec<ControlRecord>,
    pub risks: Vec<RiskRecord>,
}

impl StandardizedAnalysis {
    /// Creates an empty analysis for a source.
    pub fn new(
        source_id: impl Into<String>,
        format: impl Into<FormatTag>,
        framework: impl Into<FrameworkTag>,
        source_confidence: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            format: format.into(),
            framework: framework.into(),
            source_confidence: source_confidence.clamp(0.0, 1.0),
            coverage: BTreeSet::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            threats: Vec::new(),
            controls: Vec::new(),
            risks: Vec::new(),
        }
    }

    pub fn with_coverage(mut self, domain: CoverageDomain) -> Self {
        self.coverage.insert(domain);
        self
    }

    /// Looks up an entity mapping by its source-local key.
    pub fn entity(&self, key: &str) -> Option<&EntityMapping> {
        self.entities.iter().find(|e| e.key == key)
    }

    /// Looks up a relationship by its source-local key.
    pub fn relationship(&self, key: &str) -> Option<&RelationshipMapping> {
        self.relationships.iter().find(|r| r.key == key)
    }

    /// Looks up a threat record by its source-local id.
    pub fn threat(&self, id: &str) -> Option<&ThreatRecord> {
        self.threats.iter().find(|t| t.id == id)
    }

    /// Builds the reference to a record of this analysis.
    pub fn record_ref(&self, record_id: &str) -> RecordRef {
        RecordRef::new(self.source_id.clone(), record_id)
    }

    /// The record kinds this analysis carries at least one record of.
    pub fn record_kinds(&self) -> Vec<RecordKind> {
        let mut kinds = Vec::new();
        if !self.threats.is_empty() {
            kinds.push(RecordKind::Threat);
        }
        if !self.controls.is_empty() {
            kinds.push(RecordKind::Control);
        }
        if !self.risks.is_empty() {
            kinds.push(RecordKind::Risk);
        }
        kinds
    }
}

/// Builds the mapping id of a source-local entity key.
pub fn mapping_id(source_id: &str, key: &str) -> MappingId {
    format!("{}/{}", source_id, key)
}

/// How an entity mapping was (or was not) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Unresolved,
    Exact,
    Fuzzy,
    /// Re-pointed by the many-to-one collision policy.
    CollisionPolicy,
}

/// The best candidate found for a source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub entity_id: EntityId,
    pub score: f64,
}

/// An entity as named in a source, paired with its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapping {
    pub id: MappingId,
    /// Source-local key.
    pub key: String,
    pub source_name: String,
    #[serde(default)]
    pub category: Option<EntityCategory>,
    #[serde(default)]
    pub data_categories: BTreeSet<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub canonical_id: Option<EntityId>,
    #[serde(default)]
    pub confidence: f64,
    pub method: MatchMethod,
    #[serde(default)]
    pub best_candidate: Option<CandidateScore>,
}

impl EntityMapping {
    /// Creates an unresolved mapping as produced by an adapter.
    pub fn new(source_id: &str, key: impl Into<String>, source_name: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id: mapping_id(source_id, &key),
            key,
            source_name: source_name.into(),
            category: None,
            data_categories: BTreeSet::new(),
            properties: BTreeMap::new(),
            canonical_id: None,
            confidence: 0.0,
            method: MatchMethod::Unresolved,
            best_candidate: None,
        }
    }

    pub fn with_category(mut self, category: Option<EntityCategory>) -> Self {
        self.category = category;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.canonical_id.is_some()
    }
}

/// A relationship between two source entities (e.g. a data flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMapping {
    pub key: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// What a threat record is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum RecordTarget {
    Entity(String),
    Relationship(String),
}

/// Whether a source asserts the threat applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatStatus {
    Absent,
    Present,
}

/// A named hazard or threat reported by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub id: String,
    pub name: String,
    pub target: RecordTarget,
    /// Source-specific category tag (e.g. `spoofing`, `linkability`).
    #[serde(default)]
    pub category: Option<String>,
    pub severity: Severity,
    pub status: ThreatStatus,
    /// External catalog reference (e.g. a CAPEC id) that identifies the threat across sources.
    #[serde(default)]
    pub reference: Option<String>,
}

impl ThreatRecord {
    /// The key under which reports of the same threat are merged.
    pub fn merge_key(&self) -> String {
        match &self.reference {
            Some(r) if !r.trim().is_empty() => r.trim().to_ascii_lowercase(),
            _ => normalize_name(&self.name),
        }
    }
}

/// A named mitigation reported by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub entity: Option<String>,
    /// Ids of threat records in the same analysis this control claims to address.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Effectiveness in `[0, 1]`.
    pub effectiveness: f64,
    #[serde(default)]
    pub categories: BTreeSet<String>,
}

/// A raw score value: numeric, or text such as a label or a vector string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScore {
    Number(f64),
    Text(String),
}

/// One scoring-method value attached to a risk record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreValue {
    pub method: String,
    pub value: RawScore,
}

impl ScoreValue {
    pub fn number(method: impl Into<String>, value: f64) -> Self {
        Self {
            method: method.into(),
            value: RawScore::Number(value),
        }
    }

    pub fn text(method: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            value: RawScore::Text(value.into()),
        }
    }
}

/// A risk judgement about an entity/threat pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRecord {
    pub id: String,
    #[serde(default)]
    pub entity: Option<String>,
    /// A threat record id of the same analysis, or a free threat name.
    #[serde(default)]
    pub threat: Option<String>,
    pub scores: Vec<ScoreValue>,
}

/// A stable reference to a record of a specific source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub source_id: SourceId,
    pub record_id: String,
}

impl RecordRef {
    pub fn new(source_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_id, self.record_id)
    }
}
