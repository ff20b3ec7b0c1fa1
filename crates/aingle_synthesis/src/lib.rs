//! AIngle Synthesis - Cross-Framework Security-Analysis Synthesis Engine
//!
//! This crate reconciles threat-modeling outputs produced under different
//! methodologies (data-flow threat catalogs, privacy catalogs, asset/control
//! inventories, quantitative risk scorecards) into one view of a system.
//! Each export is normalized, its entities are matched onto a caller-owned
//! System Model, and the merged picture is checked for coverage gaps and
//! cross-source disagreements before risk scores are unified on one scale.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Synthesis Orchestrator                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │               Import Adapter Registry                 │   │
//! │  │  DFD Catalog │ Privacy │ Inventory │ Scorecard │ Gen. │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                           │                                  │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │                  Entity Resolver                      │   │
//! │  │  Name Similarity │ Category │ Properties │ Collisions │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                           │                                  │
//! │  ┌────────────────┐ ┌──────────────────┐ ┌──────────────┐   │
//! │  │  Gap Detector  │ │ Conflict Resolver│ │ Risk Scorer  │   │
//! │  │  Coverage Rules│ │ Weighted Consens.│ │ Normalization│   │
//! │  └────────────────┘ └──────────────────┘ └──────────────┘   │
//! │                                                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use aingle_synthesis::{
//!     EntityCategory, RawSource, SynthesisConfig, Synthesizer, SystemEntity, SystemModel,
//! };
//! use serde_json::json;
//!
//! let model = SystemModel::new(vec![SystemEntity::new(
//!     "ent-auth",
//!     "Authentication Service",
//!     EntityCategory::Software,
//! )]);
//!
//! let source = RawSource::new("stride-review", json!({
//!     "format": "dfd-threat-catalog",
//!     "elements": [{"id": "p1", "name": "Auth Service", "type": "process"}],
//!     "threats": [{"id": "t1", "target": "p1", "title": "Credential stuffing"}]
//! }));
//!
//! let synthesizer = Synthesizer::new(SynthesisConfig::default())?;
//! let result = synthesizer.synthesize(&[source], &model)?;
//! println!("{}", result.to_json()?);
//! ```

pub mod adapter;
pub mod config;
pub mod conflict;
pub mod error;
pub mod gap;
pub mod index;
pub mod model;
pub mod provider;
pub mod resolver;
pub mod scoring;
pub mod similarity;
pub mod synthesis;

// Re-exports
pub use adapter::{AdapterRegistry, ImportAdapter};
pub use config::{
    ConflictConfig, ExpertiseWeights, GapConfig, ResolverConfig, ScoringConfig, SynthesisConfig,
};
pub use conflict::{Conflict, ConflictAttribute, ConflictBasis, ConflictResolver, Resolution};
pub use error::{Error, ErrorKind, Result};
pub use gap::{BuiltinGapRules, Gap, GapContext, GapDetector, GapKind, GapRule};
pub use model::{
    ControlRecord, Criticality, EntityCategory, EntityMapping, FormatTag, FrameworkTag,
    MatchMethod, RawScore, RawSource, RecordRef, RiskRecord, ScoreValue, Severity,
    StandardizedAnalysis, SystemEntity, SystemModel, ThreatRecord, ThreatStatus,
};
pub use provider::{InMemoryModelProvider, SystemModelProvider};
pub use resolver::{ElementRef, EntityProposal, EntityResolver, ResolutionCollision};
pub use scoring::{Normalization, UnifiedRiskScorer, UnifiedScore};
pub use similarity::{EditDistanceSimilarity, JaroWinklerSimilarity, NameSimilarity};
pub use synthesis::{MergedThreat, SkippedSource, SynthesisResult, Synthesizer};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
