//! Unified Risk Scorer
//!
//! Translates heterogeneous scoring methods (impact × likelihood, DREAD,
//! CVSS, qualitative labels, ...) onto one 0–100 scale using the configured
//! normalization table per method, then combines them per risk item.
//!
//! # Combination
//!
//! For each risk item, every score value of every contributing record is
//! normalized. Values are averaged per method, and the per-method means are
//! combined with the configured method weights. When the item is the subject
//! of a scoring conflict, the conflict's resolved value is used instead.

pub mod cvss;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::conflict::{Conflict, ConflictAttribute};
use crate::error::{Error, Result};
use crate::index::SynthesisIndex;
use crate::model::{RawScore, RecordRef, RiskRecord, Severity, SourceId};
use crate::resolver::{ElementRef, ResolvedAnalysis};

/// How raw values of one scoring method map onto the 0–100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Normalization {
    /// Numeric values in `[min, max]` mapped linearly.
    Linear { min: f64, max: f64 },
    /// Labels looked up in a table (case-insensitive).
    Table { entries: BTreeMap<String, f64> },
    /// CVSS v3 vectors or base scores, scaled ×10.
    Cvss,
}

impl Normalization {
    /// Checks the table is usable.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Normalization::Linear { min, max } => {
                if !min.is_finite() || !max.is_finite() || max <= min {
                    return Err(format!("linear range [{}, {}] is empty", min, max));
                }
            }
            Normalization::Table { entries } => {
                if entries.is_empty() {
                    return Err("label table is empty".to_string());
                }
                if let Some((label, v)) = entries
                    .iter()
                    .find(|(_, v)| !v.is_finite() || **v < 0.0 || **v > 100.0)
                {
                    return Err(format!("label '{}' maps outside [0, 100]: {}", label, v));
                }
            }
            Normalization::Cvss => {}
        }
        Ok(())
    }

    /// Whether this method judges with labels rather than numbers.
    pub fn is_categorical(&self) -> bool {
        matches!(self, Normalization::Table { .. })
    }

    /// Maps a raw value onto the 0–100 scale.
    pub fn normalize(&self, value: &RawScore) -> std::result::Result<f64, String> {
        match self {
            Normalization::Linear { min, max } => {
                let v = numeric(value)?;
                Ok(((v - min) / (max - min) * 100.0).clamp(0.0, 100.0))
            }
            Normalization::Table { entries } => match value {
                RawScore::Text(label) => {
                    let key = label.trim().to_lowercase();
                    entries
                        .iter()
                        .find(|(k, _)| k.to_lowercase() == key)
                        .map(|(_, v)| *v)
                        .ok_or_else(|| format!("label '{}' is not in the table", label))
                }
                RawScore::Number(n) => Err(format!("expected a label, got {}", n)),
            },
            Normalization::Cvss => {
                let base = match value {
                    RawScore::Text(text) if text.trim_start().starts_with("CVSS:") => {
                        cvss::base_score(text)?
                    }
                    other => numeric(other)?,
                };
                if !(0.0..=10.0).contains(&base) {
                    return Err(format!("CVSS base score {} outside [0, 10]", base));
                }
                Ok(base * 10.0)
            }
        }
    }
}

fn numeric(value: &RawScore) -> std::result::Result<f64, String> {
    let v = match value {
        RawScore::Number(n) => *n,
        RawScore::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("expected a number, got '{}'", text))?,
    };
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("expected a finite number, got {}", v))
    }
}

/// One risk record translated onto the common scale.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordJudgement {
    /// Method-weighted 0–100 value.
    pub value: f64,
    /// Normalized mean per method.
    pub methods: BTreeMap<String, f64>,
    /// The first label given by a table-normalized method, lowercased.
    pub label: Option<String>,
    /// Whether every method of the record is label-based.
    pub categorical_only: bool,
}

/// The synthesized score of one risk item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedScore {
    pub item: String,
    pub element: ElementRef,
    pub threat_key: String,
    /// Score on the 0–100 scale.
    pub score: f64,
    pub level: Severity,
    /// Qualitative label carried through when a source judged with one.
    pub label: Option<String>,
    pub confidence: f64,
    /// Normalized mean per method across contributing records.
    pub methods: BTreeMap<String, f64>,
    pub sources: Vec<SourceId>,
    pub records: Vec<RecordRef>,
    /// Id of the conflict that settled this item, if any.
    pub conflict: Option<String>,
}

/// Translates and combines risk scores.
#[derive(Debug, Clone)]
pub struct UnifiedRiskScorer {
    config: ScoringConfig,
}

impl UnifiedRiskScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Normalizes one score value of a method.
    pub fn normalize(&self, method: &str, value: &RawScore) -> Result<f64> {
        let table = self.config.require(method)?;
        table.normalize(value).map_err(|reason| {
            Error::Configuration(format!(
                "scoring method '{}' cannot normalize value: {}",
                method, reason
            ))
        })
    }

    /// Combines per-method means with the configured method weights.
    fn combine(&self, methods: &BTreeMap<String, f64>) -> Option<f64> {
        if methods.is_empty() {
            return None;
        }
        let total_weight: f64 = methods.keys().map(|m| self.config.method_weight(m)).sum();
        if total_weight <= 0.0 {
            return Some(methods.values().sum::<f64>() / methods.len() as f64);
        }
        let weighted: f64 = methods
            .iter()
            .map(|(m, v)| self.config.method_weight(m) * v)
            .sum();
        Some(weighted / total_weight)
    }

    fn method_means<'r>(
        &self,
        records: impl IntoIterator<Item = &'r RiskRecord>,
    ) -> Result<(BTreeMap<String, f64>, Option<String>, bool)> {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut label = None;
        let mut categorical_only = true;
        for record in records {
            for score in &record.scores {
                let normalized = self.normalize(&score.method, &score.value)?;
                trace!("{}: {} -> {:.2}", record.id, score.method, normalized);
                let entry = sums.entry(score.method.clone()).or_insert((0.0, 0));
                entry.0 += normalized;
                entry.1 += 1;

                let categorical = self.config.require(&score.method)?.is_categorical();
                categorical_only &= categorical;
                if categorical && label.is_none() {
                    if let RawScore::Text(text) = &score.value {
                        label = Some(text.trim().to_lowercase());
                    }
                }
            }
        }
        let means = sums
            .into_iter()
            .map(|(m, (sum, n))| (m, sum / n as f64))
            .collect();
        Ok((means, label, categorical_only))
    }

    /// Translates a single risk record. `None` when the record carries no scores.
    pub fn judge(&self, record: &RiskRecord) -> Result<Option<RecordJudgement>> {
        let (methods, label, categorical_only) = self.method_means(std::iter::once(record))?;
        Ok(self.combine(&methods).map(|value| RecordJudgement {
            value,
            methods,
            label,
            categorical_only,
        }))
    }

    /// Scores every risk item of a run.
    pub fn score(
        &self,
        resolved: &[ResolvedAnalysis<'_>],
        conflicts: &[Conflict],
    ) -> Result<BTreeMap<String, UnifiedScore>> {
        let index = SynthesisIndex::build(resolved);
        self.score_indexed(&index, conflicts)
    }

    pub(crate) fn score_indexed(
        &self,
        index: &SynthesisIndex<'_>,
        conflicts: &[Conflict],
    ) -> Result<BTreeMap<String, UnifiedScore>> {
        let settled: BTreeMap<&str, &Conflict> = conflicts
            .iter()
            .filter(|c| c.attribute == ConflictAttribute::Score)
            .map(|c| (c.subject.as_str(), c))
            .collect();

        let mut scores = BTreeMap::new();
        for (item, entries) in index.risk_items() {
            let (methods, label, _) = self.method_means(entries.iter().map(|e| e.record))?;
            let Some(combined) = self.combine(&methods) else {
                debug!("Risk item {} carries no scores", item);
                continue;
            };

            let sources: BTreeSet<&SourceId> =
                entries.iter().map(|e| &e.record_ref.source_id).collect();
            let corroboration = 1.0 - 0.5f64.powi(sources.len() as i32);

            let conflict = settled.get(item.as_str()).copied();
            let (score, label, confidence) = match conflict {
                Some(c) => (
                    c.resolution.value.unwrap_or(combined),
                    c.resolution.label.clone().or(label),
                    (corroboration + c.resolution.confidence) / 2.0,
                ),
                None => (combined, label, corroboration),
            };

            let mut records: Vec<RecordRef> =
                entries.iter().map(|e| e.record_ref.clone()).collect();
            records.sort();
            let first = entries[0];
            scores.insert(
                item.clone(),
                UnifiedScore {
                    item,
                    element: first.element.clone(),
                    threat_key: first.threat_key.clone(),
                    score,
                    level: Severity::from_score(score),
                    label,
                    confidence,
                    methods,
                    sources: sources.into_iter().cloned().collect(),
                    records,
                    conflict: conflict.map(|c| c.id.clone()),
                },
            );
        }
        Ok(scores)
    }
}
