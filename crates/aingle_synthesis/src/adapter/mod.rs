//! Import Adapter Registry
//!
//! Every supported export format is an [`ImportAdapter`]: a cheap structural
//! structural check paired with a pure transform into a [`StandardizedAnalysis`]. Adapters
//! share no state, so independent sources are transformed in parallel.
//!
//! # Detection
//!
//! Checks run in priority order (highest first, ties by registration order).
//! The lenient generic adapter is registered as a fallback and is only
//! consulted once every strict adapter has declined.
//!
//! # Example
//!
//! ```rust,ignore
//! use aingle_synthesis::{AdapterRegistry, RawSource};
//! use serde_json::json;
//!
//! let registry = AdapterRegistry::with_builtin_adapters();
//! let raw = RawSource::new("src-a", json!({
//!     "format": "dfd-threat-catalog",
//!     "elements": [{"id": "p1", "name": "Auth Service", "type": "process"}],
//!     "threats": []
//! }));
//! let analysis = registry.import(&raw)?;
//! assert_eq!(analysis.framework.as_str(), "stride");
//! ```

pub(crate) mod fields;

pub mod catalog;
pub mod generic;
pub mod inventory;
pub mod scorecard;

use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info, trace};
use rayon::prelude::*;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{FormatTag, RawSource, StandardizedAnalysis};

type MatchFn = dyn Fn(&Value) -> bool + Send + Sync;
type TransformFn = dyn Fn(&RawSource) -> Result<StandardizedAnalysis> + Send + Sync;

/// A format adapter: a structural format check and a transform.
#[derive(Clone)]
pub struct ImportAdapter {
    matches: Arc<MatchFn>,
    transform: Arc<TransformFn>,
    priority: i32,
    fallback: bool,
}

impl std::fmt::Debug for ImportAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportAdapter")
            .field("matches", &"<fn>")
            .field("transform", &"<fn>")
            .field("priority", &self.priority)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl ImportAdapter {
    /// Creates an adapter from a format check and a transform.
    ///
    /// # Arguments
    ///
    /// * `matches` - Returns `true` when the payload looks like this format. Must be cheap.
    /// * `transform` - Validates the payload and normalizes it.
    pub fn new<P, T>(matches: P, transform: T) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        T: Fn(&RawSource) -> Result<StandardizedAnalysis> + Send + Sync + 'static,
    {
        Self {
            matches: Arc::new(matches),
            transform: Arc::new(transform),
            priority: 0,
            fallback: false,
        }
    }

    /// Sets the detection priority. Higher is checked first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks this adapter as a fallback, checked only after all others.
    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Runs the structural format check.
    pub fn matches(&self, payload: &Value) -> bool {
        (self.matches)(payload)
    }

    /// Runs the transform.
    pub fn transform(&self, raw: &RawSource) -> Result<StandardizedAnalysis> {
        (self.transform)(raw)
    }
}

/// Lookup table from format tag to adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: IndexMap<FormatTag, ImportAdapter>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in format, generic last.
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(catalog::DFD_FORMAT, catalog::dfd_adapter());
        registry.register(catalog::PRIVACY_FORMAT, catalog::privacy_adapter());
        registry.register(inventory::FORMAT, inventory::adapter());
        registry.register(scorecard::FORMAT, scorecard::adapter());
        registry.register(generic::FORMAT, generic::adapter());
        registry
    }

    /// Registers an adapter, replacing any adapter already registered for the tag.
    pub fn register(&mut self, tag: impl Into<FormatTag>, adapter: ImportAdapter) {
        let tag = tag.into();
        debug!("Registering adapter for format {}", tag);
        self.adapters.insert(tag, adapter);
    }

    /// Removes the adapter for a tag.
    pub fn unregister(&mut self, tag: &str) -> Option<ImportAdapter> {
        self.adapters.shift_remove(&FormatTag::new(tag))
    }

    /// Registered format tags, in registration order.
    pub fn formats(&self) -> Vec<&FormatTag> {
        self.adapters.keys().collect()
    }

    pub fn get(&self, tag: &str) -> Option<&ImportAdapter> {
        self.adapters.get(&FormatTag::new(tag))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adapters in detection order.
    fn detection_order(&self) -> Vec<(&FormatTag, &ImportAdapter)> {
        let mut ordered: Vec<_> = self.adapters.iter().collect();
        // stable sort keeps registration order among equals
        ordered.sort_by(|(_, a), (_, b)| {
            a.fallback
                .cmp(&b.fallback)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        ordered
    }

    /// Detects the format of a raw source.
    ///
    /// # Errors
    ///
    /// [`Error::UnrecognizedFormat`] when no format check, including the fallback's, accepts.
    pub fn detect(&self, raw: &RawSource) -> Result<FormatTag> {
        for (tag, adapter) in self.detection_order() {
            trace!("Probing source {} as {}", raw.id, tag);
            if adapter.matches(&raw.payload) {
                debug!("Detected format {} for source {}", tag, raw.id);
                return Ok(tag.clone());
            }
        }
        Err(Error::UnrecognizedFormat {
            source_id: raw.id.clone(),
        })
    }

    /// Transforms a raw source with the adapter registered for `tag`.
    pub fn transform(&self, tag: &FormatTag, raw: &RawSource) -> Result<StandardizedAnalysis> {
        let adapter = self
            .adapters
            .get(tag)
            .ok_or_else(|| Error::UnknownFormat(tag.to_string()))?;
        adapter.transform(raw)
    }

    /// Detects (unless declared) and transforms one raw source.
    pub fn import(&self, raw: &RawSource) -> Result<StandardizedAnalysis> {
        let tag = match &raw.format {
            Some(declared) => declared.clone(),
            None => self.detect(raw)?,
        };
        self.transform(&tag, raw)
    }

    /// Imports independent sources in parallel. Results keep the input order.
    pub fn import_all(&self, raws: &[RawSource]) -> Vec<Result<StandardizedAnalysis>> {
        info!("Importing {} sources", raws.len());
        raws.par_iter().map(|raw| self.import(raw)).collect()
    }
}
