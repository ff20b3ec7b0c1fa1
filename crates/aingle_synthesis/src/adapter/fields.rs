//! Path-tracking JSON accessors for adapter validation.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{Severity, ThreatStatus};

/// A JSON value together with its path from the payload root.
#[derive(Debug, Clone)]
pub(crate) struct Node<'a> {
    source: &'a str,
    path: String,
    value: &'a Value,
}

impl<'a> Node<'a> {
    pub fn root(source: &'a str, value: &'a Value) -> Result<Self> {
        let node = Self {
            source,
            path: String::new(),
            value,
        };
        node.object()?;
        Ok(node)
    }

    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            "$"
        } else {
            &self.path
        }
    }

    fn key_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    /// A malformed-source error at `key` below this node.
    pub fn error_at(&self, key: &str, reason: impl Into<String>) -> Error {
        Error::malformed(self.source, self.key_path(key), reason)
    }

    /// A malformed-source error at this node.
    pub fn error(&self, reason: impl Into<String>) -> Error {
        Error::malformed(self.source, self.path(), reason)
    }

    fn object(&self) -> Result<&'a Map<String, Value>> {
        self.value
            .as_object()
            .ok_or_else(|| self.error("expected an object"))
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.value.get(key).filter(|v| !v.is_null())
    }

    /// A required non-empty string.
    pub fn str(&self, key: &str) -> Result<String> {
        self.opt_str(key)?
            .ok_or_else(|| self.error_at(key, "missing required field"))
    }

    /// An optional string; present values must be non-empty strings.
    pub fn opt_str(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Some(Value::String(_)) => Err(self.error_at(key, "must not be empty")),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(self.error_at(key, "expected a string")),
        }
    }

    /// The first present of several alternative keys; required.
    pub fn first_str(&self, keys: &[&str]) -> Result<String> {
        self.opt_first_str(keys)?.ok_or_else(|| {
            self.error_at(keys.first().copied().unwrap_or_default(), "missing required field")
        })
    }

    pub fn opt_first_str(&self, keys: &[&str]) -> Result<Option<String>> {
        for key in keys {
            if let Some(s) = self.opt_str(key)? {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    /// A required array of objects.
    pub fn array(&self, key: &str) -> Result<Vec<Node<'a>>> {
        match self.get(key) {
            None => Err(self.error_at(key, "missing required array")),
            Some(_) => self.opt_array(key),
        }
    }

    /// An optional array of objects; missing means empty.
    pub fn opt_array(&self, key: &str) -> Result<Vec<Node<'a>>> {
        let items = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(self.error_at(key, "expected an array")),
        };
        let base = self.key_path(key);
        items
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let node = Node {
                    source: self.source,
                    path: format!("{}[{}]", base, i),
                    value,
                };
                node.object()?;
                Ok(node)
            })
            .collect()
    }

    /// An optional list of strings, lowercased when `lowercase` is set.
    pub fn str_list(&self, key: &str, lowercase: bool) -> Result<Vec<String>> {
        let items = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(self.error_at(key, "expected an array of strings")),
        };
        items
            .iter()
            .enumerate()
            .map(|(i, v)| match v.as_str() {
                Some(s) if lowercase => Ok(s.trim().to_ascii_lowercase()),
                Some(s) => Ok(s.trim().to_string()),
                None => Err(self.error_at(&format!("{}[{}]", key, i), "expected a string")),
            })
            .collect()
    }

    pub fn str_set(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(self.str_list(key, true)?.into_iter().collect())
    }

    /// An optional free-form property object.
    pub fn properties(&self, key: &str) -> Result<BTreeMap<String, Value>> {
        match self.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => {
                Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            Some(_) => Err(self.error_at(key, "expected an object")),
        }
    }

    pub fn opt_number(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.error_at(key, "expected a number")),
        }
    }

    /// An optional severity label, defaulting when absent.
    pub fn severity(&self, key: &str, default: Severity) -> Result<Severity> {
        match self.opt_str(key)? {
            None => Ok(default),
            Some(label) => Severity::parse(&label)
                .ok_or_else(|| self.error_at(key, format!("unknown severity '{}'", label))),
        }
    }

    /// An optional threat status, defaulting to present.
    pub fn status(&self, key: &str) -> Result<ThreatStatus> {
        match self.opt_str(key)? {
            None => Ok(ThreatStatus::Present),
            Some(label) => parse_status(&label)
                .ok_or_else(|| self.error_at(key, format!("unknown status '{}'", label))),
        }
    }

    /// An optional control effectiveness, as a number in `[0, 1]` or a label.
    pub fn effectiveness(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => parse_effectiveness(value)
                .ok_or_else(|| self.error_at(key, "expected a number in [0, 1] or a rating label")),
        }
    }
}

/// Parses a threat status label.
pub(crate) fn parse_status(label: &str) -> Option<ThreatStatus> {
    match label.trim().to_ascii_lowercase().as_str() {
        "open" | "present" | "confirmed" | "mitigated" | "accepted" | "identified" => {
            Some(ThreatStatus::Present)
        }
        "not_applicable" | "not applicable" | "n/a" | "absent" | "rejected" | "false_positive" => {
            Some(ThreatStatus::Absent)
        }
        _ => None,
    }
}

/// Parses a control effectiveness value.
pub(crate) fn parse_effectiveness(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| (0.0..=1.0).contains(v)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(0.0),
            "low" | "weak" => Some(0.25),
            "medium" | "partial" | "moderate" => Some(0.5),
            "high" | "strong" => Some(0.85),
            "full" | "complete" => Some(1.0),
            _ => None,
        },
        _ => None,
    }
}

/// Whether the payload declares the given format tag.
pub(crate) fn has_signature(payload: &Value, tag: &str) -> bool {
    payload.get("format").and_then(Value::as_str) == Some(tag)
}

/// Whether the payload has an array under `key`.
pub(crate) fn has_array(payload: &Value, key: &str) -> bool {
    payload.get(key).is_some_and(Value::is_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths_in_errors() {
        let payload = json!({"threats": [{"id": "t1"}, {"id": "t2", "target": 4.5, "title": ""}]});
        let root = Node::root("src", &payload).unwrap();
        let threats = root.array("threats").unwrap();
        let err = threats[0].str("target").unwrap_err();
        assert_eq!(err.field_path(), Some("threats[0].target"));
        let err = threats[1].str("title").unwrap_err();
        assert_eq!(err.field_path(), Some("threats[1].title"));
    }

    #[test]
    fn test_missing_array() {
        let payload = json!({});
        let root = Node::root("src", &payload).unwrap();
        assert_eq!(
            root.array("elements").unwrap_err().field_path(),
            Some("elements")
        );
        assert!(root.opt_array("flows").unwrap().is_empty());
    }

    #[test]
    fn test_root_must_be_object() {
        let payload = json!([1, 2]);
        let err = Node::root("src", &payload).unwrap_err();
        assert_eq!(err.field_path(), Some("$"));
    }

    #[test]
    fn test_effectiveness_and_status() {
        assert_eq!(parse_effectiveness(&json!("High")), Some(0.85));
        assert_eq!(parse_effectiveness(&json!(0.3)), Some(0.3));
        assert_eq!(parse_effectiveness(&json!(3)), None);
        assert_eq!(parse_status("Not_Applicable"), Some(ThreatStatus::Absent));
        assert_eq!(parse_status("mitigated"), Some(ThreatStatus::Present));
        assert_eq!(parse_status("maybe"), None);
    }

    #[test]
    fn test_string_lists() {
        let payload = json!({"data_categories": ["PII", " phi "], "bad": [1]});
        let root = Node::root("src", &payload).unwrap();
        let set = root.str_set("data_categories").unwrap();
        assert!(set.contains("pii") && set.contains("phi"));
        assert_eq!(root.str_list("bad", false).unwrap_err().field_path(), Some("bad[0]"));
    }
}
