//! CVSS v3.x base score calculation.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

const VECTOR_PATTERN: &str = r"^CVSS:3\.[01]((?:/[A-Z]{1,2}:[A-Z])+)$";

fn vector_regex() -> std::result::Result<&'static Regex, String> {
    static REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(VECTOR_PATTERN))
        .as_ref()
        .map_err(|e| e.to_string())
}

/// Whether the impact of a vulnerability reaches beyond its security scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Unchanged,
    Changed,
}

/// The base metric group of a CVSS v3 vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvssVector {
    attack_vector: f64,
    attack_complexity: f64,
    privileges_required: f64,
    user_interaction: f64,
    scope: Scope,
    confidentiality: f64,
    integrity: f64,
    availability: f64,
}

impl CvssVector {
    /// Parses a vector string such as `CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H`.
    pub fn parse(vector: &str) -> std::result::Result<Self, String> {
        let re = vector_regex()?;
        let captures = re
            .captures(vector.trim())
            .ok_or_else(|| format!("not a CVSS v3 vector: '{}'", vector))?;
        let body = captures.get(1).map(|m| m.as_str()).unwrap_or_default();

        let mut metrics: BTreeMap<&str, &str> = BTreeMap::new();
        for part in body.split('/').filter(|p| !p.is_empty()) {
            if let Some((key, value)) = part.split_once(':') {
                if metrics.insert(key, value).is_some() {
                    return Err(format!("metric {} repeated", key));
                }
            }
        }

        let metric = |key: &str| lookup(&metrics, key);
        let invalid =
            |key: &str, value: &str| format!("invalid value {} for metric {}", value, key);

        let scope = match metric("S")? {
            "U" => Scope::Unchanged,
            "C" => Scope::Changed,
            other => return Err(invalid("S", other)),
        };
        let attack_vector = match metric("AV")? {
            "N" => 0.85,
            "A" => 0.62,
            "L" => 0.55,
            "P" => 0.2,
            other => return Err(invalid("AV", other)),
        };
        let attack_complexity = match metric("AC")? {
            "L" => 0.77,
            "H" => 0.44,
            other => return Err(invalid("AC", other)),
        };
        let privileges_required = match (metric("PR")?, scope) {
            ("N", _) => 0.85,
            ("L", Scope::Unchanged) => 0.62,
            ("L", Scope::Changed) => 0.68,
            ("H", Scope::Unchanged) => 0.27,
            ("H", Scope::Changed) => 0.5,
            (other, _) => return Err(invalid("PR", other)),
        };
        let user_interaction = match metric("UI")? {
            "N" => 0.85,
            "R" => 0.62,
            other => return Err(invalid("UI", other)),
        };
        let cia = |key: &str| -> std::result::Result<f64, String> {
            match metric(key)? {
                "H" => Ok(0.56),
                "L" => Ok(0.22),
                "N" => Ok(0.0),
                other => Err(invalid(key, other)),
            }
        };

        Ok(Self {
            attack_vector,
            attack_complexity,
            privileges_required,
            user_interaction,
            scope,
            confidentiality: cia("C")?,
            integrity: cia("I")?,
            availability: cia("A")?,
        })
    }

    /// The base score on the 0–10 scale.
    pub fn base_score(&self) -> f64 {
        let iss = 1.0
            - (1.0 - self.confidentiality) * (1.0 - self.integrity) * (1.0 - self.availability);
        let impact = match self.scope {
            Scope::Unchanged => 6.42 * iss,
            Scope::Changed => 7.52 * (iss - 0.029) - 3.25 * (iss - 0.02).powi(15),
        };
        if impact <= 0.0 {
            return 0.0;
        }
        let exploitability = 8.22
            * self.attack_vector
            * self.attack_complexity
            * self.privileges_required
            * self.user_interaction;
        match self.scope {
            Scope::Unchanged => roundup((impact + exploitability).min(10.0)),
            Scope::Changed => roundup((1.08 * (impact + exploitability)).min(10.0)),
        }
    }
}

fn lookup<'v>(
    metrics: &BTreeMap<&str, &'v str>,
    key: &str,
) -> std::result::Result<&'v str, String> {
    metrics
        .get(key)
        .copied()
        .ok_or_else(|| format!("missing base metric {}", key))
}

/// Rounds up to one decimal, avoiding floating point artifacts.
fn roundup(value: f64) -> f64 {
    let int_input = (value * 100_000.0).round() as i64;
    if int_input % 10_000 == 0 {
        int_input as f64 / 100_000.0
    } else {
        ((int_input / 10_000) as f64 + 1.0) / 10.0
    }
}

/// Parses a vector and returns its base score.
pub fn base_score(vector: &str) -> std::result::Result<f64, String> {
    CvssVector::parse(vector).map(|v| v.base_score())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_base_scores() {
        assert_eq!(
            base_score("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H").unwrap(),
            9.8
        );
        assert_eq!(
            base_score("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:C/C:H/I:H/A:H").unwrap(),
            10.0
        );
        assert_eq!(
            base_score("CVSS:3.0/AV:L/AC:L/PR:L/UI:N/S:U/C:H/I:N/A:N").unwrap(),
            5.5
        );
    }

    #[test]
    fn test_no_impact_scores_zero() {
        assert_eq!(
            base_score("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:N/I:N/A:N").unwrap(),
            0.0
        );
    }

    #[test]
    fn test_metric_order_does_not_matter() {
        assert_eq!(
            base_score("CVSS:3.1/A:H/I:H/C:H/S:U/UI:N/PR:N/AC:L/AV:N").unwrap(),
            9.8
        );
    }

    #[test]
    fn test_invalid_vectors() {
        assert!(base_score("AV:N/AC:L").is_err());
        assert!(base_score("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H").is_err());
        assert!(base_score("CVSS:3.1/AV:X/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H").is_err());
        assert!(base_score("CVSS:2.0/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H").is_err());
    }

    #[test]
    fn test_roundup() {
        assert_eq!(roundup(4.02), 4.1);
        assert_eq!(roundup(4.0), 4.0);
    }
}
