//! Name similarity strategies used by the entity resolver.
//!
//! Strategies are pure functions of two names so alternate algorithms can be
//! swapped in without touching the resolver's control flow.

use std::fmt;

/// A pure, swappable name similarity function returning a score in `[0, 1]`.
pub trait NameSimilarity: Send + Sync {
    /// Short identifier of the strategy, used in logs.
    fn name(&self) -> &'static str;

    /// Scores the similarity of two raw names.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

impl fmt::Debug for dyn NameSimilarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameSimilarity({})", self.name())
    }
}

/// Normalizes a name for comparison: lowercase, punctuation dropped, whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Edit-distance similarity with token alignment.
///
/// Takes the better of normalized Levenshtein over the whole normalized name
/// and a token-aligned score that credits abbreviation prefixes, so
/// "Auth Service" lines up with "Authentication Service".
#[derive(Debug, Clone, Copy, Default)]
pub struct EditDistanceSimilarity;

/// Score given to a token that abbreviates another by prefix.
const PREFIX_CREDIT: f64 = 0.9;

/// Shortest token that may count as an abbreviation.
const MIN_PREFIX_LEN: usize = 3;

impl EditDistanceSimilarity {
    fn token_score(a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        if short.chars().count() >= MIN_PREFIX_LEN && long.starts_with(short) {
            return PREFIX_CREDIT;
        }
        strsim::normalized_levenshtein(a, b)
    }

    fn directed(from: &[&str], to: &[&str]) -> f64 {
        let total: f64 = from
            .iter()
            .map(|t| {
                to.iter()
                    .map(|u| Self::token_score(t, u))
                    .fold(0.0, f64::max)
            })
            .sum();
        total / from.len() as f64
    }

    /// Symmetric token-aligned similarity of two normalized names.
    fn token_alignment(a: &str, b: &str) -> f64 {
        let ta: Vec<&str> = a.split_whitespace().collect();
        let tb: Vec<&str> = b.split_whitespace().collect();
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        (Self::directed(&ta, &tb) + Self::directed(&tb, &ta)) / 2.0
    }
}

impl NameSimilarity for EditDistanceSimilarity {
    fn name(&self) -> &'static str {
        "edit_distance"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let na = normalize_name(a);
        let nb = normalize_name(b);
        if na.is_empty() || nb.is_empty() {
            return 0.0;
        }
        if na == nb {
            return 1.0;
        }
        let whole = strsim::normalized_levenshtein(&na, &nb);
        whole.max(Self::token_alignment(&na, &nb)).clamp(0.0, 1.0)
    }
}

/// Jaro-Winkler similarity over normalized names.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinklerSimilarity;

impl NameSimilarity for JaroWinklerSimilarity {
    fn name(&self) -> &'static str {
        "jaro_winkler"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let na = normalize_name(a);
        let nb = normalize_name(b);
        if na.is_empty() || nb.is_empty() {
            return 0.0;
        }
        strsim::jaro_winkler(&na, &nb)
    }
}
