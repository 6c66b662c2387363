//! Core domain records, name normalization and similarity scoring for FitRec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fitrec-core";

pub type BrandId = i64;
pub type ProductId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub id: BrandId,
    pub name: String,
}

/// Brand-scoped catalog entity. `normalized_name` is the canonical comparison key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub brand_id: BrandId,
    pub name: String,
    pub normalized_name: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// Stored canonical key, or the display name normalized on the fly when none was stored.
    pub fn canonical_key(&self) -> String {
        match self.normalized_name.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => normalize_name(&self.name),
        }
    }
}

/// User-submitted fit recommendation; the foreign reference a merge must repoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: i64,
    pub product_id: ProductId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCacheEntry {
    pub product_id: ProductId,
    pub search_query: String,
    pub result_count: u32,
    pub last_searched_at: DateTime<Utc>,
    pub stale_after: DateTime<Utc>,
    /// Bumped on every write; snippets carrying the same value form the current batch.
    pub refresh_generation: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedReviewSnippet {
    pub id: i64,
    pub product_id: ProductId,
    pub source_name: String,
    pub source_url: Option<String>,
    pub snippet: String,
    pub title: Option<String>,
    pub fetched_at: DateTime<Utc>,
    /// Latest refresh that returned this snippet.
    pub refresh_generation: i64,
}

/// Snippet handed to the store before it has been assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSnippet {
    pub source_name: String,
    pub source_url: Option<String>,
    pub snippet: String,
    pub title: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// One hit returned by an external search provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: Option<String>,
    pub snippet: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Probable duplicate within one brand. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidatePair {
    pub brand_id: BrandId,
    pub product_a: ProductId,
    pub product_b: ProductId,
    pub score: f64,
}

/// Canonical comparison key: lower-cased, everything outside `[a-z0-9\s]` stripped,
/// whitespace runs collapsed to one space, trimmed.
pub fn normalize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classic insert/delete/substitute distance over a full `(n+1) x (m+1)` table.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());

    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in table.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        table[0][j] = j;
    }

    for i in 1..=n {
        for j in 1..=m {
            let substitution = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            table[i][j] = (table[i - 1][j] + 1)
                .min(table[i][j - 1] + 1)
                .min(table[i - 1][j - 1] + substitution);
        }
    }

    table[n][m]
}

/// `1 - distance / max_len`, in `[0, 1]`. Two empty keys score 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - (edit_distance(a, b) as f64 / longest as f64)
}

/// Tokens of a canonical key that carry a digit, e.g. the "270" in "nike air max 270".
pub fn model_numbers(key: &str) -> Vec<&str> {
    key.split_whitespace()
        .filter(|token| token.chars().any(|c| c.is_ascii_digit()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_case_punctuation_and_spacing() {
        assert_eq!(normalize_name("  Nike   Air-Max 270!! "), "nike airmax 270");
        assert_eq!(normalize_name("Levi's\t501  Original"), "levis 501 original");
        assert_eq!(normalize_name("Café Racer"), "caf racer");
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("!!!"), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["Nike Air Max 270", "UNIQLO  U Crew-Neck T", "  "] {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn edit_distance_matches_reference_implementation() {
        let pairs = [
            ("", ""),
            ("", "abc"),
            ("kitten", "sitting"),
            ("nike air max 270", "nike air max 90"),
            ("flaw", "lawn"),
            ("levis 501", "levis 505"),
        ];
        for (a, b) in pairs {
            assert_eq!(edit_distance(a, b), strsim::levenshtein(a, b), "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn similarity_is_reflexive_and_symmetric() {
        let names = ["Nike Air Max 270", "nike air max 270", "Air Jordan 1 Mid", ""];
        for a in names {
            let ka = normalize_name(a);
            assert_eq!(similarity(&ka, &ka), 1.0);
            for b in names {
                let kb = normalize_name(b);
                assert_eq!(similarity(&ka, &kb), similarity(&kb, &ka));
            }
        }
    }

    #[test]
    fn similarity_is_bounded() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abc", ""), 0.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        let score = similarity("nike air max 270", "nike air max 90");
        assert!((score - 0.875).abs() < 1e-9);
    }

    #[test]
    fn canonical_key_falls_back_to_display_name() {
        let mut product = Product {
            id: 1,
            brand_id: 1,
            name: "Nike Air Max 270".into(),
            normalized_name: None,
            url: None,
            created_at: Utc::now(),
        };
        assert_eq!(product.canonical_key(), "nike air max 270");
        product.normalized_name = Some(String::new());
        assert_eq!(product.canonical_key(), "nike air max 270");
        product.normalized_name = Some("stored key".into());
        assert_eq!(product.canonical_key(), "stored key");
    }

    #[test]
    fn model_numbers_pick_digit_tokens() {
        assert_eq!(model_numbers("nike air max 270"), vec!["270"]);
        assert_eq!(model_numbers("levis 501 w32"), vec!["501", "w32"]);
        assert!(model_numbers("classic tee").is_empty());
    }
}
