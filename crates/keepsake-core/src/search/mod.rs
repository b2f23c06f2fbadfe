//! Search primitives
//!
//! - HNSW vector index (USearch) keyed by content hash
//! - FTS5 query sanitization for the lexical path
//! - Score fusion for hybrid lexical + vector search

#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
mod vector;

#[cfg(feature = "vector-search")]
pub use vector::{VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError};

// ============================================================================
// FTS5 SANITIZATION
// ============================================================================

/// Sanitize free text into a safe FTS5 MATCH expression.
///
/// Each whitespace token is double-quoted so FTS5 operators (`AND`, `NEAR`,
/// `*`, `-`) in user queries are treated as literals. Embedded quotes are
/// stripped rather than escaped.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            let cleaned: String = token.chars().filter(|c| *c != '"').collect();
            format!("\"{cleaned}\"")
        })
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// SCORE FUSION
// ============================================================================

/// Min-max normalize scores to [0, 1] within a candidate pool.
///
/// A constant pool (max == min) normalizes to 1.0 for every candidate so a
/// single-result list does not vanish from the fused ranking.
pub fn min_max_normalize(scores: &[(String, f64)]) -> Vec<(String, f64)> {
    if scores.is_empty() {
        return vec![];
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    scores
        .iter()
        .map(|(k, s)| {
            let normalized = if span > f64::EPSILON {
                (s - min) / span
            } else {
                1.0
            };
            (k.clone(), normalized)
        })
        .collect()
}

/// Weighted linear combination of two normalized score lists.
///
/// Inputs should already be min-max normalized; candidates present in only
/// one list contribute their single weighted score.
pub fn linear_combination(
    keyword_results: &[(String, f64)],
    semantic_results: &[(String, f64)],
    keyword_weight: f64,
    semantic_weight: f64,
) -> Vec<(String, f64)> {
    let mut scores: std::collections::HashMap<String, f64> = std::collections::HashMap::new();

    for (key, score) in keyword_results {
        *scores.entry(key.clone()).or_default() += score * keyword_weight;
    }
    for (key, score) in semantic_results {
        *scores.entry(key.clone()).or_default() += score * semantic_weight;
    }

    let mut results: Vec<(String, f64)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

// ============================================================================
// TESTS
// ============================================================================
