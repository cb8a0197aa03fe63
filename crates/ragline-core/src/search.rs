//! Retrieval modes and hybrid score fusion.
//!
//! | Mode | Candidates | Scores handed to the ranker |
//! |------|------------|-----------------------------|
//! | `similarity` | [`VectorIndex::similarity_search`] | raw, backend normalization |
//! | `keyword` | [`VectorIndex::keyword_search`] | raw, min-max |
//! | `hybrid` | both | fused, already in `[0, 1]` |
//!
//! # Hybrid Scoring
//!
//! 1. Normalize vector candidates with the backend's normalization and
//!    keyword candidates with min-max.
//! 2. Merge by chunk id: `score = (1 - α) × keyword + α × semantic`, where a
//!    chunk missing from one set scores `0.0` there.
//! 3. Sort by fused score (desc), chunk id (asc).
//!
//! [`VectorIndex::similarity_search`]: crate::store::VectorIndex::similarity_search
//! [`VectorIndex::keyword_search`]: crate::store::VectorIndex::keyword_search

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::RagError;
use crate::models::ScoredEntry;
use crate::store::{sort_and_truncate, ScoreNormalization};

/// How candidates are retrieved from the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Vector similarity only.
    #[default]
    Similarity,
    /// Term matching only; no query embedding is computed.
    Keyword,
    /// Weighted fusion of keyword and vector scores.
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Similarity => "similarity",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn uses_vectors(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }

    pub fn uses_keywords(&self) -> bool {
        !matches!(self, SearchMode::Similarity)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "similarity" => Ok(SearchMode::Similarity),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(RagError::Configuration(format!(
                "unknown search mode: {}. Use similarity, keyword, or hybrid.",
                other
            ))),
        }
    }
}

/// Merge keyword and vector candidates into one list of fused scores.
///
/// The returned `raw_score`s are already in `[0, 1]`; rank them with
/// [`ScoreNormalization::Identity`].
pub fn fuse(
    vector: Vec<ScoredEntry>,
    vector_normalization: ScoreNormalization,
    keyword: Vec<ScoredEntry>,
    alpha: f64,
) -> Vec<ScoredEntry> {
    let alpha = alpha.clamp(0.0, 1.0);
    let vector_scores = vector_normalization.apply(&raw_scores(&vector));
    let keyword_scores = ScoreNormalization::MinMax.apply(&raw_scores(&keyword));

    // chunk id → (entry, keyword, semantic)
    let mut merged: HashMap<String, (ScoredEntry, f64, f64)> = HashMap::new();
    for (entry, score) in vector.into_iter().zip(vector_scores) {
        merged.insert(entry.entry.chunk.id.clone(), (entry, 0.0, score));
    }
    for (entry, score) in keyword.into_iter().zip(keyword_scores) {
        merged
            .entry(entry.entry.chunk.id.clone())
            .and_modify(|m| m.1 = score)
            .or_insert((entry, score, 0.0));
    }

    let mut fused: Vec<ScoredEntry> = merged
        .into_values()
        .map(|(mut entry, k, v)| {
            entry.raw_score = (1.0 - alpha) * k + alpha * v;
            entry
        })
        .collect();
    let total = fused.len();
    sort_and_truncate(&mut fused, total);
    fused
}

fn raw_scores(entries: &[ScoredEntry]) -> Vec<f64> {
    entries.iter().map(|e| e.raw_score).collect()
}
