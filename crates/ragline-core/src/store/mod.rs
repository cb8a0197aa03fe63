//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the one contract every backend presents to
//! the pipeline: idempotent upsert by chunk id, cascade delete by document,
//! top-k similarity search, and term-match keyword search. Raw scores are backend-native; each backend
//! declares a [`ScoreNormalization`] that the ranker uses to map them into
//! `[0, 1]`, so scores are never compared across backends directly.
//!
//! Implementations must be `Send + Sync`; they are shared by every request.

pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{RagError, Result};
use crate::models::{Chunk, IndexEntry, Metadata, ScoredEntry};

/// Native similarity metric of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    InnerProduct,
}

/// How a backend's raw scores map into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreNormalization {
    /// Cosine similarity in `[-1, 1]` shifted to `(s + 1) / 2`.
    CosineShift,
    /// Min-max over the result set; all-equal scores map to `1.0`.
    MinMax,
    /// Scores are already in `[0, 1]` (fused hybrid scores); only clamped.
    Identity,
}

impl ScoreNormalization {
    /// Normalize a whole result set at once (min-max needs every score).
    pub fn apply(&self, raw: &[f64]) -> Vec<f64> {
        match self {
            ScoreNormalization::CosineShift => raw
                .iter()
                .map(|s| ((s + 1.0) / 2.0).clamp(0.0, 1.0))
                .collect(),
            ScoreNormalization::MinMax => normalize_min_max(raw),
            ScoreNormalization::Identity => raw.iter().map(|s| s.clamp(0.0, 1.0)).collect(),
        }
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_min_max(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }

    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    raw.iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Restricts a similarity search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Only entries from these documents.
    pub document_ids: Option<Vec<String>>,
    /// Only entries whose chunk metadata contains every key/value pair.
    pub metadata: Metadata,
}

impl SearchFilter {
    pub fn documents(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            document_ids: Some(ids.into_iter().map(Into::into).collect()),
            metadata: Metadata::new(),
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| *id == chunk.document_id) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(k, v)| chunk.metadata.get(k) == Some(v))
    }
}

/// Lowercased alphanumeric terms of `text`, deduplicated, in order of
/// first appearance. Keyword search on every backend matches these.
pub fn keyword_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Check a vector against the dimensionality an index already holds.
pub fn check_dims(expected: Option<usize>, actual: usize) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => {
            Err(RagError::DimensionMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

/// Abstract vector store backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace entries by chunk id |
/// | [`delete`](VectorIndex::delete) | Remove every entry of a document |
/// | [`similarity_search`](VectorIndex::similarity_search) | Top-k by native metric |
/// | [`keyword_search`](VectorIndex::keyword_search) | Top-k by term match |
/// | [`count`](VectorIndex::count) | Number of stored entries |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend label used in logs (e.g. `"memory"`, `"sqlite"`).
    fn backend_name(&self) -> &str;

    /// The normalization the ranker must apply to this backend's scores.
    fn normalization(&self) -> ScoreNormalization;

    /// Dimensionality of stored vectors, once anything has been stored.
    async fn dims(&self) -> Result<Option<usize>>;

    /// Insert or replace entries. Re-upserting a chunk id replaces its
    /// vector and metadata.
    ///
    /// Fails with [`RagError::DimensionMismatch`] if any vector disagrees
    /// with the stored dimensionality (or with the rest of the batch).
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Remove all entries of `document_id`. Returns how many were removed.
    async fn delete(&self, document_id: &str) -> Result<usize>;

    /// At most `k` entries, most similar first.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>>;

    /// At most `k` entries containing at least one of the query's
    /// [`keyword_terms`], best match first. Higher raw scores are better;
    /// the scale is backend-specific and always min-max normalized.
    async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>>;

    async fn count(&self) -> Result<usize>;

    /// Number of distinct documents with at least one entry.
    async fn document_count(&self) -> Result<usize>;
}

/// Sort by score descending, then chunk id ascending, and keep `k`.
pub fn sort_and_truncate(results: &mut Vec<ScoredEntry>, k: usize) {
    results.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry.chunk.id.cmp(&b.entry.chunk.id))
    });
    results.truncate(k);
}
