//! In-memory [`VectorIndex`] implementation.
//!
//! Entries live in a `BTreeMap` keyed by chunk id behind a
//! `std::sync::RwLock`. Search is brute force over all entries using the
//! configured [`Metric`]; keyword search counts how many distinct query
//! terms each chunk contains.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::embedding::{cosine_similarity, inner_product};
use crate::error::{RagError, Result};
use crate::models::{IndexEntry, ScoredEntry};

use super::{
    check_dims, keyword_terms, sort_and_truncate, Metric, ScoreNormalization, SearchFilter,
    VectorIndex,
};

#[derive(Default)]
struct IndexState {
    dims: Option<usize>,
    entries: BTreeMap<String, IndexEntry>,
}

/// Brute-force in-memory index for tests and single-process deployments.
pub struct InMemoryIndex {
    metric: Metric,
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new(Metric::Cosine)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn backend_name(&self) -> &str {
        "memory"
    }

    fn normalization(&self) -> ScoreNormalization {
        match self.metric {
            Metric::Cosine => ScoreNormalization::CosineShift,
            Metric::InnerProduct => ScoreNormalization::MinMax,
        }
    }

    async fn dims(&self) -> Result<Option<usize>> {
        Ok(self.state.read().unwrap().dims)
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().unwrap();

        // Validate the whole batch before touching anything.
        let mut dims = state.dims;
        for entry in &entries {
            if entry.vector.is_empty() {
                return Err(RagError::Storage(format!(
                    "empty vector for chunk {}",
                    entry.chunk.id
                )));
            }
            check_dims(dims, entry.vector.len())?;
            dims = Some(entry.vector.len());
        }

        let count = entries.len();
        state.dims = dims;
        for entry in entries {
            state.entries.insert(entry.chunk.id.clone(), entry);
        }
        debug!(upserted = count, total = state.entries.len(), "Upserted index entries");
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let mut state = self.state.write().unwrap();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.chunk.document_id != document_id);
        Ok(before - state.entries.len())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let state = self.state.read().unwrap();
        let Some(dims) = state.dims else {
            return Ok(Vec::new());
        };
        check_dims(Some(dims), query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut results: Vec<ScoredEntry> = state
            .entries
            .values()
            .filter(|e| filter.matches(&e.chunk))
            .map(|e| {
                let raw = match self.metric {
                    Metric::Cosine => cosine_similarity(query, &e.vector),
                    Metric::InnerProduct => inner_product(query, &e.vector),
                };
                ScoredEntry {
                    entry: e.clone(),
                    raw_score: raw as f64,
                }
            })
            .collect();
        sort_and_truncate(&mut results, k);
        Ok(results)
    }

    async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let terms = keyword_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().unwrap();
        let mut results: Vec<ScoredEntry> = state
            .entries
            .values()
            .filter(|e| filter.matches(&e.chunk))
            .filter_map(|e| {
                let chunk_terms: HashSet<String> =
                    keyword_terms(&e.chunk.text).into_iter().collect();
                let matches = terms.iter().filter(|t| chunk_terms.contains(*t)).count();
                (matches > 0).then(|| ScoredEntry {
                    entry: e.clone(),
                    raw_score: matches as f64,
                })
            })
            .collect();
        sort_and_truncate(&mut results, k);
        Ok(results)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.read().unwrap().entries.len())
    }

    async fn document_count(&self) -> Result<usize> {
        let state = self.state.read().unwrap();
        let docs: HashSet<&str> = state
            .entries
            .values()
            .map(|e| e.chunk.document_id.as_str())
            .collect();
        Ok(docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn entry(chunk_id: &str, doc_id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: Chunk {
                id: chunk_id.to_string(),
                document_id: doc_id.to_string(),
                index: 0,
                text: format!("text of {}", chunk_id),
                start: 0,
                end: 0,
                hash: String::new(),
                metadata: Default::default(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_chunk_id() {
        let index = InMemoryIndex::default();
        index.upsert(vec![entry("c1", "d1", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(vec![entry("c1", "d1", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let hits = index
            .similarity_search(&[0.0, 1.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert!((hits[0].raw_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_delete_cascades_by_document() {
        let index = InMemoryIndex::default();
        index
            .upsert(vec![
                entry("c1", "d1", vec![1.0, 0.0]),
                entry("c2", "d1", vec![0.5, 0.5]),
                entry("c3", "d2", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(index.document_count().await.unwrap(), 2);
        assert_eq!(index.delete("d1").await.unwrap(), 2);
        assert_eq!(index.delete("d1").await.unwrap(), 0);
        assert_eq!(index.delete("missing").await.unwrap(), 0);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_orders_and_limits() {
        let index = InMemoryIndex::default();
        index
            .upsert(vec![
                entry("c1", "d1", vec![1.0, 0.0]),
                entry("c2", "d1", vec![0.7, 0.7]),
                entry("c3", "d2", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .similarity_search(&[1.0, 0.1], 2, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.chunk_id()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_fewer_matches_than_k() {
        let index = InMemoryIndex::default();
        index
            .upsert(vec![
                entry("c1", "d1", vec![1.0, 0.0]),
                entry("c2", "d1", vec![0.0, 1.0]),
                entry("c3", "d1", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();
        let hits = index
            .similarity_search(&[1.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_filter_by_document() {
        let index = InMemoryIndex::default();
        index
            .upsert(vec![
                entry("c1", "d1", vec![1.0, 0.0]),
                entry("c2", "d2", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let hits = index
            .similarity_search(&[1.0, 0.0], 5, &SearchFilter::documents(["d2"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.document_id(), "d2");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let index = InMemoryIndex::default();
        index.upsert(vec![entry("c1", "d1", vec![1.0, 0.0])]).await.unwrap();

        let err = index
            .upsert(vec![entry("c2", "d1", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RagError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        let err = index
            .similarity_search(&[1.0], 1, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mixed_batch_rejected_atomically() {
        let index = InMemoryIndex::default();
        let err = index
            .upsert(vec![
                entry("c1", "d1", vec![1.0, 0.0]),
                entry("c2", "d1", vec![1.0]),
            ])
            .await;
        assert!(err.is_err());
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(index.dims().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inner_product_metric() {
        let index = InMemoryIndex::new(Metric::InnerProduct);
        assert_eq!(index.normalization(), ScoreNormalization::MinMax);
        index
            .upsert(vec![
                entry("c1", "d1", vec![2.0, 0.0]),
                entry("c2", "d1", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let hits = index
            .similarity_search(&[3.0, 0.0], 2, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].raw_score, 6.0);
        assert_eq!(hits[1].raw_score, 3.0);
    }

    #[tokio::test]
    async fn test_keyword_search_counts_matched_terms() {
        let index = InMemoryIndex::default();
        let mut a = entry("a", "d1", vec![1.0, 0.0]);
        a.chunk.text = "Cargo builds Rust crates.".to_string();
        let mut b = entry("b", "d2", vec![1.0, 0.0]);
        b.chunk.text = "Cargo is a tool.".to_string();
        let mut c = entry("c", "d3", vec![1.0, 0.0]);
        c.chunk.text = "Nothing relevant here.".to_string();
        index.upsert(vec![a, b, c]).await.unwrap();

        let hits = index
            .keyword_search("rust cargo?", 5, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hits[0].raw_score, 2.0);
        assert_eq!(hits[1].raw_score, 1.0);

        let hits = index
            .keyword_search("cargo", 5, &SearchFilter::documents(["d2"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk.id, "b");

        assert!(index
            .keyword_search("?!", 5, &SearchFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let index = InMemoryIndex::default();
        let hits = index
            .similarity_search(&[1.0, 2.0, 3.0], 3, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
