//! Embedding provider trait, memoizing cache, and vector utilities.
//!
//! The [`EmbeddingCache`] sits between the pipeline and an
//! [`EmbeddingProvider`]. It keys vectors by `(hash of normalized text,
//! model id)`, batches all misses of a call into as few provider requests as
//! `max_batch_size` allows, and only populates the cache once every batch
//! has succeeded.
//!
//! Concrete providers live in the `ragline` application crate.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;

use crate::chunk::content_hash;
use crate::error::{RagError, Result};
use crate::models::Embedding;
use crate::retry::RetryPolicy;

/// Trait for embedding providers.
///
/// Implementations must return exactly one vector per input text, in input
/// order, and all vectors for one model id must share a dimensionality.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the default model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts with the given model.
    ///
    /// Failures are reported as [`RagError::EmbeddingProvider`].
    async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vec<f32>>>;
}

/// Tuning for [`EmbeddingCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingCacheConfig {
    /// Largest number of texts sent to the provider in one call.
    pub max_batch_size: usize,
    /// LRU bound; `None` keeps every vector.
    pub max_entries: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_entries: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters exposed by [`EmbeddingCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub provider_calls: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    content_hash: String,
    model_id: String,
}

struct CacheState {
    entries: LruCache<CacheKey, Arc<Vec<f32>>>,
    hits: u64,
    misses: u64,
    provider_calls: u64,
}

/// Memoization layer over an [`EmbeddingProvider`], shared across requests.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbeddingCacheConfig,
    state: Mutex<CacheState>,
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbeddingCacheConfig) -> Result<Self> {
        if config.max_batch_size == 0 {
            return Err(RagError::Configuration(
                "embedding.batch_size must be > 0".to_string(),
            ));
        }
        let entries = match config.max_entries {
            Some(cap) => {
                let cap = NonZeroUsize::new(cap).ok_or_else(|| {
                    RagError::Configuration("embedding.cache_capacity must be > 0".to_string())
                })?;
                LruCache::new(cap)
            }
            None => LruCache::unbounded(),
        };
        Ok(Self {
            provider,
            config,
            state: Mutex::new(CacheState {
                entries,
                hits: 0,
                misses: 0,
                provider_calls: 0,
            }),
        })
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed `texts` with `model_id`, one [`Embedding`] per input in order.
    ///
    /// # Errors
    ///
    /// [`RagError::EmbeddingProvider`] when the provider fails (after the
    /// retry budget) or returns a malformed response. Nothing from a failed
    /// call is cached.
    pub async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Embedding>> {
        let keys: Vec<CacheKey> = texts
            .iter()
            .map(|t| CacheKey {
                content_hash: content_hash(&normalize_text(t)),
                model_id: model_id.to_string(),
            })
            .collect();

        let mut resolved: Vec<Option<Arc<Vec<f32>>>> = Vec::with_capacity(texts.len());
        // Unique misses in first-seen order, with the text to send.
        let mut missing: Vec<(CacheKey, String)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (key, text) in keys.iter().zip(texts) {
                match state.entries.get(key).cloned() {
                    Some(v) => {
                        state.hits += 1;
                        resolved.push(Some(v));
                    }
                    None => {
                        state.misses += 1;
                        resolved.push(None);
                        if !missing.iter().any(|(k, _)| k == key) {
                            missing.push((key.clone(), text.clone()));
                        }
                    }
                }
            }
        }

        let fetched = if missing.is_empty() {
            HashMap::new()
        } else {
            self.fetch(&missing, model_id).await?
        };

        let mut out = Vec::with_capacity(texts.len());
        for (key, cached) in keys.into_iter().zip(resolved) {
            let vector = match cached {
                Some(v) => v,
                None => fetched.get(&key).cloned().ok_or_else(|| {
                    RagError::EmbeddingProvider("provider response missing a vector".to_string())
                })?,
            };
            out.push(Embedding {
                model_id: key.model_id,
                content_hash: key.content_hash,
                vector: vector.as_ref().clone(),
            });
        }
        Ok(out)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str, model_id: &str) -> Result<Embedding> {
        self.embed(&[text.to_string()], model_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingProvider("empty embedding response".to_string()))
    }

    async fn fetch(
        &self,
        missing: &[(CacheKey, String)],
        model_id: &str,
    ) -> Result<HashMap<CacheKey, Arc<Vec<f32>>>> {
        let mut fetched = HashMap::with_capacity(missing.len());
        let mut dims: Option<usize> = None;

        for batch in missing.chunks(self.config.max_batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let provider = &self.provider;
            let texts_ref = &texts;
            let vectors = self
                .config
                .retry
                .run("embed", move || provider.embed(texts_ref, model_id))
                .await?;
            self.state.lock().unwrap().provider_calls += 1;

            if vectors.len() != batch.len() {
                return Err(RagError::EmbeddingProvider(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for ((key, _), vector) in batch.iter().zip(vectors) {
                match dims {
                    Some(d) if d != vector.len() => {
                        return Err(RagError::EmbeddingProvider(format!(
                            "model '{}' returned vectors of length {} and {}",
                            model_id,
                            d,
                            vector.len()
                        )));
                    }
                    _ => dims = Some(vector.len()),
                }
                fetched.insert(key.clone(), Arc::new(vector));
            }
        }

        let mut state = self.state.lock().unwrap();
        for (key, vector) in &fetched {
            state.entries.put(key.clone(), Arc::clone(vector));
        }
        debug!(
            model_id,
            fetched = fetched.len(),
            cached = state.entries.len(),
            "Embedded cache misses"
        );
        Ok(fetched)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            provider_calls: state.provider_calls,
            entries: state.entries.len(),
        }
    }
}

/// Normalize text for cache keying: trim and collapse whitespace runs.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use ragline_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Plain dot product; `0.0` for mismatched lengths.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
