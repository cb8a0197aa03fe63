//! Retrieval ranking: normalization, thresholding, dedup, ordering, and
//! optional Maximal Marginal Relevance (MMR) re-selection.
//!
//! # Algorithm
//!
//! 1. Normalize raw backend scores into `[0, 1]` using the backend's
//!    declared [`ScoreNormalization`].
//! 2. Drop entries below `min_score`.
//! 3. Collapse entries whose normalized text is identical, keeping the best.
//! 4. Sort by score (desc), backend rank (asc), chunk id (asc).
//! 5. With `diversity` on, greedily select by
//!    `λ × relevance - (1-λ) × max cosine(candidate, selected)`.
//! 6. Truncate to `top_n` and assign 1-based ranks.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Deserialize;
use tracing::debug;

use crate::embedding::{cosine_similarity, normalize_text};
use crate::models::{RetrievedChunk, RetrievedContext, ScoredEntry};
use crate::store::ScoreNormalization;

/// Ranker tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    /// Maximum number of chunks in the returned context.
    pub top_n: usize,
    /// Normalized score floor. Entries strictly below are dropped.
    pub min_score: f64,
    /// Enable MMR diversity re-selection.
    pub diversity: bool,
    /// MMR balance: 1.0 = pure relevance, 0.0 = pure diversity.
    pub lambda: f64,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            top_n: 5,
            min_score: 0.0,
            diversity: false,
            lambda: 0.7,
        }
    }
}

struct Candidate {
    entry: ScoredEntry,
    score: f64,
    backend_rank: usize,
}

/// Turn raw backend results into an ordered, deduplicated context.
///
/// `raw` must be in backend order (best first); that order breaks score ties.
pub fn rank(
    raw: Vec<ScoredEntry>,
    normalization: ScoreNormalization,
    config: &RankConfig,
) -> RetrievedContext {
    if raw.is_empty() || config.top_n == 0 {
        return RetrievedContext::default();
    }
    let total = raw.len();

    let raw_scores: Vec<f64> = raw.iter().map(|e| e.raw_score).collect();
    let normalized = normalization.apply(&raw_scores);

    let mut candidates: Vec<Candidate> = raw
        .into_iter()
        .zip(normalized)
        .enumerate()
        .filter(|(_, (_, score))| *score >= config.min_score)
        .map(|(backend_rank, (entry, score))| Candidate {
            entry,
            score,
            backend_rank,
        })
        .collect();

    candidates.sort_by(compare);
    let mut candidates = dedup_by_text(candidates);

    let selected = if config.diversity {
        mmr_select(candidates, config.top_n, config.lambda)
    } else {
        candidates.truncate(config.top_n);
        candidates
    };

    debug!(
        candidates = total,
        selected = selected.len(),
        diversity = config.diversity,
        "Ranked retrieval results"
    );

    RetrievedContext {
        entries: selected
            .into_iter()
            .enumerate()
            .map(|(i, c)| RetrievedChunk {
                chunk: c.entry.entry.chunk,
                vector: c.entry.entry.vector,
                score: c.score,
                raw_score: c.entry.raw_score,
                rank: i + 1,
            })
            .collect(),
    }
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.backend_rank.cmp(&b.backend_rank))
        .then_with(|| a.entry.entry.chunk.id.cmp(&b.entry.entry.chunk.id))
}

/// Input must already be sorted best-first; the first occurrence wins.
fn dedup_by_text(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|c| seen.insert(normalize_text(&c.entry.entry.chunk.text)))
        .collect()
}

fn mmr_select(candidates: Vec<Candidate>, k: usize, lambda: f64) -> Vec<Candidate> {
    let lambda = lambda.clamp(0.0, 1.0);
    let k = k.min(candidates.len());
    let mut selected: Vec<Candidate> = Vec::with_capacity(k);
    let mut remaining = candidates;

    while selected.len() < k && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_mmr = f64::NEG_INFINITY;

        for (idx, candidate) in remaining.iter().enumerate() {
            let max_similarity = selected
                .iter()
                .map(|s| {
                    cosine_similarity(&candidate.entry.entry.vector, &s.entry.entry.vector) as f64
                })
                .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
                .unwrap_or(0.0);
            let mmr = lambda * candidate.score - (1.0 - lambda) * max_similarity;

            // Strict comparison: on ties the earlier (better ranked) candidate stays.
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = idx;
            }
        }

        selected.push(remaining.remove(best_idx));
    }

    selected
}
