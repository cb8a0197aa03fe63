//! Offline collaborators for the core pipeline.
//!
//! | Type | Implements |
//! |------|------------|
//! | [`HashEmbeddingProvider`] | [`EmbeddingProvider`] via signed feature hashing |
//! | [`ExtractiveGenerator`] | [`GenerationProvider`] that quotes the best context sentences |
//! | [`TiktokenCounter`] | [`TokenCounter`] over a BPE vocabulary |
//!
//! None of them needs network access, so the CLI works out of the box and
//! results are reproducible across runs.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use ragline_core::embedding::EmbeddingProvider;
use ragline_core::error::{RagError, Result};
use ragline_core::generation::{GenerationOptions, GenerationProvider};
use ragline_core::models::{PromptPlan, Role};
use ragline_core::tokens::TokenCounter;

// ═══════════════════════════════════════════════════════════════════════
// Embeddings
// ═══════════════════════════════════════════════════════════════════════

/// Bag-of-words embedder using the hashing trick.
///
/// Each lowercase word (and each adjacent word pair) is hashed with SHA-256
/// into one of `dims` buckets with a sign taken from the digest, then the
/// vector is L2-normalized. Texts sharing vocabulary get high cosine
/// similarity; the vectors carry no semantics beyond that.
pub struct HashEmbeddingProvider {
    model: String,
    dims: usize,
}

impl HashEmbeddingProvider {
    pub fn new(model: impl Into<String>, dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(RagError::Configuration(
                "embedding.dims must be > 0".to_string(),
            ));
        }
        Ok(Self {
            model: model.into(),
            dims,
        })
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let words = tokenize(text);

        for word in &words {
            self.add_feature(&mut vec, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let feature = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vec, feature.as_bytes(), 0.5);
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }

    fn add_feature(&self, vec: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vec<f32>>> {
        if model_id != self.model {
            return Err(RagError::Configuration(format!(
                "hash embedder serves model '{}', not '{}'",
                self.model, model_id
            )));
        }
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercase alphanumeric words.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Generation
// ═══════════════════════════════════════════════════════════════════════

const NO_ANSWER: &str = "I don't know. The indexed documents don't cover this question.";

/// Answers by quoting the context sentences that share the most words with
/// the question, each tagged with its passage number.
///
/// `max_tokens` caps the answer length in words; temperature is ignored.
pub struct ExtractiveGenerator {
    max_sentences: usize,
    word_delay: Duration,
}

impl ExtractiveGenerator {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
            word_delay: Duration::ZERO,
        }
    }

    /// Pause between streamed words, to make streaming visible in a terminal.
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    fn answer(&self, plan: &PromptPlan, options: &GenerationOptions) -> String {
        let question = plan
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let question_words: Vec<String> = tokenize(question)
            .into_iter()
            .filter(|w| w.chars().count() > 2)
            .collect();

        // (score, passage rank, position, sentence)
        let mut candidates: Vec<(usize, usize, usize, String)> = Vec::new();
        for message in plan.messages.iter().skip(1) {
            if message.role != Role::System {
                continue;
            }
            let Some((rank, body)) = parse_passage(&message.content) else {
                continue;
            };
            for sentence in split_sentences(body) {
                let words = tokenize(&sentence);
                let score = question_words
                    .iter()
                    .filter(|q| words.contains(q))
                    .count();
                if score > 0 {
                    let position = candidates.len();
                    candidates.push((score, rank, position, sentence));
                }
            }
        }

        if candidates.is_empty() {
            return NO_ANSWER.to_string();
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(self.max_sentences);
        // Present in document order
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let text = candidates
            .iter()
            .map(|(_, rank, _, sentence)| format!("{} [{}]", sentence, rank))
            .collect::<Vec<_>>()
            .join(" ");

        match options.max_tokens {
            Some(limit) => text
                .split_whitespace()
                .take(limit as usize)
                .collect::<Vec<_>>()
                .join(" "),
            None => text,
        }
    }
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Parse a rendered context passage: `"[rank] origin\ntext"`.
fn parse_passage(content: &str) -> Option<(usize, &str)> {
    let rest = content.strip_prefix('[')?;
    let close = rest.find(']')?;
    let rank = rest[..close].parse().ok()?;
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    Some((rank, body))
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

#[async_trait]
impl GenerationProvider for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, plan: &PromptPlan, options: &GenerationOptions) -> Result<String> {
        Ok(self.answer(plan, options))
    }

    async fn stream(
        &self,
        plan: &PromptPlan,
        options: &GenerationOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<()> {
        let text = self.answer(plan, options);
        for (i, word) in text.split(' ').enumerate() {
            let fragment = if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };
            if tx.send(fragment).await.is_err() {
                // Receiver gone: the orchestrator stopped listening.
                return Ok(());
            }
            if !self.word_delay.is_zero() {
                tokio::time::sleep(self.word_delay).await;
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Token counting
// ═══════════════════════════════════════════════════════════════════════

/// Token counter backed by a tiktoken BPE vocabulary.
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    /// Counter for `model`, falling back to `cl100k_base` for unknown models.
    pub fn for_model(model: &str) -> Result<Self> {
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => Self::cl100k()?,
        };
        Ok(Self { bpe })
    }

    pub fn cl100k_base() -> Result<Self> {
        Ok(Self {
            bpe: Self::cl100k()?,
        })
    }

    fn cl100k() -> Result<tiktoken_rs::CoreBPE> {
        tiktoken_rs::cl100k_base()
            .map_err(|e| RagError::Configuration(format!("failed to load cl100k_base: {}", e)))
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
