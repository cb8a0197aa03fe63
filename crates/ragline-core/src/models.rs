//! Core data models that flow through ingestion and retrieval.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata. Ordered so that derived chunks hash and compare
/// deterministically.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A source document as handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Where the text came from (path, URL, ...).
    pub origin: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(id: impl Into<String>, origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A contiguous fragment of a document; the retrieval unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub index: usize,
    pub text: String,
    /// Character offset (inclusive) of the span within the document.
    pub start: usize,
    /// Character offset (exclusive) of the span within the document.
    pub end: usize,
    /// SHA-256 of `text`, hex-encoded.
    pub hash: String,
    pub metadata: Metadata,
}

impl Chunk {
    /// The `origin` metadata inherited from the parent document, if any.
    pub fn origin(&self) -> Option<&str> {
        self.metadata.get("origin").and_then(|v| v.as_str())
    }
}

/// An embedding vector tied to the content and model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub model_id: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn dims(&self) -> usize {
        self.vector.len()
    }
}

/// A chunk and its vector as stored in a vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl IndexEntry {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.id
    }

    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

/// An index entry together with the backend-native similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub raw_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A reference from an answer back to the chunk that supported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub origin: Option<String>,
    /// 1-based rank of the chunk in the retrieved context.
    pub rank: usize,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            citations: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }
}

/// A ranked chunk in a [`RetrievedContext`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    /// Normalized relevance in `[0, 1]`.
    pub score: f64,
    /// Backend-native score before normalization.
    pub raw_score: f64,
    /// 1-based position after ranking.
    pub rank: usize,
}

impl RetrievedChunk {
    pub fn citation(&self) -> Citation {
        Citation {
            chunk_id: self.chunk.id.clone(),
            document_id: self.chunk.document_id.clone(),
            origin: self.chunk.origin().map(str::to_string),
            rank: self.rank,
        }
    }
}

/// Ranked retrieval output for a single query. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub entries: Vec<RetrievedChunk>,
}

impl RetrievedContext {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RetrievedChunk> {
        self.entries.iter()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.chunk.id.as_str()).collect()
    }
}

/// A single `(role, content)` pair submitted to the generation provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Why a retrieved chunk was left out of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The chunk alone needed more tokens than were left.
    DoesNotFit { needed: usize, remaining: usize },
    /// No budget remained at all.
    BudgetExhausted,
}

/// Inclusion decision for one retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextDecision {
    pub chunk_id: String,
    pub document_id: String,
    pub origin: Option<String>,
    pub rank: usize,
    pub score: f64,
    pub tokens: usize,
    /// `None` when the chunk was included.
    pub excluded: Option<ExclusionReason>,
}

impl ContextDecision {
    pub fn is_included(&self) -> bool {
        self.excluded.is_none()
    }

    pub fn citation(&self) -> Citation {
        Citation {
            chunk_id: self.chunk_id.clone(),
            document_id: self.document_id.clone(),
            origin: self.origin.clone(),
            rank: self.rank,
        }
    }
}

/// The finalized prompt plus the bookkeeping needed for source display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptPlan {
    pub messages: Vec<PromptMessage>,
    pub context: Vec<ContextDecision>,
    pub history_included: usize,
    pub history_dropped: usize,
    pub total_tokens: usize,
    pub token_budget: usize,
}

impl PromptPlan {
    /// Citations for every chunk that made it into the prompt, in rank order.
    pub fn citations(&self) -> Vec<Citation> {
        self.context
            .iter()
            .filter(|d| d.is_included())
            .map(ContextDecision::citation)
            .collect()
    }

    pub fn excluded(&self) -> impl Iterator<Item = &ContextDecision> {
        self.context.iter().filter(|d| !d.is_included())
    }
}

/// A complete generated answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
}
