//! Boundary-aware text chunker with fixed overlap.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters.
//! Consecutive chunks share exactly `overlap` characters so that a sentence
//! straddling a cut is still seen whole by at least one chunk.
//!
//! Each chunk receives a deterministic UUIDv5 derived from its document ID
//! and index, plus a SHA-256 hash of its text. Re-chunking the same text with
//! the same [`ChunkConfig`] therefore produces an identical sequence, which is
//! what makes re-indexing idempotent.
//!
//! # Algorithm
//!
//! 1. If the remaining text fits in `chunk_size`, it becomes the last chunk.
//! 2. Otherwise pick the furthest allowed boundary `b` with
//!    `start + overlap < b <= start + chunk_size`.
//! 3. With no such boundary, hard-split at `start + chunk_size`.
//! 4. The next chunk starts at `b - overlap`.
//!
//! All sizes and spans are counted in Unicode scalar values, never bytes.
//!
//! # Example
//!
//! ```rust
//! use ragline_core::chunk::{split, Boundary, ChunkConfig};
//! use ragline_core::models::Document;
//!
//! let doc = Document::new("doc-123", "notes.md", "Hello world.\n\nSecond paragraph.");
//! let config = ChunkConfig { chunk_size: 700, overlap: 0, boundary: Boundary::Paragraph };
//! let chunks = split(&doc, &config).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{Chunk, Document};

/// Where a chunk is allowed to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    /// Any character position.
    Character,
    /// After sentence-ending punctuation (and any paragraph break).
    Sentence,
    /// After a blank line.
    Paragraph,
}

/// Chunking parameters, measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub boundary: Boundary,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            boundary: Boundary::Paragraph,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Configuration(
                "chunking.chunk_size must be > 0".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(RagError::Configuration(format!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Split a document into chunks.
///
/// Returns chunks with contiguous indices starting at 0. Empty or
/// whitespace-only documents produce no chunks.
///
/// # Errors
///
/// [`RagError::Configuration`] if `config` is invalid.
pub fn split(document: &Document, config: &ChunkConfig) -> Result<Vec<Chunk>> {
    let spans = split_spans(&document.text, config)?;
    let offsets = byte_offsets(&document.text);

    Ok(spans
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let text = &document.text[offsets[start]..offsets[end]];
            make_chunk(document, index, start, end, text)
        })
        .collect())
}

/// Compute chunk spans as `(start, end)` character offsets.
///
/// # Guarantees
///
/// - Every span is non-empty and at most `chunk_size` long.
/// - The last span ends at the end of the text.
/// - Each span after the first starts exactly `overlap` characters before
///   the previous span's end.
pub fn split_spans(text: &str, config: &ChunkConfig) -> Result<Vec<(usize, usize)>> {
    config.validate()?;

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let boundaries = match config.boundary {
        Boundary::Character => Vec::new(),
        Boundary::Sentence => sentence_boundaries(&chars),
        Boundary::Paragraph => paragraph_boundaries(&chars),
    };

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        if n - start <= config.chunk_size {
            spans.push((start, n));
            break;
        }
        let limit = start + config.chunk_size;
        let end = match config.boundary {
            Boundary::Character => limit,
            _ => furthest_boundary(&boundaries, start + config.overlap, limit).unwrap_or(limit),
        };
        spans.push((start, end));
        start = end - config.overlap;
    }

    Ok(spans)
}

/// Largest boundary `p` with `floor < p <= limit`.
fn furthest_boundary(boundaries: &[usize], floor: usize, limit: usize) -> Option<usize> {
    let idx = boundaries.partition_point(|&p| p <= limit);
    if idx == 0 {
        return None;
    }
    let p = boundaries[idx - 1];
    (p > floor).then_some(p)
}

/// Positions directly after a whitespace run containing at least two newlines.
fn paragraph_boundaries(chars: &[char]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        let run_start = i;
        let mut newlines = 0;
        while i < chars.len() && chars[i].is_whitespace() {
            if chars[i] == '\n' {
                newlines += 1;
            }
            i += 1;
        }
        if newlines >= 2 && run_start > 0 && i < chars.len() {
            out.push(i);
        }
    }
    out
}

/// Positions after sentence-ending punctuation (skipping trailing
/// whitespace), merged with paragraph boundaries.
fn sentence_boundaries(chars: &[char]) -> Vec<usize> {
    let mut out = paragraph_boundaries(chars);
    for (i, &c) in chars.iter().enumerate() {
        let after = i + 1;
        if after >= chars.len() {
            break;
        }
        let needs_space = match c {
            '.' | '!' | '?' => true,
            '。' | '！' | '？' => false,
            _ => continue,
        };
        let mut j = after;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if (needs_space && j == after) || j >= chars.len() {
            continue;
        }
        out.push(j);
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Byte offset of every character position, plus the end of the string.
fn byte_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect()
}

/// Deterministic chunk ID for `(document_id, index)`.
pub fn chunk_id(document_id: &str, index: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}#{}", document_id, index).as_bytes(),
    )
    .to_string()
}

/// SHA-256 of `text`, hex-encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Create a single [`Chunk`] inheriting the document's metadata.
fn make_chunk(document: &Document, index: usize, start: usize, end: usize, text: &str) -> Chunk {
    let mut metadata = document.metadata.clone();
    metadata.insert("origin".into(), document.origin.clone().into());
    metadata.insert("chunk_index".into(), index.into());
    metadata.insert("start".into(), start.into());
    metadata.insert("end".into(), end.into());

    Chunk {
        id: chunk_id(&document.id, index),
        document_id: document.id.clone(),
        index,
        text: text.to_string(),
        start,
        end,
        hash: content_hash(text),
        metadata,
    }
}
