//! Document loading contract.
//!
//! The pipeline never reads files or URLs itself; a [`DocumentLoader`]
//! turns a source string into text plus metadata, and the pipeline derives
//! a stable document id from the source.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Document, Metadata};

/// Text extracted from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub text: String,
    pub metadata: Metadata,
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Load `source`. Failures are reported as
    /// [`RagError::DocumentLoad`](crate::error::RagError::DocumentLoad).
    async fn load(&self, source: &str) -> Result<LoadedDocument>;
}

/// Stable document id for a source: UUIDv5 over the source string, so
/// re-ingesting the same source replaces its previous chunks.
pub fn document_id_for(source: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes()).to_string()
}

impl LoadedDocument {
    pub fn into_document(self, source: &str) -> Document {
        Document {
            id: document_id_for(source),
            origin: source.to_string(),
            text: self.text,
            metadata: self.metadata,
        }
    }
}
