//! # Ragline Core
//!
//! Retrieval-augmented generation pipeline: chunking, embedding cache,
//! vector index contract, keyword/hybrid retrieval, ranking, conversation state, prompt budgeting,
//! and streaming generation orchestration.
//!
//! The crate holds no concrete model clients, file parsers, or database
//! drivers. Those plug in through [`embedding::EmbeddingProvider`],
//! [`generation::GenerationProvider`], [`store::VectorIndex`],
//! [`loader::DocumentLoader`] and [`tokens::TokenCounter`], wired together
//! by a [`container::ServiceContainer`] into a [`pipeline::RagPipeline`].

pub mod chunk;
pub mod container;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod rank;
pub mod retry;
pub mod search;
pub mod store;
pub mod tokens;

pub use error::{RagError, Result};
