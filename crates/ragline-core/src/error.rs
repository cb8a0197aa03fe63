//! Error taxonomy for the Ragline core.
//!
//! Every fallible core operation returns [`RagError`]. Provider failures are
//! the only transient class (see [`RagError::is_transient`]); everything else
//! is fatal for the request or for startup.

/// Result alias used across the core crate.
pub type Result<T> = std::result::Result<T, RagError>;

/// Top-level error type for the Ragline core library.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RagError {
    /// Invalid settings or wiring detected at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("Generation provider error: {0}")]
    GenerationProvider(String),

    /// Index and model disagree on vector length. Requires re-indexing.
    #[error("Dimension mismatch: index holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Failed to load document '{origin}': {message}")]
    DocumentLoad { origin: String, message: String },

    #[error("Context window overflow: {required} tokens required, budget is {budget}")]
    ContextWindowOverflow { required: usize, budget: usize },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("No service registered under '{0}'")]
    UnregisteredService(String),

    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    /// A factory resolved a service it did not list in its dependencies.
    #[error("Service '{service}' resolved '{dependency}' without declaring it")]
    UndeclaredDependency { service: String, dependency: String },

    #[error("Service '{name}' is not of type {expected}")]
    ServiceType { name: String, expected: &'static str },

    #[error("Storage error: {0}")]
    Storage(String),

    /// A caller-supplied argument is unusable (empty question, `top_k = 0`, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RagError {
    /// Whether a retry may succeed. Only provider failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingProvider(_) | RagError::GenerationProvider(_)
        )
    }
}
