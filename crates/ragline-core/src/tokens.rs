//! Token counting seam used for prompt budgeting and history windows.

/// Approximate characters per token for English text.
pub const CHARS_PER_TOKEN: usize = 4;

/// Counts model tokens in a string.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Heuristic counter: `ceil(chars / 4)`.
///
/// Good enough for budgeting when the model tokenizer is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenCounter;

impl TokenCounter for CharTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}
