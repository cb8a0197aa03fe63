//! Prompt assembly under a token budget.
//!
//! Budget is spent in strict priority order:
//!
//! 1. The system template. It must fit or the request fails with
//!    [`RagError::ContextWindowOverflow`].
//! 2. Conversation history, newest first, until one message does not fit.
//! 3. Retrieved chunks in rank order. A chunk that does not fit is dropped
//!    whole and recorded; smaller chunks after it may still fit. Once the
//!    budget is spent, the rest are recorded as exhausted.
//!
//! The finished message list is: system template, one system message per
//! included chunk, then history oldest-first. Every included or excluded
//! chunk is accounted for in [`PromptPlan::context`].

use std::sync::Arc;

use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::{
    ContextDecision, ExclusionReason, Message, PromptMessage, PromptPlan, RetrievedChunk,
    RetrievedContext, Role,
};
use crate::tokens::TokenCounter;

pub struct PromptAssembler {
    counter: Arc<dyn TokenCounter>,
}

impl PromptAssembler {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    pub fn assemble(
        &self,
        history: &[Message],
        context: &RetrievedContext,
        system_template: &str,
        token_budget: usize,
    ) -> Result<PromptPlan> {
        let system_tokens = self.counter.count(system_template);
        if system_tokens > token_budget {
            return Err(RagError::ContextWindowOverflow {
                required: system_tokens,
                budget: token_budget,
            });
        }
        let mut remaining = token_budget - system_tokens;

        // History: newest first, stop at the first message that doesn't fit.
        let mut kept_history = 0;
        for message in history.iter().rev() {
            let cost = self.counter.count(&message.content);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            kept_history += 1;
        }
        let history_start = history.len() - kept_history;

        let mut decisions = Vec::with_capacity(context.len());
        let mut chunk_messages = Vec::new();
        for entry in context.iter() {
            let content = render_chunk(entry);
            let cost = self.counter.count(&content);
            let excluded = if remaining == 0 {
                Some(ExclusionReason::BudgetExhausted)
            } else if cost > remaining {
                Some(ExclusionReason::DoesNotFit {
                    needed: cost,
                    remaining,
                })
            } else {
                remaining -= cost;
                chunk_messages.push(PromptMessage {
                    role: Role::System,
                    content,
                });
                None
            };
            decisions.push(ContextDecision {
                chunk_id: entry.chunk.id.clone(),
                document_id: entry.chunk.document_id.clone(),
                origin: entry.chunk.origin().map(str::to_string),
                rank: entry.rank,
                score: entry.score,
                tokens: cost,
                excluded,
            });
        }

        let mut messages = Vec::with_capacity(1 + chunk_messages.len() + kept_history);
        messages.push(PromptMessage {
            role: Role::System,
            content: system_template.to_string(),
        });
        messages.extend(chunk_messages);
        messages.extend(history[history_start..].iter().map(|m| PromptMessage {
            role: m.role,
            content: m.content.clone(),
        }));

        let total_tokens = messages
            .iter()
            .map(|m| self.counter.count(&m.content))
            .sum();

        let plan = PromptPlan {
            messages,
            context: decisions,
            history_included: kept_history,
            history_dropped: history_start,
            total_tokens,
            token_budget,
        };
        debug!(
            total_tokens = plan.total_tokens,
            budget = token_budget,
            history = plan.history_included,
            history_dropped = plan.history_dropped,
            chunks = plan.citations().len(),
            chunks_excluded = plan.excluded().count(),
            "Assembled prompt"
        );
        Ok(plan)
    }
}

/// `[rank] origin` header followed by the chunk text.
fn render_chunk(entry: &RetrievedChunk) -> String {
    let origin = entry.chunk.origin().unwrap_or(&entry.chunk.document_id);
    format!("[{}] {}\n{}", entry.rank, origin, entry.chunk.text)
}
