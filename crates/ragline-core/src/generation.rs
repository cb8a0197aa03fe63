//! Generation orchestration: drives a [`GenerationProvider`] over a finished
//! [`PromptPlan`], either to completion or as a cancellable fragment stream,
//! and records successful turns in the [`ConversationManager`].
//!
//! # Streaming
//!
//! ```text
//! provider task ──(bounded upstream mpsc)──▶ relay task ──(bounded downstream mpsc)──▶ AnswerStream
//! ```
//!
//! The relay forwards every fragment as [`StreamFragment::Text`] and finishes
//! with exactly one terminal fragment: `Done`, `Interrupted`, or `Cancelled`.
//! Both channels are bounded, so a slow consumer slows the provider down
//! instead of growing a buffer. Cancelling (explicitly or by timeout) aborts
//! the provider task; fragments the relay already received are still
//! delivered before `Cancelled`. Dropping the [`AnswerStream`] aborts the
//! provider as well. Only `Done` answers are appended to the conversation.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::ConversationManager;
use crate::error::{RagError, Result};
use crate::models::{Answer, Citation, Message, PromptPlan};
use crate::retry::RetryPolicy;

/// Per-request generation knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Return a fragment stream instead of a complete answer.
    pub stream: bool,
    /// Attach citations to the returned answer.
    pub include_sources: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            stream: false,
            include_sources: true,
        }
    }
}

/// A text-generation model.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the whole answer.
    async fn complete(&self, plan: &PromptPlan, options: &GenerationOptions) -> Result<String>;

    /// Produce the answer incrementally. Each fragment is sent on `tx`;
    /// returning `Ok(())` marks the end of the answer.
    async fn stream(
        &self,
        plan: &PromptPlan,
        options: &GenerationOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Capacity of each streaming channel.
    pub stream_buffer: usize,
    pub retry: RetryPolicy,
    /// Upper bound on a whole generation, retries included.
    pub timeout: Option<Duration>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stream_buffer: 16,
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// One item of an [`AnswerStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFragment {
    Text(String),
    /// The answer completed and was recorded in the conversation.
    Done { answer: Answer },
    /// The provider failed mid-answer. `partial` holds what was relayed.
    Interrupted { message: String, partial: String },
    /// Cancelled by the consumer or by the generation timeout.
    Cancelled,
}

impl StreamFragment {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamFragment::Text(_))
    }
}

/// Result of [`GenerationOrchestrator::generate`].
pub enum Generation {
    Complete(Answer),
    Streaming(AnswerStream),
}

impl Generation {
    /// Wait for the full answer, draining the stream if there is one.
    ///
    /// Interrupted or cancelled streams become [`RagError::StreamInterrupted`].
    pub async fn into_answer(self) -> Result<Answer> {
        use futures::StreamExt;

        match self {
            Generation::Complete(answer) => Ok(answer),
            Generation::Streaming(mut stream) => {
                while let Some(fragment) = stream.next().await {
                    match fragment {
                        StreamFragment::Text(_) => {}
                        StreamFragment::Done { answer } => return Ok(answer),
                        StreamFragment::Interrupted { message, .. } => {
                            return Err(RagError::StreamInterrupted(message))
                        }
                        StreamFragment::Cancelled => {
                            return Err(RagError::StreamInterrupted("cancelled".to_string()))
                        }
                    }
                }
                Err(RagError::StreamInterrupted(
                    "stream closed without a result".to_string(),
                ))
            }
        }
    }
}

/// Consumer side of a streaming generation.
///
/// Dropping the stream cancels the generation.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamFragment>,
    cancel: CancellationToken,
    finished: bool,
}

impl AnswerStream {
    /// Stop the generation. Fragments the relay already received from the
    /// provider are still yielded, followed by [`StreamFragment::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for AnswerStream {
    type Item = StreamFragment;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(fragment)) => {
                if fragment.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(fragment))
            }
            // The relay ended without delivering a terminal fragment.
            Poll::Ready(None) => {
                this.finished = true;
                if this.cancel.is_cancelled() {
                    Poll::Ready(Some(StreamFragment::Cancelled))
                } else {
                    Poll::Ready(Some(StreamFragment::Interrupted {
                        message: "generation task ended unexpectedly".to_string(),
                        partial: String::new(),
                    }))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct GenerationOrchestrator {
    provider: Arc<dyn GenerationProvider>,
    conversations: Arc<ConversationManager>,
    config: GenerationConfig,
}

impl GenerationOrchestrator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        conversations: Arc<ConversationManager>,
        config: GenerationConfig,
    ) -> Result<Self> {
        if config.stream_buffer == 0 {
            return Err(RagError::Configuration(
                "generation.stream_buffer must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            provider,
            conversations,
            config,
        })
    }

    pub fn provider(&self) -> &Arc<dyn GenerationProvider> {
        &self.provider
    }

    /// Generate an answer for `question` from `plan`.
    ///
    /// On success the question and the answer (with the plan's citations)
    /// are appended to `session_id`.
    pub async fn generate(
        &self,
        session_id: &str,
        question: Message,
        plan: PromptPlan,
        options: &GenerationOptions,
    ) -> Result<Generation> {
        if options.stream {
            return Ok(Generation::Streaming(self.spawn_stream(
                session_id, question, plan, options,
            )));
        }

        let call = self
            .config
            .retry
            .run("generation", || self.provider.complete(&plan, options));
        let text = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                RagError::GenerationProvider(format!("generation timed out after {:?}", limit))
            })??,
            None => call.await?,
        };

        let citations = plan.citations();
        record_turn(&self.conversations, session_id, question, &text, &citations)?;
        info!(
            session_id,
            provider = self.provider.name(),
            chars = text.len(),
            citations = citations.len(),
            "Generated answer"
        );
        Ok(Generation::Complete(Answer {
            text,
            citations: visible_citations(citations, options),
        }))
    }

    fn spawn_stream(
        &self,
        session_id: &str,
        question: Message,
        plan: PromptPlan,
        options: &GenerationOptions,
    ) -> AnswerStream {
        let (out_tx, out_rx) = mpsc::channel(self.config.stream_buffer);
        let cancel = CancellationToken::new();
        let relay = Relay {
            provider: self.provider.clone(),
            conversations: self.conversations.clone(),
            config: self.config.clone(),
            session_id: session_id.to_string(),
            question,
            plan: Arc::new(plan),
            options: options.clone(),
            out: out_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(relay.run());
        AnswerStream {
            rx: out_rx,
            cancel,
            finished: false,
        }
    }
}

enum Outcome {
    Finished,
    Failed(RagError),
    /// Stopped by `cancel()` or the timeout. `held` was taken off the
    /// upstream channel but not yet relayed.
    Cancelled { held: Option<String> },
    /// The consumer dropped the stream.
    Disconnected,
}

/// State owned by the spawned relay task of one streaming generation.
struct Relay {
    provider: Arc<dyn GenerationProvider>,
    conversations: Arc<ConversationManager>,
    config: GenerationConfig,
    session_id: String,
    question: Message,
    plan: Arc<PromptPlan>,
    options: GenerationOptions,
    out: mpsc::Sender<StreamFragment>,
    cancel: CancellationToken,
}

impl Relay {
    async fn run(self) {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let mut attempt = 0;
        let mut text = String::new();

        loop {
            let (up_tx, mut up_rx) = mpsc::channel::<String>(self.config.stream_buffer);
            let mut producer = {
                let provider = self.provider.clone();
                let plan = self.plan.clone();
                let options = self.options.clone();
                tokio::spawn(async move { provider.stream(&plan, &options, up_tx).await })
            };
            let mut relayed_any = false;

            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break Outcome::Cancelled { held: None },
                    _ = wait_until(deadline) => {
                        warn!(session_id = %self.session_id, "Generation timed out");
                        self.cancel.cancel();
                        break Outcome::Cancelled { held: None };
                    }
                    fragment = up_rx.recv() => match fragment {
                        Some(fragment) => {
                            relayed_any = true;
                            tokio::select! {
                                biased;
                                _ = self.cancel.cancelled() => {
                                    break Outcome::Cancelled { held: Some(fragment) };
                                }
                                permit = self.out.reserve() => match permit {
                                    Ok(permit) => {
                                        text.push_str(&fragment);
                                        permit.send(StreamFragment::Text(fragment));
                                    }
                                    Err(_) => break Outcome::Disconnected,
                                },
                            }
                        }
                        None => match (&mut producer).await {
                            Ok(Ok(())) => break Outcome::Finished,
                            Ok(Err(e)) => break Outcome::Failed(e),
                            Err(e) => break Outcome::Failed(RagError::GenerationProvider(
                                format!("generation task failed: {}", e),
                            )),
                        },
                    },
                }
            };

            match outcome {
                Outcome::Finished => {
                    self.finish(text).await;
                    return;
                }
                Outcome::Failed(e)
                    if !relayed_any
                        && e.is_transient()
                        && attempt < self.config.retry.max_retries =>
                {
                    let wait = self.config.retry.backoff(attempt);
                    warn!(
                        operation = "generation_stream",
                        attempt = attempt + 1,
                        max_retries = self.config.retry.max_retries,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            let _ = self.out.send(StreamFragment::Cancelled).await;
                            return;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Outcome::Failed(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Generation stream interrupted");
                    let _ = self
                        .out
                        .send(StreamFragment::Interrupted {
                            message: e.to_string(),
                            partial: text,
                        })
                        .await;
                    return;
                }
                Outcome::Cancelled { held } => {
                    let flushed = self.flush_received(producer, held, &mut up_rx).await;
                    debug!(
                        session_id = %self.session_id,
                        chars = text.len(),
                        flushed,
                        "Generation stream cancelled"
                    );
                    let _ = self.out.send(StreamFragment::Cancelled).await;
                    return;
                }
                Outcome::Disconnected => {
                    producer.abort();
                    debug!(session_id = %self.session_id, chars = text.len(), "Stream consumer went away");
                    return;
                }
            }
        }
    }

    /// Stop the provider, then relay every fragment it already handed over.
    /// Returns the number of fragments relayed.
    async fn flush_received(
        &self,
        producer: JoinHandle<Result<()>>,
        held: Option<String>,
        up_rx: &mut mpsc::Receiver<String>,
    ) -> usize {
        producer.abort();
        // Once the task is gone nothing more can land in `up_rx`.
        let _ = producer.await;

        let mut next = held;
        let mut flushed = 0;
        while let Some(fragment) = next.take().or_else(|| up_rx.try_recv().ok()) {
            if self.out.send(StreamFragment::Text(fragment)).await.is_err() {
                break;
            }
            flushed += 1;
        }
        flushed
    }

    async fn finish(self, text: String) {
        let citations = self.plan.citations();
        if let Err(e) = record_turn(
            &self.conversations,
            &self.session_id,
            self.question,
            &text,
            &citations,
        ) {
            warn!(session_id = %self.session_id, error = %e, "Failed to record conversation turn");
        }
        info!(
            session_id = %self.session_id,
            provider = self.provider.name(),
            chars = text.len(),
            citations = citations.len(),
            "Streamed answer"
        );
        let answer = Answer {
            text,
            citations: visible_citations(citations, &self.options),
        };
        let _ = self.out.send(StreamFragment::Done { answer }).await;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn record_turn(
    conversations: &ConversationManager,
    session_id: &str,
    question: Message,
    answer: &str,
    citations: &[Citation],
) -> Result<()> {
    conversations.append(session_id, question)?;
    conversations.append(
        session_id,
        Message::assistant(answer).with_citations(citations.to_vec()),
    )
}

fn visible_citations(citations: Vec<Citation>, options: &GenerationOptions) -> Vec<Citation> {
    if options.include_sources {
        citations
    } else {
        Vec::new()
    }
}
