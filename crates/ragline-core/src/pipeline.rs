//! The pipeline's boundary surface: ingest, delete, search, and query.
//!
//! [`RagPipeline`] is assembled from a [`ServiceContainer`]. The application
//! registers the four external collaborators under
//! [`names::EMBEDDING_PROVIDER`], [`names::VECTOR_INDEX`],
//! [`names::GENERATION_PROVIDER`] and [`names::TOKEN_COUNTER`];
//! [`register_core_services`] adds everything built on top of them.
//!
//! # Ingestion
//!
//! ```text
//! Document → chunk::split → EmbeddingCache::embed → VectorIndex::delete(doc) → VectorIndex::upsert
//! ```
//!
//! # Query
//!
//! ```text
//! question → embed → similarity_search ┐
//!          → keyword_search ─────────────┴→ (fuse) → rank → history
//!          → PromptAssembler → GenerationOrchestrator
//! ```
//!
//! Which searches run depends on the [`SearchMode`]. Similarity and keyword
//! searches fetch `k × fetch_multiplier` candidates when diversity is on;
//! hybrid searches always do, so the fused list has room to reorder.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkConfig};
use crate::container::{names, Lifetime, ServiceContainer};
use crate::conversation::{ConversationConfig, ConversationManager, HistoryWindow, SessionState};
use crate::embedding::{EmbeddingCache, EmbeddingCacheConfig, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::generation::{
    Generation, GenerationConfig, GenerationOptions, GenerationOrchestrator, GenerationProvider,
};
use crate::loader::DocumentLoader;
use crate::models::{Document, IndexEntry, Message, RetrievedContext};
use crate::prompt::PromptAssembler;
use crate::rank::{rank, RankConfig};
use crate::search::{fuse, SearchMode};
use crate::store::{check_dims, ScoreNormalization, SearchFilter, VectorIndex};
use crate::tokens::TokenCounter;

/// Default instruction placed at the top of every prompt.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a helpful assistant. Answer the user's \
question using only the numbered context passages provided. Cite passages by their number. \
If the context does not contain the answer, say that you don't know.";

/// Request-independent pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Embedding model id used for both documents and queries.
    pub model_id: String,
    pub chunking: ChunkConfig,
    pub system_template: String,
    /// Token budget for the whole prompt.
    pub token_budget: usize,
    /// Ranking defaults; `top_n` is overridden per query by `top_k`.
    pub rank: RankConfig,
    pub history: HistoryWindow,
    /// Default retrieval mode for [`RagPipeline::search`].
    pub search_mode: SearchMode,
    /// Semantic weight of hybrid scores: `(1-α)·keyword + α·semantic`.
    pub hybrid_alpha: f64,
    /// Candidates fetched per requested result when diversity is on.
    pub fetch_multiplier: usize,
    /// Documents ingested concurrently by the batch operations.
    pub ingest_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            model_id: "hash-bow-v1".to_string(),
            chunking: ChunkConfig::default(),
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            token_budget: 4096,
            rank: RankConfig::default(),
            history: HistoryWindow {
                max_messages: Some(10),
                max_tokens: None,
            },
            search_mode: SearchMode::Similarity,
            hybrid_alpha: 0.6,
            fetch_multiplier: 4,
            ingest_concurrency: 4,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.model_id.trim().is_empty() {
            return Err(RagError::Configuration(
                "embedding model id must not be empty".to_string(),
            ));
        }
        if self.token_budget == 0 {
            return Err(RagError::Configuration(
                "prompt.token_budget must be > 0".to_string(),
            ));
        }
        if self.fetch_multiplier == 0 {
            return Err(RagError::Configuration(
                "retrieval.fetch_multiplier must be >= 1".to_string(),
            ));
        }
        if self.ingest_concurrency == 0 {
            return Err(RagError::Configuration(
                "ingest.concurrency must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rank.lambda) {
            return Err(RagError::Configuration(format!(
                "retrieval.lambda must be in [0.0, 1.0], got {}",
                self.rank.lambda
            )));
        }
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            return Err(RagError::Configuration(format!(
                "retrieval.hybrid_alpha must be in [0.0, 1.0], got {}",
                self.hybrid_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.rank.min_score) {
            return Err(RagError::Configuration(format!(
                "retrieval.min_score must be in [0.0, 1.0], got {}",
                self.rank.min_score
            )));
        }
        Ok(())
    }
}

/// Settings for the services [`register_core_services`] adds.
#[derive(Debug, Clone, Default)]
pub struct CoreServiceConfig {
    pub settings: PipelineSettings,
    pub cache: EmbeddingCacheConfig,
    pub conversation: ConversationConfig,
    pub generation: GenerationConfig,
}

/// Register the cache, conversation manager, prompt assembler, orchestrator,
/// and settings on top of the externally provided collaborators.
pub fn register_core_services(
    container: &mut ServiceContainer,
    config: CoreServiceConfig,
) -> Result<()> {
    config.settings.validate()?;

    let CoreServiceConfig {
        settings,
        cache,
        conversation,
        generation,
    } = config;

    container.register_instance(names::SETTINGS, Arc::new(settings))?;

    container.register(
        names::EMBEDDING_CACHE,
        Lifetime::Singleton,
        &[names::EMBEDDING_PROVIDER],
        move |r| {
            let provider: Arc<dyn EmbeddingProvider> = r.resolve(names::EMBEDDING_PROVIDER)?;
            Ok(Arc::new(EmbeddingCache::new(provider, cache)?))
        },
    )?;

    container.register(names::CONVERSATIONS, Lifetime::Singleton, &[], move |_| {
        Ok(Arc::new(ConversationManager::new(conversation.clone())?))
    })?;

    container.register(
        names::PROMPT_ASSEMBLER,
        Lifetime::PerRequest,
        &[names::TOKEN_COUNTER],
        |r| {
            let counter: Arc<dyn TokenCounter> = r.resolve(names::TOKEN_COUNTER)?;
            Ok(Arc::new(PromptAssembler::new(counter)))
        },
    )?;

    container.register(
        names::ORCHESTRATOR,
        Lifetime::Singleton,
        &[names::GENERATION_PROVIDER, names::CONVERSATIONS],
        move |r| {
            let provider: Arc<dyn GenerationProvider> = r.resolve(names::GENERATION_PROVIDER)?;
            let conversations: Arc<ConversationManager> = r.resolve(names::CONVERSATIONS)?;
            Ok(Arc::new(GenerationOrchestrator::new(
                provider,
                conversations,
                generation.clone(),
            )?))
        },
    )?;

    Ok(())
}

/// Acknowledgement of a successful `ingest_document`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestAck {
    pub document_id: String,
    pub chunks: usize,
    /// Entries of a previous version of the document that were replaced.
    pub replaced: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAck {
    pub document_id: String,
    pub removed: usize,
}

/// One document or source that could not be ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestFailure {
    /// Document id, or the source string when loading failed.
    pub source: String,
    pub error: RagError,
}

/// Per-item outcome of a batch ingestion. A failure never aborts the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub ingested: Vec<IngestAck>,
    pub failed: Vec<IngestFailure>,
}

impl BatchReport {
    pub fn total_chunks(&self) -> usize {
        self.ingested.iter().map(|a| a.chunks).sum()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-query options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub include_sources: bool,
    /// Retrieval breadth: at most this many chunks reach the prompt.
    pub top_k: usize,
    pub mode: SearchMode,
    pub filter: SearchFilter,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            stream: false,
            include_sources: true,
            top_k: 5,
            mode: SearchMode::default(),
            filter: SearchFilter::default(),
        }
    }
}

pub struct RagPipeline {
    container: Arc<ServiceContainer>,
    settings: Arc<PipelineSettings>,
    embeddings: Arc<EmbeddingCache>,
    index: Arc<dyn VectorIndex>,
    conversations: Arc<ConversationManager>,
    counter: Arc<dyn TokenCounter>,
    orchestrator: Arc<GenerationOrchestrator>,
}

impl RagPipeline {
    /// Validate and warm up the container, then resolve the shared services.
    pub fn from_container(container: Arc<ServiceContainer>) -> Result<Self> {
        container.warm_up()?;
        Ok(Self {
            settings: container.resolve(names::SETTINGS)?,
            embeddings: container.resolve(names::EMBEDDING_CACHE)?,
            index: container.resolve(names::VECTOR_INDEX)?,
            conversations: container.resolve(names::CONVERSATIONS)?,
            counter: container.resolve(names::TOKEN_COUNTER)?,
            orchestrator: container.resolve(names::ORCHESTRATOR)?,
            container,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingCache> {
        &self.embeddings
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    // ═══════════════════════════════════════════════════════════════════
    // Ingestion
    // ═══════════════════════════════════════════════════════════════════

    /// Chunk, embed, and index one document, replacing any previous version.
    ///
    /// Re-ingesting identical text yields identical chunk ids, so the index
    /// ends up with exactly one entry per chunk.
    pub async fn ingest_document(&self, document: Document) -> Result<IngestAck> {
        if document.id.trim().is_empty() {
            return Err(RagError::InvalidRequest(
                "document id must not be empty".to_string(),
            ));
        }

        let chunks = chunk::split(&document, &self.settings.chunking)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embeddings.embed(&texts, &self.settings.model_id).await?;

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry {
                chunk,
                vector: embedding.vector,
            })
            .collect();

        // Refuse before touching the old version if the model drifted.
        if let Some(first) = entries.first() {
            check_dims(self.index.dims().await?, first.vector.len())?;
        }

        let count = entries.len();
        let replaced = self.index.delete(&document.id).await?;
        self.index.upsert(entries).await?;

        info!(
            document_id = %document.id,
            origin = %document.origin,
            chunks = count,
            replaced,
            backend = self.index.backend_name(),
            "Indexed document"
        );
        Ok(IngestAck {
            document_id: document.id,
            chunks: count,
            replaced,
        })
    }

    /// Ingest many documents with bounded concurrency.
    pub async fn ingest_batch(&self, documents: Vec<Document>) -> BatchReport {
        let outcomes: Vec<(String, Result<IngestAck>)> = stream::iter(documents)
            .map(|document| async move {
                let id = document.id.clone();
                (id, self.ingest_document(document).await)
            })
            .buffered(self.settings.ingest_concurrency)
            .collect()
            .await;
        collect_report(outcomes)
    }

    /// Load and ingest sources through `loader`. Load failures are reported
    /// per source.
    pub async fn ingest_sources(
        &self,
        loader: &dyn DocumentLoader,
        sources: &[String],
    ) -> BatchReport {
        let outcomes: Vec<(String, Result<IngestAck>)> = stream::iter(sources)
            .map(|source| async move {
                let result = match loader.load(source).await {
                    Ok(loaded) => self.ingest_document(loaded.into_document(source)).await,
                    Err(e) => Err(e),
                };
                (source.clone(), result)
            })
            .buffered(self.settings.ingest_concurrency)
            .collect()
            .await;
        collect_report(outcomes)
    }

    /// Remove a document and all of its chunks. Absent documents are a no-op.
    pub async fn delete_document(&self, document_id: &str) -> Result<DeleteAck> {
        let removed = self.index.delete(document_id).await?;
        info!(document_id, removed, "Deleted document");
        Ok(DeleteAck {
            document_id: document_id.to_string(),
            removed,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Retrieval
    // ═══════════════════════════════════════════════════════════════════

    /// Retrieve and rank at most `top_k` chunks for `query` using the
    /// configured search mode.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<RetrievedContext> {
        self.search_with_mode(query, top_k, filter, self.settings.search_mode)
            .await
    }

    /// Retrieve and rank at most `top_k` chunks for `query` using `mode`.
    pub async fn search_with_mode(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
        mode: SearchMode,
    ) -> Result<RetrievedContext> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidRequest("query must not be empty".to_string()));
        }
        if top_k == 0 {
            return Err(RagError::InvalidRequest("top_k must be >= 1".to_string()));
        }

        let config = RankConfig {
            top_n: top_k,
            ..self.settings.rank.clone()
        };
        let fetch_k = if config.diversity || mode == SearchMode::Hybrid {
            top_k.saturating_mul(self.settings.fetch_multiplier)
        } else {
            top_k
        };

        let vector = if mode.uses_vectors() {
            let query_vec = self
                .embeddings
                .embed_one(query, &self.settings.model_id)
                .await?;
            self.index
                .similarity_search(&query_vec.vector, fetch_k, filter)
                .await?
        } else {
            Vec::new()
        };
        let keyword = if mode.uses_keywords() {
            self.index.keyword_search(query, fetch_k, filter).await?
        } else {
            Vec::new()
        };
        let (vector_candidates, keyword_candidates) = (vector.len(), keyword.len());

        let (candidates, normalization) = match mode {
            SearchMode::Similarity => (vector, self.index.normalization()),
            SearchMode::Keyword => (keyword, ScoreNormalization::MinMax),
            SearchMode::Hybrid => (
                fuse(
                    vector,
                    self.index.normalization(),
                    keyword,
                    self.settings.hybrid_alpha,
                ),
                ScoreNormalization::Identity,
            ),
        };
        let context = rank(candidates, normalization, &config);
        debug!(
            mode = %mode,
            fetch_k,
            vector_candidates,
            keyword_candidates,
            results = context.len(),
            "Retrieved context"
        );
        Ok(context)
    }

    /// Answer `user_message` in `session_id` from retrieved context and history.
    ///
    /// # Errors
    ///
    /// [`RagError::ContextWindowOverflow`] when the system template plus the
    /// question itself do not fit the token budget.
    pub async fn query(
        &self,
        session_id: &str,
        user_message: &str,
        options: QueryOptions,
    ) -> Result<Generation> {
        if session_id.trim().is_empty() {
            return Err(RagError::InvalidRequest(
                "session id must not be empty".to_string(),
            ));
        }

        let context = self
            .search_with_mode(user_message, options.top_k, &options.filter, options.mode)
            .await?;

        let question = Message::user(user_message);
        let mut turns =
            self.conversations
                .history(session_id, self.settings.history, self.counter.as_ref());
        turns.push(question.clone());

        let assembler: Arc<PromptAssembler> = self.container.resolve(names::PROMPT_ASSEMBLER)?;
        let plan = assembler.assemble(
            &turns,
            &context,
            &self.settings.system_template,
            self.settings.token_budget,
        )?;
        if plan.history_included == 0 {
            let required = self.counter.count(&self.settings.system_template)
                + self.counter.count(user_message);
            warn!(
                session_id,
                required,
                budget = self.settings.token_budget,
                "Question does not fit the prompt budget"
            );
            return Err(RagError::ContextWindowOverflow {
                required,
                budget: self.settings.token_budget,
            });
        }

        let generation_options = GenerationOptions {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: options.stream,
            include_sources: options.include_sources,
        };
        self.orchestrator
            .generate(session_id, question, plan, &generation_options)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Sessions and stats
    // ═══════════════════════════════════════════════════════════════════

    pub fn clear_session(&self, session_id: &str) -> bool {
        self.conversations.remove(session_id)
    }

    pub fn session_state(&self, session_id: &str) -> SessionState {
        self.conversations.state(session_id)
    }

    pub async fn document_count(&self) -> Result<usize> {
        self.index.document_count().await
    }

    pub async fn entry_count(&self) -> Result<usize> {
        self.index.count().await
    }
}

fn collect_report(outcomes: Vec<(String, Result<IngestAck>)>) -> BatchReport {
    let mut report = BatchReport::default();
    for (source, outcome) in outcomes {
        match outcome {
            Ok(ack) => report.ingested.push(ack),
            Err(error) => {
                warn!(source = %source, error = %error, "Ingestion failed");
                report.failed.push(IngestFailure { source, error });
            }
        }
    }
    info!(
        ingested = report.ingested.len(),
        failed = report.failed.len(),
        chunks = report.total_chunks(),
        "Batch ingestion finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize_text;
    use crate::loader::LoadedDocument;
    use crate::models::PromptPlan;
    use crate::store::memory::InMemoryIndex;
    use crate::tokens::CharTokenCounter;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const DIMS: usize = 16;

    /// Bag of words hashed into a small vector.
    struct BowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BowEmbedder {
        fn model_name(&self) -> &str {
            "bow"
        }

        fn dims(&self) -> usize {
            DIMS
        }

        async fn embed(&self, texts: &[String], _model_id: &str) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; DIMS];
                    for word in normalize_text(t).to_lowercase().split(' ') {
                        let bucket = word
                            .bytes()
                            .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
                            % DIMS;
                        v[bucket] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    /// Answers with the number of context passages it was given.
    struct CountingGenerator;

    #[async_trait]
    impl GenerationProvider for CountingGenerator {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, plan: &PromptPlan, _options: &GenerationOptions) -> Result<String> {
            Ok(format!("{} passages", plan.citations().len()))
        }

        async fn stream(
            &self,
            plan: &PromptPlan,
            options: &GenerationOptions,
            tx: mpsc::Sender<String>,
        ) -> Result<()> {
            let text = self.complete(plan, options).await?;
            for word in text.split_inclusive(' ') {
                let _ = tx.send(word.to_string()).await;
            }
            Ok(())
        }
    }

    struct MapLoader;

    #[async_trait]
    impl DocumentLoader for MapLoader {
        async fn load(&self, source: &str) -> Result<LoadedDocument> {
            if source.starts_with("missing") {
                return Err(RagError::DocumentLoad {
                    origin: source.to_string(),
                    message: "not found".to_string(),
                });
            }
            Ok(LoadedDocument {
                text: format!("Contents of {}. Rust ownership and borrowing.", source),
                metadata: Default::default(),
            })
        }
    }

    fn pipeline_with(settings: PipelineSettings, index: Arc<dyn VectorIndex>) -> RagPipeline {
        let mut container = ServiceContainer::new();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(BowEmbedder);
        let generator: Arc<dyn GenerationProvider> = Arc::new(CountingGenerator);
        let counter: Arc<dyn TokenCounter> = Arc::new(CharTokenCounter);
        container.register_instance(names::EMBEDDING_PROVIDER, embedder).unwrap();
        container.register_instance(names::VECTOR_INDEX, index).unwrap();
        container.register_instance(names::GENERATION_PROVIDER, generator).unwrap();
        container.register_instance(names::TOKEN_COUNTER, counter).unwrap();
        register_core_services(
            &mut container,
            CoreServiceConfig {
                settings,
                ..CoreServiceConfig::default()
            },
        )
        .unwrap();
        RagPipeline::from_container(Arc::new(container)).unwrap()
    }

    fn pipeline() -> RagPipeline {
        let settings = PipelineSettings {
            chunking: ChunkConfig {
                chunk_size: 120,
                overlap: 20,
                ..ChunkConfig::default()
            },
            ..PipelineSettings::default()
        };
        pipeline_with(settings, Arc::new(InMemoryIndex::default()))
    }

    fn long_document(id: &str) -> Document {
        let text = (0..8)
            .map(|i| format!("Paragraph {} talks about topic number {} in some detail.", i, i))
            .collect::<Vec<_>>()
            .join("\n\n");
        Document::new(id, format!("{}.md", id), text)
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let pipeline = pipeline();
        let first = pipeline.ingest_document(long_document("doc")).await.unwrap();
        assert!(first.chunks > 1);
        assert_eq!(first.replaced, 0);

        let second = pipeline.ingest_document(long_document("doc")).await.unwrap();
        assert_eq!(second.chunks, first.chunks);
        assert_eq!(second.replaced, first.chunks);
        assert_eq!(pipeline.entry_count().await.unwrap(), first.chunks);
        assert_eq!(pipeline.document_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reingest_with_shorter_text_drops_stale_chunks() {
        let pipeline = pipeline();
        pipeline.ingest_document(long_document("doc")).await.unwrap();
        let ack = pipeline
            .ingest_document(Document::new("doc", "doc.md", "Just one line now."))
            .await
            .unwrap();
        assert_eq!(ack.chunks, 1);
        assert_eq!(pipeline.entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_document() {
        let pipeline = pipeline();
        let ack = pipeline.ingest_document(long_document("doc")).await.unwrap();
        let deleted = pipeline.delete_document("doc").await.unwrap();
        assert_eq!(deleted.removed, ack.chunks);
        assert_eq!(pipeline.entry_count().await.unwrap(), 0);
        assert_eq!(pipeline.delete_document("doc").await.unwrap().removed, 0);
    }

    #[tokio::test]
    async fn test_top_k_larger_than_index() {
        let pipeline = pipeline();
        for (id, text) in [("a", "alpha apples"), ("b", "beta bananas"), ("c", "gamma grapes")] {
            pipeline
                .ingest_document(Document::new(id, id, text))
                .await
                .unwrap();
        }
        let context = pipeline
            .search("apples and grapes", 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(context.len(), 3);

        let answer = pipeline
            .query("s", "apples and grapes", QueryOptions::default())
            .await
            .unwrap()
            .into_answer()
            .await
            .unwrap();
        assert_eq!(answer.citations.len(), 3);
        assert_eq!(answer.text, "3 passages");
    }

    #[tokio::test]
    async fn test_query_records_history() {
        let pipeline = pipeline();
        pipeline.ingest_document(long_document("doc")).await.unwrap();
        pipeline
            .query("s1", "topic number 3", QueryOptions::default())
            .await
            .unwrap()
            .into_answer()
            .await
            .unwrap();
        assert_eq!(pipeline.session_state("s1"), SessionState::Active);
        let history = pipeline.conversations().history(
            "s1",
            HistoryWindow::default(),
            &CharTokenCounter,
        );
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "topic number 3");

        assert!(pipeline.clear_session("s1"));
        assert_eq!(pipeline.session_state("s1"), SessionState::Evicted);
    }

    #[tokio::test]
    async fn test_streaming_query() {
        let pipeline = pipeline();
        pipeline.ingest_document(long_document("doc")).await.unwrap();
        let options = QueryOptions {
            stream: true,
            include_sources: false,
            top_k: 2,
            ..QueryOptions::default()
        };
        let generation = pipeline.query("s", "paragraph 5", options).await.unwrap();
        assert!(matches!(generation, Generation::Streaming(_)));
        let answer = generation.into_answer().await.unwrap();
        assert_eq!(answer.text, "2 passages");
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn test_question_that_cannot_fit_overflows() {
        let settings = PipelineSettings {
            token_budget: 40,
            system_template: "Answer briefly.".to_string(),
            ..PipelineSettings::default()
        };
        let pipeline = pipeline_with(settings, Arc::new(InMemoryIndex::default()));
        pipeline
            .ingest_document(Document::new("d", "d", "short text"))
            .await
            .unwrap();
        let question = "why ".repeat(100);
        let err = pipeline
            .query("s", &question, QueryOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RagError::ContextWindowOverflow { budget: 40, .. }));
        assert_eq!(pipeline.session_state("s"), SessionState::Empty);
    }

    #[tokio::test]
    async fn test_batch_reports_failures_without_aborting() {
        let pipeline = pipeline();
        let report = pipeline
            .ingest_batch(vec![
                long_document("one"),
                Document::new("", "nowhere", "orphan text"),
                long_document("two"),
            ])
            .await;
        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, RagError::InvalidRequest(_)));
        assert_eq!(pipeline.document_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ingest_sources_reports_load_errors() {
        let pipeline = pipeline();
        let sources = vec!["a.txt".to_string(), "missing.txt".to_string(), "b.txt".to_string()];
        let report = pipeline.ingest_sources(&MapLoader, &sources).await;
        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.failed[0].source, "missing.txt");
        assert!(matches!(report.failed[0].error, RagError::DocumentLoad { .. }));
    }

    #[tokio::test]
    async fn test_dimension_drift_is_fatal() {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::default());
        index
            .upsert(vec![IndexEntry {
                chunk: chunk::split(&Document::new("x", "x", "old model"), &ChunkConfig::default())
                    .unwrap()
                    .remove(0),
                vector: vec![1.0, 0.0, 0.0],
            }])
            .await
            .unwrap();
        let pipeline = pipeline_with(PipelineSettings::default(), index);
        let err = pipeline
            .ingest_document(Document::new("y", "y", "new model text"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RagError::DimensionMismatch {
                expected: 3,
                actual: DIMS
            }
        );
    }

    async fn fruit_pipeline(settings: PipelineSettings) -> RagPipeline {
        let pipeline = pipeline_with(settings, Arc::new(InMemoryIndex::default()));
        for (id, text) in [
            ("a", "alpha apples orchard"),
            ("b", "beta bananas plantation"),
            ("c", "gamma grapes vineyard"),
        ] {
            pipeline
                .ingest_document(Document::new(id, id, text))
                .await
                .unwrap();
        }
        pipeline
    }

    fn doc_ids(context: &RetrievedContext) -> Vec<&str> {
        context.iter().map(|e| e.chunk.document_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_keyword_mode_skips_embedding() {
        let pipeline = fruit_pipeline(PipelineSettings::default()).await;
        let calls = pipeline.embeddings().stats().provider_calls;

        let context = pipeline
            .search_with_mode("Apples?", 5, &SearchFilter::default(), SearchMode::Keyword)
            .await
            .unwrap();
        assert_eq!(doc_ids(&context), vec!["a"]);
        assert_eq!(context.entries[0].score, 1.0);
        assert_eq!(pipeline.embeddings().stats().provider_calls, calls);

        let answer = pipeline
            .query(
                "s",
                "grapes",
                QueryOptions {
                    mode: SearchMode::Keyword,
                    ..QueryOptions::default()
                },
            )
            .await
            .unwrap()
            .into_answer()
            .await
            .unwrap();
        assert_eq!(answer.text, "1 passages");
    }

    #[tokio::test]
    async fn test_hybrid_mode_fuses_scores() {
        let pipeline = fruit_pipeline(PipelineSettings::default()).await;
        let similarity = pipeline
            .search_with_mode("apples", 5, &SearchFilter::default(), SearchMode::Similarity)
            .await
            .unwrap();
        let hybrid = pipeline
            .search_with_mode("apples", 5, &SearchFilter::default(), SearchMode::Hybrid)
            .await
            .unwrap();

        assert_eq!(hybrid.len(), similarity.len());
        assert_eq!(hybrid.entries[0].chunk.document_id, "a");
        assert!(hybrid.iter().all(|e| (0.0..=1.0).contains(&e.score)));
        let ranks: Vec<usize> = hybrid.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, (1..=hybrid.len()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_hybrid_with_full_semantic_weight_matches_similarity() {
        let settings = PipelineSettings {
            hybrid_alpha: 1.0,
            ..PipelineSettings::default()
        };
        let pipeline = fruit_pipeline(settings).await;
        let similarity = pipeline
            .search_with_mode("bananas", 5, &SearchFilter::default(), SearchMode::Similarity)
            .await
            .unwrap();
        let hybrid = pipeline
            .search_with_mode("bananas", 5, &SearchFilter::default(), SearchMode::Hybrid)
            .await
            .unwrap();
        assert_eq!(doc_ids(&hybrid), doc_ids(&similarity));
    }

    #[tokio::test]
    async fn test_configured_mode_is_the_default() {
        let settings = PipelineSettings {
            search_mode: SearchMode::Keyword,
            ..PipelineSettings::default()
        };
        let pipeline = fruit_pipeline(settings).await;
        let context = pipeline
            .search("vineyard", 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(doc_ids(&context), vec!["c"]);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let pipeline = pipeline();
        assert!(matches!(
            pipeline.search("   ", 3, &SearchFilter::default()).await,
            Err(RagError::InvalidRequest(_))
        ));
        assert!(matches!(
            pipeline.search("q", 0, &SearchFilter::default()).await,
            Err(RagError::InvalidRequest(_))
        ));
        assert!(pipeline
            .query("", "q", QueryOptions::default())
            .await
            .is_err());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        settings.rank.lambda = 1.5;
        assert!(matches!(settings.validate(), Err(RagError::Configuration(_))));

        let settings = PipelineSettings {
            hybrid_alpha: -0.1,
            ..PipelineSettings::default()
        };
        assert!(matches!(settings.validate(), Err(RagError::Configuration(_))));
    }
}
