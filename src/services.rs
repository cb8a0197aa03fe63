//! Container wiring.
//!
//! Registers the concrete collaborators selected by [`Config`] (embedder,
//! vector index, generator, token counter) and then the core services on
//! top of them. Everything the pipeline uses is resolved from the
//! [`ServiceContainer`], so tests and embedders of the library can swap any
//! single registration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ragline_core::container::{names, Lifetime, ServiceContainer};
use ragline_core::conversation::ConversationManager;
use ragline_core::embedding::EmbeddingProvider;
use ragline_core::generation::GenerationProvider;
use ragline_core::pipeline::{register_core_services, RagPipeline};
use ragline_core::store::memory::InMemoryIndex;
use ragline_core::store::VectorIndex;
use ragline_core::tokens::{CharTokenCounter, TokenCounter};

use crate::config::Config;
use crate::providers::{ExtractiveGenerator, HashEmbeddingProvider, TiktokenCounter};
use crate::sqlite_store::SqliteIndex;
use crate::{db, migrate};

/// Open the configured vector index. SQLite indexes are migrated on open.
pub async fn open_index(config: &Config) -> Result<Arc<dyn VectorIndex>> {
    match config.index.backend.as_str() {
        "sqlite" => {
            let path = config
                .index
                .path
                .as_ref()
                .context("index.path must be set for the sqlite backend")?;
            let pool = db::connect(path).await?;
            migrate::run_migrations(&pool).await?;
            debug!(path = %path.display(), "Opened SQLite index");
            Ok(Arc::new(SqliteIndex::new(pool, config.index.metric)))
        }
        _ => Ok(Arc::new(InMemoryIndex::new(config.index.metric))),
    }
}

/// Build a container with every service the pipeline needs.
pub async fn build_container(config: &Config) -> Result<ServiceContainer> {
    let index = open_index(config).await?;
    let mut container = ServiceContainer::new();

    let embedding = config.embedding.clone();
    container.register(
        names::EMBEDDING_PROVIDER,
        Lifetime::Singleton,
        &[],
        move |_| {
            let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(
                embedding.model.clone(),
                embedding.dims,
            )?);
            Ok(provider)
        },
    )?;

    container.register_instance(names::VECTOR_INDEX, index)?;

    let word_delay = Duration::from_millis(config.generation.word_delay_ms);
    container.register(
        names::GENERATION_PROVIDER,
        Lifetime::Singleton,
        &[],
        move |_| {
            let provider: Arc<dyn GenerationProvider> =
                Arc::new(ExtractiveGenerator::default().with_word_delay(word_delay));
            Ok(provider)
        },
    )?;

    let tokenizer = config.prompt.tokenizer.clone();
    container.register(names::TOKEN_COUNTER, Lifetime::Singleton, &[], move |_| {
        let counter: Arc<dyn TokenCounter> = match tokenizer.as_str() {
            "chars" => Arc::new(CharTokenCounter),
            _ => Arc::new(TiktokenCounter::cl100k_base()?),
        };
        Ok(counter)
    })?;

    register_core_services(&mut container, config.core_services())?;
    Ok(container)
}

/// Build and warm up the pipeline for `config`.
pub async fn build_pipeline(config: &Config) -> Result<RagPipeline> {
    let container = build_container(config).await?;
    let pipeline = RagPipeline::from_container(Arc::new(container))?;
    info!(
        backend = pipeline.index().backend_name(),
        model = %pipeline.settings().model_id,
        "Pipeline ready"
    );
    Ok(pipeline)
}

/// Periodically drop expired sessions until `cancel` fires.
pub fn spawn_session_sweeper(
    conversations: Arc<ConversationManager>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = conversations.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "Evicted expired sessions");
                    }
                }
            }
        }
    })
}
