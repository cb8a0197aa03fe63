//! TOML configuration.
//!
//! Every section and field has a serde default, so an empty file (or
//! [`Config::default`]) describes a runnable in-memory setup. A typical
//! file looks like:
//!
//! ```toml
//! [chunking]
//! chunk_size = 1000
//! overlap = 200
//! boundary = "paragraph"
//!
//! [index]
//! backend = "sqlite"
//! path = "./data/ragline.sqlite"
//!
//! [retrieval]
//! top_k = 5
//! diversity = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ragline_core::chunk::{Boundary, ChunkConfig};
use ragline_core::conversation::{ConversationConfig, HistoryWindow};
use ragline_core::embedding::EmbeddingCacheConfig;
use ragline_core::generation::GenerationConfig;
use ragline_core::pipeline::{CoreServiceConfig, PipelineSettings, QueryOptions, DEFAULT_SYSTEM_TEMPLATE};
use ragline_core::rank::RankConfig;
use ragline_core::retry::RetryPolicy;
use ragline_core::search::SearchMode;
use ragline_core::store::{Metric, SearchFilter};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_boundary")]
    pub boundary: Boundary,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            boundary: default_boundary(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_boundary() -> Boundary {
    Boundary::Paragraph
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on cached vectors. Unbounded when unset.
    #[serde(default = "default_cache_entries")]
    pub cache_entries: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            cache_entries: default_cache_entries(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_model() -> String {
    "hash-bow-v1".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_batch_size() -> usize {
    64
}
fn default_cache_entries() -> Option<usize> {
    Some(10_000)
}
fn default_max_retries() -> u32 {
    1
}
fn default_retry_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `memory` or `sqlite`.
    #[serde(default = "default_index_backend")]
    pub backend: String,
    /// Database file; required for the `sqlite` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_metric")]
    pub metric: Metric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            path: None,
            metric: default_metric(),
        }
    }
}

fn default_index_backend() -> String {
    "memory".to_string()
}
fn default_metric() -> Metric {
    Metric::Cosine
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub diversity: bool,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_fetch_multiplier")]
    pub fetch_multiplier: usize,
    /// `similarity`, `keyword`, or `hybrid`.
    #[serde(default)]
    pub mode: SearchMode,
    /// Weight of the semantic score in hybrid mode.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: 0.0,
            diversity: false,
            lambda: default_lambda(),
            fetch_multiplier: default_fetch_multiplier(),
            mode: SearchMode::default(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_lambda() -> f64 {
    0.7
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_fetch_multiplier() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationSection {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Most recent messages offered to the prompt.
    #[serde(default = "default_history_messages")]
    pub history_messages: Option<usize>,
    #[serde(default)]
    pub history_tokens: Option<usize>,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            ttl_secs: default_ttl_secs(),
            max_sessions: default_max_sessions(),
            history_messages: default_history_messages(),
            history_tokens: None,
        }
    }
}

fn default_max_messages() -> usize {
    50
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_max_sessions() -> usize {
    1000
}
fn default_history_messages() -> Option<usize> {
    Some(10)
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default)]
    pub system_template: Option<String>,
    /// `tiktoken` (cl100k_base) or `chars` (four characters per token).
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            system_template: None,
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_token_budget() -> usize {
    4096
}
fn default_tokenizer() -> String {
    "tiktoken".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationSection {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_true")]
    pub include_sources: bool,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Zero disables the timeout.
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between streamed words of the extractive generator.
    #[serde(default)]
    pub word_delay_ms: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            temperature: default_temperature(),
            max_tokens: None,
            stream: false,
            include_sources: true,
            stream_buffer: default_stream_buffer(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_max_retries(),
            word_delay_ms: 0,
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}
fn default_stream_buffer() -> usize {
    16
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// File extensions picked up when walking directories.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Glob patterns skipped when walking directories, relative to the walk root.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_extensions() -> Vec<String> {
    [
        "txt", "md", "markdown", "rst", "csv", "json", "xml", "html", "htm", "log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            model_id: self.embedding.model.clone(),
            chunking: ChunkConfig {
                chunk_size: self.chunking.chunk_size,
                overlap: self.chunking.overlap,
                boundary: self.chunking.boundary,
            },
            system_template: self
                .prompt
                .system_template
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_TEMPLATE.to_string()),
            token_budget: self.prompt.token_budget,
            rank: RankConfig {
                top_n: self.retrieval.top_k,
                min_score: self.retrieval.min_score,
                diversity: self.retrieval.diversity,
                lambda: self.retrieval.lambda,
            },
            history: HistoryWindow {
                max_messages: self.conversation.history_messages,
                max_tokens: self.conversation.history_tokens,
            },
            fetch_multiplier: self.retrieval.fetch_multiplier,
            search_mode: self.retrieval.mode,
            hybrid_alpha: self.retrieval.hybrid_alpha,
            ingest_concurrency: self.ingest.concurrency,
        }
    }

    pub fn core_services(&self) -> CoreServiceConfig {
        CoreServiceConfig {
            settings: self.pipeline_settings(),
            cache: EmbeddingCacheConfig {
                max_batch_size: self.embedding.batch_size,
                max_entries: self.embedding.cache_entries,
                retry: RetryPolicy {
                    max_retries: self.embedding.max_retries,
                    initial_backoff: Duration::from_millis(self.embedding.retry_backoff_ms),
                },
            },
            conversation: ConversationConfig {
                max_messages: self.conversation.max_messages,
                ttl: Duration::from_secs(self.conversation.ttl_secs),
                max_sessions: self.conversation.max_sessions,
            },
            generation: GenerationConfig {
                stream_buffer: self.generation.stream_buffer,
                retry: RetryPolicy {
                    max_retries: self.generation.max_retries,
                    ..RetryPolicy::default()
                },
                timeout: match self.generation.timeout_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
        }
    }

    /// Per-query defaults taken from `[generation]` and `[retrieval]`.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens,
            stream: self.generation.stream,
            include_sources: self.generation.include_sources,
            top_k: self.retrieval.top_k,
            filter: SearchFilter::default(),
            mode: self.retrieval.mode,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hash" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be hash.", other),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.cache_entries == Some(0) {
        anyhow::bail!("embedding.cache_entries must be > 0 when set");
    }

    // Validate index
    match config.index.backend.as_str() {
        "memory" => {}
        "sqlite" => {
            if config.index.path.is_none() {
                anyhow::bail!("index.path must be specified when backend is 'sqlite'");
            }
        }
        other => anyhow::bail!(
            "Unknown index backend: '{}'. Must be memory or sqlite.",
            other
        ),
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.lambda) {
        anyhow::bail!("retrieval.lambda must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [0.0, 1.0]");
    }
    if config.retrieval.fetch_multiplier < 1 {
        anyhow::bail!("retrieval.fetch_multiplier must be >= 1");
    }

    // Validate conversation
    if config.conversation.max_messages == 0 || config.conversation.max_sessions == 0 {
        anyhow::bail!("conversation.max_messages and conversation.max_sessions must be > 0");
    }
    if config.conversation.ttl_secs == 0 {
        anyhow::bail!("conversation.ttl_secs must be > 0");
    }

    // Validate prompt
    if config.prompt.token_budget == 0 {
        anyhow::bail!("prompt.token_budget must be > 0");
    }
    match config.prompt.tokenizer.as_str() {
        "tiktoken" | "chars" => {}
        other => anyhow::bail!(
            "Unknown tokenizer: '{}'. Must be tiktoken or chars.",
            other
        ),
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "extractive" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be extractive.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if config.generation.stream_buffer == 0 {
        anyhow::bail!("generation.stream_buffer must be > 0");
    }

    // Validate ingest
    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.index.backend, "memory");
        assert!((config.generation.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_sections_parse() {
        let config: Config = toml::from_str(
            r#"
[chunking]
chunk_size = 500
overlap = 50
boundary = "sentence"

[index]
backend = "sqlite"
path = "./data/ragline.sqlite"
metric = "inner_product"

[retrieval]
top_k = 3
diversity = true
lambda = 0.5

[generation]
stream = true
timeout_secs = 0
"#,
        )
        .unwrap();
        validate(&config).unwrap();

        assert_eq!(config.chunking.boundary, Boundary::Sentence);
        assert_eq!(config.index.metric, Metric::InnerProduct);

        let services = config.core_services();
        assert_eq!(services.settings.chunking.chunk_size, 500);
        assert_eq!(services.settings.rank.top_n, 3);
        assert!(services.settings.rank.diversity);
        assert_eq!(services.generation.timeout, None);
        assert!(config.query_options().stream);
    }

    #[test]
    fn test_retrieval_mode() {
        let config = Config::default();
        assert_eq!(config.retrieval.mode, SearchMode::Similarity);
        assert!((config.pipeline_settings().hybrid_alpha - 0.6).abs() < f64::EPSILON);

        let config: Config =
            toml::from_str("[retrieval]\nmode = \"hybrid\"\nhybrid_alpha = 0.25\n").unwrap();
        validate(&config).unwrap();
        let settings = config.pipeline_settings();
        assert_eq!(settings.search_mode, SearchMode::Hybrid);
        assert!((settings.hybrid_alpha - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.query_options().mode, SearchMode::Hybrid);

        let config: Config = toml::from_str("[retrieval]\nhybrid_alpha = 1.5\n").unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));

        assert!(toml::from_str::<Config>("[retrieval]\nmode = \"mmr\"\n").is_err());
    }

    #[test]
    fn test_sqlite_requires_path() {
        let config: Config = toml::from_str("[index]\nbackend = \"sqlite\"\n").unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("index.path"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let config: Config =
            toml::from_str("[chunking]\nchunk_size = 100\noverlap = 100\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"openai\"\n").unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn test_system_template_override() {
        let config: Config =
            toml::from_str("[prompt]\nsystem_template = \"Be brief.\"\n").unwrap();
        assert_eq!(config.pipeline_settings().system_template, "Be brief.");
        assert_eq!(
            Config::default().pipeline_settings().system_template,
            DEFAULT_SYSTEM_TEMPLATE
        );
    }
}
