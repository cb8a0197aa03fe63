//! End-to-end tests of the library API against an on-disk SQLite index.

use std::fs;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tempfile::TempDir;

use ragline::config::{load_config, Config};
use ragline::fs_loader::{collect_sources, TextFileLoader};
use ragline::services::build_pipeline;
use ragline_core::conversation::{HistoryWindow, SessionState};
use ragline_core::generation::{Generation, StreamFragment};
use ragline_core::loader::document_id_for;
use ragline_core::models::Role;
use ragline_core::pipeline::RagPipeline;
use ragline_core::search::SearchMode;
use ragline_core::tokens::CharTokenCounter;
use ragline_core::RagError;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[chunking]
chunk_size = 200
overlap = 40

[index]
backend = "sqlite"
path = "{}/data/ragline.sqlite"

[prompt]
tokenizer = "chars"
"#,
        root.display()
    );
    let config_path = config_dir.join("ragline.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

async fn ingest_files(pipeline: &RagPipeline, config: &Config, root: &Path) -> usize {
    let sources = collect_sources(&[root.join("files")], &config.ingest).unwrap();
    let loader = TextFileLoader::new(&config.ingest);
    let report = pipeline.ingest_sources(&loader, &sources).await;
    assert!(report.is_complete_success(), "failures: {:?}", report.failed);
    report.ingested.len()
}

#[tokio::test]
async fn test_index_persists_across_pipelines() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();

    {
        let pipeline = build_pipeline(&config).await.unwrap();
        assert_eq!(ingest_files(&pipeline, &config, tmp.path()).await, 3);
        assert_eq!(pipeline.document_count().await.unwrap(), 3);
    }

    let reopened = build_pipeline(&config).await.unwrap();
    assert_eq!(reopened.index().backend_name(), "sqlite");
    assert_eq!(reopened.document_count().await.unwrap(), 3);

    let context = reopened
        .search("kubernetes docker deployment", 1, &Default::default())
        .await
        .unwrap();
    assert_eq!(context.len(), 1);
    assert!(context.entries[0]
        .chunk
        .origin()
        .unwrap()
        .ends_with("gamma.txt"));
}

#[tokio::test]
async fn test_keyword_and_hybrid_modes_on_sqlite() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();
    let pipeline = build_pipeline(&config).await.unwrap();
    ingest_files(&pipeline, &config, tmp.path()).await;
    let filter = Default::default();

    let keyword = pipeline
        .search_with_mode("PyTorch", 5, &filter, SearchMode::Keyword)
        .await
        .unwrap();
    assert_eq!(keyword.len(), 1);
    assert!(keyword.entries[0].chunk.text.contains("PyTorch"));

    let nothing = pipeline
        .search_with_mode("zeppelin", 5, &filter, SearchMode::Keyword)
        .await
        .unwrap();
    assert!(nothing.is_empty());

    let hybrid = pipeline
        .search_with_mode("PyTorch", 5, &filter, SearchMode::Hybrid)
        .await
        .unwrap();
    assert!(hybrid.len() > 1);
    assert_eq!(hybrid.entries[0].chunk.id, keyword.entries[0].chunk.id);

    // Deleted chunks leave the full-text table too.
    let beta = tmp.path().join("files").join("beta.md");
    pipeline
        .delete_document(&document_id_for(&beta.to_string_lossy()))
        .await
        .unwrap();
    let keyword = pipeline
        .search_with_mode("PyTorch", 5, &filter, SearchMode::Keyword)
        .await
        .unwrap();
    assert!(keyword.is_empty());
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();
    let pipeline = build_pipeline(&config).await.unwrap();

    ingest_files(&pipeline, &config, tmp.path()).await;
    let entries = pipeline.entry_count().await.unwrap();

    ingest_files(&pipeline, &config, tmp.path()).await;
    assert_eq!(pipeline.entry_count().await.unwrap(), entries);
    assert_eq!(pipeline.document_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_delete_by_source() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();
    let pipeline = build_pipeline(&config).await.unwrap();
    ingest_files(&pipeline, &config, tmp.path()).await;

    let source = tmp.path().join("files").join("beta.md");
    let ack = pipeline
        .delete_document(&document_id_for(&source.to_string_lossy()))
        .await
        .unwrap();
    assert!(ack.removed > 0);
    assert_eq!(pipeline.document_count().await.unwrap(), 2);

    let context = pipeline
        .search("python machine learning", 5, &Default::default())
        .await
        .unwrap();
    assert!(context
        .iter()
        .all(|e| !e.chunk.origin().unwrap_or_default().ends_with("beta.md")));
}

#[tokio::test]
async fn test_query_answers_with_citations_and_history() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();
    let pipeline = build_pipeline(&config).await.unwrap();
    ingest_files(&pipeline, &config, tmp.path()).await;

    let answer = pipeline
        .query("s1", "What does it say about cargo?", config.query_options())
        .await
        .unwrap()
        .into_answer()
        .await
        .unwrap();
    assert!(answer.text.contains("cargo"), "answer: {}", answer.text);
    assert!(!answer.citations.is_empty());

    let history = pipeline.conversations().history(
        "s1",
        HistoryWindow::default(),
        &CharTokenCounter,
    );
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, answer.text);
    assert_eq!(pipeline.session_state("s1"), SessionState::Active);
}

#[tokio::test]
async fn test_streaming_query_matches_complete_answer() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();
    let pipeline = build_pipeline(&config).await.unwrap();
    ingest_files(&pipeline, &config, tmp.path()).await;

    let question = "Which frameworks are covered for deep learning?";
    let complete = pipeline
        .query("a", question, config.query_options())
        .await
        .unwrap()
        .into_answer()
        .await
        .unwrap();

    let mut options = config.query_options();
    options.stream = true;
    let Generation::Streaming(mut stream) = pipeline.query("b", question, options).await.unwrap()
    else {
        panic!("expected a stream");
    };

    let mut text = String::new();
    let mut done = None;
    while let Some(fragment) = stream.next().await {
        match fragment {
            StreamFragment::Text(t) => text.push_str(&t),
            StreamFragment::Done { answer } => done = Some(answer),
            other => panic!("unexpected fragment: {:?}", other),
        }
    }
    let done = done.expect("stream should finish with Done");
    assert_eq!(text, complete.text);
    assert_eq!(done.text, complete.text);
    assert!(complete.text.contains("PyTorch"));
}

#[tokio::test]
async fn test_load_errors_do_not_abort_batch() {
    let (tmp, config_path) = setup_test_env();
    let config = load_config(&config_path).unwrap();
    let pipeline = build_pipeline(&config).await.unwrap();

    let files = tmp.path().join("files");
    fs::write(files.join("binary.txt"), [0xff, 0xfe, 0x00]).unwrap();
    let sources = vec![
        files.join("alpha.md").to_string_lossy().to_string(),
        files.join("binary.txt").to_string_lossy().to_string(),
        files.join("missing.md").to_string_lossy().to_string(),
    ];
    let report = pipeline
        .ingest_sources(&TextFileLoader::new(&config.ingest), &sources)
        .await;

    assert_eq!(report.ingested.len(), 1);
    assert_eq!(report.failed.len(), 2);
    assert!(report
        .failed
        .iter()
        .all(|f| matches!(f.error, RagError::DocumentLoad { .. })));
}

#[tokio::test]
async fn test_tiny_budget_overflows() {
    let (_tmp, config_path) = setup_test_env();
    let mut config = load_config(&config_path).unwrap();
    config.prompt.token_budget = 40;
    let pipeline = build_pipeline(&config).await.unwrap();

    let err = pipeline
        .query("s", "Is there anything about cargo?", config.query_options())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RagError::ContextWindowOverflow { .. }));
    assert_eq!(pipeline.session_state("s"), SessionState::Empty);
}
