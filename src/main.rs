//! # Ragline CLI (`ragline`)
//!
//! Command-line front end for the retrieval-augmented generation pipeline.
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline ingest <paths...>` | Chunk, embed, and index files or directories |
//! | `ragline delete <id>` | Remove a document's chunks from the index |
//! | `ragline search "<query>"` | Show ranked passages for a query |
//! | `ragline ask "<question>"` | Answer a question with citations |
//! | `ragline chat` | Interactive multi-turn session with streaming answers |
//! | `ragline stats` | Index counts |
//!
//! `search` and `ask` take `--mode similarity|keyword|hybrid` to override
//! `[retrieval] mode` for one call.
//!
//! With the default in-memory index nothing survives the process, so
//! `search`, `ask` and `chat` accept `--docs <path>` to ingest first.
//! Configure `[index] backend = "sqlite"` for a persistent index.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use ragline::config::{self, Config};
use ragline::fs_loader::{collect_sources, TextFileLoader};
use ragline::logging;
use ragline::services;
use ragline_core::generation::{Generation, StreamFragment};
use ragline_core::loader::document_id_for;
use ragline_core::models::{Answer, RetrievedContext};
use ragline_core::pipeline::{QueryOptions, RagPipeline};
use ragline_core::search::SearchMode;

/// Ragline: retrieval-augmented answers over your local documents.
#[derive(Parser)]
#[command(name = "ragline", version, about)]
struct Cli {
    /// Path to the configuration file. Built-in defaults are used when the
    /// default path does not exist.
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files or directories into the index.
    ///
    /// Directories are walked recursively; only configured extensions are
    /// picked up. Re-ingesting a file replaces its previous chunks.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Delete a document from the index.
    Delete {
        /// Document id, or the ingested path when `--source` is given.
        target: String,

        /// Treat `target` as the path the document was ingested from.
        #[arg(long)]
        source: bool,
    },

    /// Search the index and print ranked passages.
    Search {
        /// Search query text.
        query: String,

        /// Number of passages to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Retrieval mode: similarity, keyword, or hybrid.
        #[arg(long)]
        mode: Option<SearchMode>,

        /// Ingest these paths before searching.
        #[arg(long = "docs")]
        docs: Vec<PathBuf>,
    },

    /// Answer a single question.
    Ask {
        /// The question.
        question: String,

        /// Conversation session id.
        #[arg(long, default_value = "default")]
        session: String,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,

        /// Do not print cited sources.
        #[arg(long)]
        no_sources: bool,

        /// Number of passages to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Retrieval mode: similarity, keyword, or hybrid.
        #[arg(long)]
        mode: Option<SearchMode>,

        /// Sampling temperature passed to the generator.
        #[arg(long)]
        temperature: Option<f32>,

        /// Maximum answer length in tokens.
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Ingest these paths before answering.
        #[arg(long = "docs")]
        docs: Vec<PathBuf>,
    },

    /// Interactive chat. Answers stream; Ctrl-C cancels the current answer.
    ///
    /// Type `/reset` to clear the conversation and `/quit` to exit.
    Chat {
        /// Conversation session id. A random one is generated when omitted.
        #[arg(long)]
        session: Option<String>,

        /// Ingest these paths before starting.
        #[arg(long = "docs")]
        docs: Vec<PathBuf>,
    },

    /// Show document and chunk counts.
    Stats,
}

fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new("./config/ragline.toml") {
        return Ok(Config::default());
    }
    config::load_config(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_or_default(&cli.config)?;
    logging::init_tracing(&cfg.logging)?;

    let pipeline = services::build_pipeline(&cfg).await?;

    match cli.command {
        Commands::Ingest { paths } => {
            ingest_paths(&pipeline, &cfg, &paths).await?;
        }
        Commands::Delete { target, source } => {
            let document_id = if source {
                document_id_for(&target)
            } else {
                target
            };
            let ack = pipeline.delete_document(&document_id).await?;
            println!("deleted {} ({} chunks)", ack.document_id, ack.removed);
        }
        Commands::Search {
            query,
            top_k,
            mode,
            docs,
        } => {
            ingest_paths(&pipeline, &cfg, &docs).await?;
            let top_k = top_k.unwrap_or(cfg.retrieval.top_k);
            let mode = mode.unwrap_or(cfg.retrieval.mode);
            let context = pipeline
                .search_with_mode(&query, top_k, &Default::default(), mode)
                .await?;
            print_context(&context);
        }
        Commands::Ask {
            question,
            session,
            stream,
            no_sources,
            top_k,
            mode,
            temperature,
            max_tokens,
            docs,
        } => {
            ingest_paths(&pipeline, &cfg, &docs).await?;
            let mut options = cfg.query_options();
            options.stream = stream || options.stream;
            options.include_sources = options.include_sources && !no_sources;
            if let Some(k) = top_k {
                options.top_k = k;
            }
            if let Some(mode) = mode {
                options.mode = mode;
            }
            if let Some(t) = temperature {
                options.temperature = t;
            }
            if max_tokens.is_some() {
                options.max_tokens = max_tokens;
            }
            answer(&pipeline, &session, &question, options).await?;
        }
        Commands::Chat { session, docs } => {
            ingest_paths(&pipeline, &cfg, &docs).await?;
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            chat(&pipeline, &cfg, &session).await?;
        }
        Commands::Stats => {
            println!("backend:   {}", pipeline.index().backend_name());
            println!("documents: {}", pipeline.document_count().await?);
            println!("chunks:    {}", pipeline.entry_count().await?);
            let cache = pipeline.embeddings().stats();
            println!(
                "embedding cache: {} entries, {} hits, {} misses",
                cache.entries, cache.hits, cache.misses
            );
        }
    }

    Ok(())
}

async fn ingest_paths(pipeline: &RagPipeline, cfg: &Config, paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let sources = collect_sources(paths, &cfg.ingest)?;
    let loader = TextFileLoader::new(&cfg.ingest);
    let report = pipeline.ingest_sources(&loader, &sources).await;

    for failure in &report.failed {
        eprintln!("skipped {}: {}", failure.source, failure.error);
    }
    println!(
        "ingested documents: {} ({} chunks), failed: {}",
        report.ingested.len(),
        report.total_chunks(),
        report.failed.len()
    );
    if report.ingested.is_empty() && !report.failed.is_empty() {
        anyhow::bail!("no documents could be ingested");
    }
    Ok(())
}

fn print_context(context: &RetrievedContext) {
    if context.is_empty() {
        println!("No results.");
        return;
    }
    for entry in context.iter() {
        let origin = entry.chunk.origin().unwrap_or(&entry.chunk.document_id);
        println!("[{}] {:.3}  {}", entry.rank, entry.score, origin);
        let snippet: String = entry.chunk.text.chars().take(240).collect();
        for line in snippet.lines() {
            println!("    {}", line);
        }
    }
}

fn print_sources(answer: &Answer) {
    if answer.citations.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    for citation in &answer.citations {
        println!(
            "  [{}] {}",
            citation.rank,
            citation.origin.as_deref().unwrap_or(&citation.document_id)
        );
    }
}

async fn answer(
    pipeline: &RagPipeline,
    session: &str,
    question: &str,
    options: QueryOptions,
) -> Result<()> {
    match pipeline.query(session, question, options).await? {
        Generation::Complete(answer) => {
            println!("{}", answer.text);
            print_sources(&answer);
        }
        Generation::Streaming(mut stream) => {
            let interrupt = tokio::spawn(cancel_on_ctrl_c(stream.cancellation_token()));
            let result = drain(&mut stream).await;
            interrupt.abort();
            result?;
        }
    }
    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        cancel.cancel();
    }
}

/// Print fragments as they arrive. Returns an error if the answer broke off.
async fn drain(stream: &mut ragline_core::generation::AnswerStream) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(fragment) = stream.next().await {
        match fragment {
            StreamFragment::Text(text) => {
                print!("{}", text);
                stdout.flush()?;
            }
            StreamFragment::Done { answer } => {
                println!();
                print_sources(&answer);
            }
            StreamFragment::Interrupted { message, .. } => {
                println!();
                anyhow::bail!("answer interrupted: {}", message);
            }
            StreamFragment::Cancelled => {
                println!();
                eprintln!("(cancelled)");
            }
        }
    }
    Ok(())
}

async fn chat(pipeline: &RagPipeline, cfg: &Config, session: &str) -> Result<()> {
    let sweeper_stop = CancellationToken::new();
    let sweeper = services::spawn_session_sweeper(
        pipeline.conversations().clone(),
        Duration::from_secs(60),
        sweeper_stop.clone(),
    );

    eprintln!("session {} (/reset clears history, /quit exits)", session);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                pipeline.clear_session(session);
                eprintln!("history cleared");
                continue;
            }
            _ => {}
        }

        let options = QueryOptions {
            stream: true,
            ..cfg.query_options()
        };
        if let Err(e) = answer(pipeline, session, line, options).await {
            eprintln!("error: {:#}", e);
        }
    }

    sweeper_stop.cancel();
    let _ = sweeper.await;
    Ok(())
}
