//! # Ragline
//!
//! A local-first retrieval-augmented generation pipeline.
//!
//! Ragline chunks and embeds documents into a vector index, retrieves and
//! ranks passages for a question, assembles a prompt under a token budget
//! with conversation history, and streams the generated answer back with
//! citations. The pipeline itself lives in [`ragline_core`]; this crate
//! adds configuration, logging, offline providers, a SQLite index, and the
//! `ragline` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Loader  │──▶│ Chunk+Embed  │──▶│ Vector index │
//! │ (files)  │   │   (cached)   │   │ memory/SQLite│
//! └──────────┘   └──────────────┘   └──────┬───────┘
//!                                          │ search + rank
//!                ┌──────────────┐   ┌──────▼───────┐
//!   history ───▶ │    Prompt    │◀──│   Context    │
//!                │  assembler   │   └──────────────┘
//!                └──────┬───────┘
//!                       ▼
//!                ┌──────────────┐
//!                │  Generation  │──▶ answer / fragment stream
//!                └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline ingest ./docs              # chunk, embed, and index files
//! ragline search "deployment"        # ranked passages
//! ragline ask "How do we deploy?"    # answer with citations
//! ragline chat --session ops         # multi-turn, streaming
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`providers`] | Offline embedder, generator, and token counter |
//! | [`fs_loader`] | File discovery and text loading |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Index schema |
//! | [`sqlite_store`] | SQLite vector index |
//! | [`services`] | Container wiring |

pub mod config;
pub mod db;
pub mod fs_loader;
pub mod logging;
pub mod migrate;
pub mod providers;
pub mod services;
pub mod sqlite_store;

pub use ragline_core;
