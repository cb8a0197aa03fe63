//! Filesystem document loading.
//!
//! [`collect_sources`] expands CLI paths into a sorted list of files
//! (directories are walked recursively, keeping supported extensions and
//! skipping excluded globs). [`TextFileLoader`] implements the core
//! [`DocumentLoader`] contract for plain-text formats; HTML and XML markup
//! is stripped down to its text.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use ragline_core::error::{RagError, Result as RagResult};
use ragline_core::loader::{DocumentLoader, LoadedDocument};
use ragline_core::models::Metadata;

use crate::config::IngestConfig;

/// Expand files and directories into the list of files to ingest.
///
/// Explicit file paths are kept as given, even with an unsupported
/// extension, so the loader can report them. Directory walks only pick up
/// files whose extension is configured.
pub fn collect_sources(paths: &[PathBuf], config: &IngestConfig) -> Result<Vec<String>> {
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut sources = BTreeSet::new();
    for root in paths {
        if !root.exists() {
            bail!("Path does not exist: {}", root.display());
        }
        if root.is_file() {
            sources.insert(root.to_string_lossy().to_string());
            continue;
        }

        let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if exclude_set.is_match(relative) {
                continue;
            }
            if !has_supported_extension(path, &config.extensions) {
                continue;
            }
            sources.insert(path.to_string_lossy().to_string());
        }
    }

    Ok(sources.into_iter().collect())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

fn has_supported_extension(path: &Path, extensions: &[String]) -> bool {
    match extension_of(path) {
        Some(ext) => extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

/// Loads UTF-8 text files from disk.
pub struct TextFileLoader {
    extensions: Vec<String>,
    max_file_bytes: u64,
}

impl TextFileLoader {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            max_file_bytes: config.max_file_bytes,
        }
    }

    fn load_error(source: &str, message: impl Into<String>) -> RagError {
        RagError::DocumentLoad {
            origin: source.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl DocumentLoader for TextFileLoader {
    async fn load(&self, source: &str) -> RagResult<LoadedDocument> {
        let path = Path::new(source);
        if !has_supported_extension(path, &self.extensions) {
            return Err(Self::load_error(source, "unsupported file type"));
        }

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Self::load_error(source, e.to_string()))?;
        if !meta.is_file() {
            return Err(Self::load_error(source, "not a regular file"));
        }
        if meta.len() > self.max_file_bytes {
            return Err(Self::load_error(
                source,
                format!(
                    "file is {} bytes, larger than the {} byte limit",
                    meta.len(),
                    self.max_file_bytes
                ),
            ));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Self::load_error(source, e.to_string()))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| Self::load_error(source, "file is not valid UTF-8"))?;

        let ext = extension_of(path).unwrap_or_default();
        let text = match ext.as_str() {
            "html" | "htm" | "xml" => strip_markup(&raw),
            _ => raw,
        };

        let mut metadata = Metadata::new();
        if let Some(name) = path.file_name() {
            metadata.insert(
                "title".to_string(),
                name.to_string_lossy().to_string().into(),
            );
        }
        metadata.insert("extension".to_string(), ext.into());
        metadata.insert("size_bytes".to_string(), meta.len().into());
        if let Ok(modified) = meta.modified() {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            metadata.insert("modified_at".to_string(), modified.to_rfc3339().into());
        }

        Ok(LoadedDocument { text, metadata })
    }
}

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "li", "h1", "h2", "h3", "h4", "h5", "h6", "tr",
];

/// Drop tags, `<script>`/`<style>` bodies, and decode the common entities.
fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tag_start = &rest[open..];
        let Some(close) = tag_start.find('>') else {
            rest = "";
            break;
        };
        let tag = tag_start[1..close].trim().to_ascii_lowercase();
        rest = &tag_start[close + 1..];

        for skipped in ["script", "style"] {
            if tag == skipped || tag.starts_with(&format!("{} ", skipped)) {
                let end_tag = format!("</{}", skipped);
                match rest.to_ascii_lowercase().find(&end_tag) {
                    Some(end) => {
                        let after = &rest[end..];
                        rest = after.find('>').map(|i| &after[i + 1..]).unwrap_or("");
                    }
                    None => rest = "",
                }
            }
        }

        // Block-level tags break lines so paragraphs survive chunking.
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");
        if BLOCK_TAGS.contains(&name) {
            out.push('\n');
        }
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    // Collapse runs of blank lines left behind by nested markup.
    let mut text = String::with_capacity(decoded.len());
    let mut blank_run = 0;
    for line in decoded.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        text.push_str(line);
        text.push('\n');
    }
    text.trim().to_string()
}
