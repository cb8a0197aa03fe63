//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Each chunk is one row of `index_entries` with its vector stored as a
//! little-endian `f32` BLOB, mirrored into the `index_fts` FTS5 table for
//! keyword search. Similarity search loads the candidate rows and scores
//! them in process (brute force), which is plenty for a local collection of
//! a few hundred thousand chunks. Keyword search ranks with FTS5 BM25.
//!
//! Writes from one process are serialized so the dimensionality check and
//! the insert see the same table state.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use ragline_core::embedding::{blob_to_vec, cosine_similarity, inner_product, vec_to_blob};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{Chunk, IndexEntry, Metadata, ScoredEntry};
use ragline_core::store::{
    check_dims, keyword_terms, sort_and_truncate, Metric, ScoreNormalization, SearchFilter,
    VectorIndex,
};

/// SQLite implementation of the [`VectorIndex`] trait.
///
/// The schema is created by [`crate::migrate::run_migrations`].
pub struct SqliteIndex {
    pool: SqlitePool,
    metric: Metric,
    write_lock: Mutex<()>,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, metric: Metric) -> Self {
        Self {
            pool,
            metric,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn storage(e: impl std::fmt::Display) -> RagError {
    RagError::Storage(e.to_string())
}

/// FTS5 query matching any of the query's terms. Each term is quoted so
/// user punctuation never reaches the FTS5 query syntax.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms = keyword_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn entry_from_row(row: &SqliteRow) -> Result<IndexEntry> {
    let metadata_json: String = row.try_get("metadata_json").map_err(storage)?;
    let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(storage)?;
    let chunk_index: i64 = row.try_get("chunk_index").map_err(storage)?;
    let start: i64 = row.try_get("start_offset").map_err(storage)?;
    let end: i64 = row.try_get("end_offset").map_err(storage)?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(storage)?;

    Ok(IndexEntry {
        chunk: Chunk {
            id: row.try_get("chunk_id").map_err(storage)?,
            document_id: row.try_get("document_id").map_err(storage)?,
            index: chunk_index as usize,
            text: row.try_get("text").map_err(storage)?,
            start: start as usize,
            end: end as usize,
            hash: row.try_get("hash").map_err(storage)?,
            metadata,
        },
        vector: blob_to_vec(&blob),
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    fn normalization(&self) -> ScoreNormalization {
        match self.metric {
            Metric::Cosine => ScoreNormalization::CosineShift,
            Metric::InnerProduct => ScoreNormalization::MinMax,
        }
    }

    async fn dims(&self) -> Result<Option<usize>> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM index_entries LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(dims.map(|d| d as usize))
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Validate the whole batch against the table as this transaction sees it.
        let stored: Option<i64> = sqlx::query_scalar("SELECT dims FROM index_entries LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        let mut dims = stored.map(|d| d as usize);
        for entry in &entries {
            if entry.vector.is_empty() {
                return Err(RagError::Storage(format!(
                    "empty vector for chunk {}",
                    entry.chunk.id
                )));
            }
            check_dims(dims, entry.vector.len())?;
            dims = Some(entry.vector.len());
        }

        let now = chrono::Utc::now().timestamp();
        for entry in &entries {
            let metadata_json = serde_json::to_string(&entry.chunk.metadata).map_err(storage)?;
            sqlx::query(
                r#"
                INSERT INTO index_entries (chunk_id, document_id, chunk_index, text,
                                           start_offset, end_offset, hash, metadata_json,
                                           dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    hash = excluded.hash,
                    metadata_json = excluded.metadata_json,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.chunk.id)
            .bind(&entry.chunk.document_id)
            .bind(entry.chunk.index as i64)
            .bind(&entry.chunk.text)
            .bind(entry.chunk.start as i64)
            .bind(entry.chunk.end as i64)
            .bind(&entry.chunk.hash)
            .bind(metadata_json)
            .bind(entry.vector.len() as i64)
            .bind(vec_to_blob(&entry.vector))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

            sqlx::query("DELETE FROM index_fts WHERE chunk_id = ?")
                .bind(&entry.chunk.id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            sqlx::query("INSERT INTO index_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&entry.chunk.id)
                .bind(&entry.chunk.document_id)
                .bind(&entry.chunk.text)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;

        debug!(upserted = entries.len(), "Upserted index rows");
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM index_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let Some(dims) = self.dims().await? else {
            return Ok(Vec::new());
        };
        check_dims(Some(dims), query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, chunk_index, text, start_offset, end_offset,
                   hash, metadata_json, embedding
            FROM index_entries
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = entry_from_row(row)?;
            if !filter.matches(&entry.chunk) {
                continue;
            }
            let raw = match self.metric {
                Metric::Cosine => cosine_similarity(query, &entry.vector),
                Metric::InnerProduct => inner_product(query, &entry.vector),
            };
            results.push(ScoredEntry {
                entry,
                raw_score: raw as f64,
            });
        }

        sort_and_truncate(&mut results, k);
        Ok(results)
    }

    async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let Some(expression) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        // bm25() is lower-is-better; negate so higher raw scores win.
        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.document_id, e.chunk_index, e.text, e.start_offset,
                   e.end_offset, e.hash, e.metadata_json, e.embedding,
                   bm25(index_fts) AS bm25_score
            FROM index_fts
            JOIN index_entries e ON e.chunk_id = index_fts.chunk_id
            WHERE index_fts MATCH ?
            ORDER BY bm25_score
            "#,
        )
        .bind(expression)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut results = Vec::with_capacity(rows.len().min(k));
        for row in &rows {
            let entry = entry_from_row(row)?;
            if !filter.matches(&entry.chunk) {
                continue;
            }
            let bm25: f64 = row.try_get("bm25_score").map_err(storage)?;
            results.push(ScoredEntry {
                entry,
                raw_score: -bm25,
            });
        }

        sort_and_truncate(&mut results, k);
        Ok(results)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(n as usize)
    }

    async fn document_count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT document_id) FROM index_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteIndex {
        let pool = db::connect(&tmp.path().join("data").join("index.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        SqliteIndex::new(pool, Metric::Cosine)
    }

    fn entry(chunk_id: &str, doc_id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: Chunk {
                id: chunk_id.to_string(),
                document_id: doc_id.to_string(),
                index: 0,
                text: format!("text of {}", chunk_id),
                start: 0,
                end: 10,
                hash: "h".to_string(),
                metadata: Metadata::new(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_search_delete() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;

        index
            .upsert(vec![
                entry("a#0", "a", vec![1.0, 0.0]),
                entry("b#0", "b", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(index.dims().await.unwrap(), Some(2));
        assert_eq!(index.count().await.unwrap(), 2);
        assert_eq!(index.document_count().await.unwrap(), 2);

        let hits = index
            .similarity_search(&[1.0, 0.1], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].entry.chunk.id, "a#0");
        assert_eq!(hits[0].entry.chunk.text, "text of a#0");

        assert_eq!(index.delete("a").await.unwrap(), 1);
        assert_eq!(index.delete("a").await.unwrap(), 0);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_chunk() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;

        index.upsert(vec![entry("a#0", "a", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(vec![entry("a#0", "a", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let hits = index
            .similarity_search(&[0.0, 1.0], 1, &SearchFilter::default())
            .await
            .unwrap();
        assert!((hits[0].raw_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejects_whole_batch() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index.upsert(vec![entry("a#0", "a", vec![1.0, 0.0])]).await.unwrap();

        let err = index
            .upsert(vec![
                entry("b#0", "b", vec![1.0, 0.0]),
                entry("c#0", "c", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RagError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        assert_eq!(index.count().await.unwrap(), 1);

        let err = index
            .similarity_search(&[1.0], 3, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_filter_and_metadata_survive_storage() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;

        let mut tagged = entry("a#0", "a", vec![1.0, 0.0]);
        tagged
            .chunk
            .metadata
            .insert("lang".to_string(), serde_json::json!("en"));
        index
            .upsert(vec![tagged, entry("b#0", "b", vec![1.0, 0.0])])
            .await
            .unwrap();

        let mut filter = SearchFilter::default();
        filter
            .metadata
            .insert("lang".to_string(), serde_json::json!("en"));
        let hits = index.similarity_search(&[1.0, 0.0], 5, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk.id, "a#0");

        let hits = index
            .similarity_search(&[1.0, 0.0], 5, &SearchFilter::documents(["b"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk.id, "b#0");
    }

    #[tokio::test]
    async fn test_concurrent_first_upserts_agree_on_dims() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;

        let (two, three) = tokio::join!(
            index.upsert(vec![entry("a#0", "a", vec![1.0, 0.0])]),
            index.upsert(vec![entry("b#0", "b", vec![1.0, 0.0, 0.0])]),
        );
        let outcomes = [two, three];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(RagError::DimensionMismatch { .. }))));

        let distinct: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT dims) FROM index_entries")
            .fetch_one(index.pool())
            .await
            .unwrap();
        assert_eq!(distinct, 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyword_search_uses_fts() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;

        let mut rust = entry("rust#0", "rust", vec![1.0, 0.0]);
        rust.chunk.text = "Cargo is the Rust package manager.".to_string();
        let mut ops = entry("ops#0", "ops", vec![0.0, 1.0]);
        ops.chunk.text = "Deployments run on Kubernetes.".to_string();
        index.upsert(vec![rust, ops]).await.unwrap();

        // Punctuation in the query must not break the FTS5 syntax.
        let hits = index
            .keyword_search("What's the package manager (cargo)?", 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk.id, "rust#0");
        assert_eq!(hits[0].entry.vector, vec![1.0, 0.0]);

        let hits = index
            .keyword_search("kubernetes cargo", 5, &SearchFilter::documents(["ops"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk.id, "ops#0");

        // Re-upserting and deleting keep the FTS table in step.
        let mut moved = entry("rust#0", "rust", vec![1.0, 0.0]);
        moved.chunk.text = "Now about rustup.".to_string();
        index.upsert(vec![moved]).await.unwrap();
        assert!(index
            .keyword_search("cargo", 5, &SearchFilter::default())
            .await
            .unwrap()
            .is_empty());

        index.delete("ops").await.unwrap();
        assert!(index
            .keyword_search("kubernetes", 5, &SearchFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_fts_match_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("cargo AND \"rust\"").as_deref(),
            Some("\"cargo\" OR \"and\" OR \"rust\"")
        );
        assert_eq!(fts_match_expression("?!"), None);
    }

    #[tokio::test]
    async fn test_empty_index_searches_empty() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let hits = index
            .similarity_search(&[1.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.dims().await.unwrap(), None);
    }
}
