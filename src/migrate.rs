use anyhow::Result;
use sqlx::SqlitePool;

/// Create the index schema. Safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per indexed chunk, vector stored as little-endian f32 BLOB
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_entries_document ON index_entries(document_id)",
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE index_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Indexes created before keyword search existed
        sqlx::query(
            "INSERT INTO index_fts (chunk_id, document_id, text) \
             SELECT chunk_id, document_id, text FROM index_entries",
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_are_idempotent_and_backfill_fts() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("index.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO index_entries (chunk_id, document_id, chunk_index, text, start_offset, \
             end_offset, hash, dims, embedding, updated_at) \
             VALUES ('c1', 'd1', 0, 'legacy row about cargo', 0, 22, 'h', 1, x'0000803f', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("DROP TABLE index_fts").execute(&pool).await.unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let hits: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM index_fts WHERE index_fts MATCH 'cargo'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(hits, 1);
    }
}
