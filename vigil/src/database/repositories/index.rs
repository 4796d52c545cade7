//! Local analysis index repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ChunkAnalysisDbModel;

/// Analysis index repository trait.
#[async_trait]
pub trait IndexRepository: Send + Sync {
    /// Insert, or replace the document stored for the same video URL.
    async fn upsert(&self, doc: &ChunkAnalysisDbModel) -> Result<()>;
    async fn get_by_url(&self, video_url: &str) -> Result<Option<ChunkAnalysisDbModel>>;
    async fn count(&self) -> Result<i64>;
    /// Remove every document, returning how many were removed.
    async fn clear(&self) -> Result<u64>;
}

/// SQLx implementation of [`IndexRepository`].
pub struct SqlxIndexRepository {
    pool: SqlitePool,
}

impl SqlxIndexRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexRepository for SqlxIndexRepository {
    async fn upsert(&self, doc: &ChunkAnalysisDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_analysis (id, video_url, content, local_filename, extra, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(video_url) DO UPDATE SET
                content = excluded.content,
                local_filename = excluded.local_filename,
                extra = excluded.extra,
                created_at = excluded.created_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.video_url)
        .bind(&doc.content)
        .bind(&doc.local_filename)
        .bind(&doc.extra)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_url(&self, video_url: &str) -> Result<Option<ChunkAnalysisDbModel>> {
        let doc = sqlx::query_as::<_, ChunkAnalysisDbModel>(
            "SELECT * FROM chunk_analysis WHERE video_url = ?",
        )
        .bind(video_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunk_analysis")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_analysis")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::migrated_pool;

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_url() {
        let (pool, _temp) = migrated_pool().await;
        let repo = SqlxIndexRepository::new(pool);
        let extra = serde_json::Map::new();

        let url = "https://cdn/a.mp4";
        let first =
            ChunkAnalysisDbModel::new("first", url, Some("a.mp4".into()), &extra).unwrap();
        let second =
            ChunkAnalysisDbModel::new("second", url, Some("a.mp4".into()), &extra).unwrap();
        repo.upsert(&first).await.unwrap();
        repo.upsert(&second).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        let stored = repo.get_by_url("https://cdn/a.mp4").await.unwrap().unwrap();
        assert_eq!(stored.content, "second");
        assert_eq!(stored.id, first.id);

        assert_eq!(repo.clear().await.unwrap(), 1);
        assert!(repo.get_by_url("https://cdn/a.mp4").await.unwrap().is_none());
    }
}
