//! Local analysis index on SQLite.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{IndexFields, VectorIndex};
use crate::Result;
use crate::database::models::ChunkAnalysisDbModel;
use crate::database::repositories::IndexRepository;

/// [`VectorIndex`] that stores documents in the `chunk_analysis` table.
///
/// Documents are keyed by URL, so delivering the same chunk twice replaces
/// the earlier document.
pub struct SqliteVectorIndex {
    repo: Arc<dyn IndexRepository>,
}

impl SqliteVectorIndex {
    pub fn new(repo: Arc<dyn IndexRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn add(&self, content: &str, url: &str, extra: IndexFields) -> Result<()> {
        let local_filename = extra
            .get("local_path")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let doc = ChunkAnalysisDbModel::new(content, url, local_filename, &extra)?;
        self.repo.upsert(&doc).await?;
        debug!(url, id = %doc.id, "Analysis indexed");
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        self.repo.clear().await
    }
}
