//! Local analysis index model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// One indexed chunk analysis.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ChunkAnalysisDbModel {
    pub id: String,
    pub video_url: String,
    pub content: String,
    pub local_filename: Option<String>,
    /// JSON object of additional fields.
    pub extra: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

impl ChunkAnalysisDbModel {
    pub fn new(
        content: impl Into<String>,
        video_url: impl Into<String>,
        local_filename: Option<String>,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> crate::Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            video_url: video_url.into(),
            content: content.into(),
            local_filename,
            extra: serde_json::to_string(extra)?,
            created_at: now_ms(),
        })
    }
}
