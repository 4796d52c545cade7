//! External collaborators of the chunk pipeline.
//!
//! The pipeline only sees the traits below; the concrete clients are
//! constructed once in `main` and shared behind `Arc`s.

pub mod object_store;
pub mod retry;
pub mod vector_index;
pub mod vision;

use std::path::Path;

use async_trait::async_trait;

use crate::Result;

pub use object_store::{RcloneObjectStore, RcloneSettings};
pub use retry::RetryPolicy;
pub use vector_index::SqliteVectorIndex;
pub use vision::{OpenAiVisionAnalyzer, VisionSettings};

/// Extra fields stored alongside an indexed document.
pub type IndexFields = serde_json::Map<String, serde_json::Value>;

/// Object storage that serves uploaded chunks publicly.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local_path` and return its public URL.
    async fn upload(&self, local_path: &Path) -> Result<String>;

    async fn delete(&self, object_key: &str) -> Result<()>;
}

/// Video understanding model.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    /// Analyze the video at `video_url`, sampled at `sampling_fps`.
    async fn analyze(&self, video_url: &str, prompt: &str, sampling_fps: u32) -> Result<String>;
}

/// Write-only document index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(&self, content: &str, url: &str, extra: IndexFields) -> Result<()>;

    /// Remove every document, returning how many were removed.
    async fn clear(&self) -> Result<u64>;
}
