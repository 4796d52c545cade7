//! Capture strategy trait and related types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Which capture path produced a session's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// ffmpeg segment muxer with stream copy.
    Segment,
    /// Frame-by-frame decode and write, used when ffmpeg is missing.
    Fallback,
}

impl CaptureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Segment => "segment",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-session capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Source stream URI.
    pub source_uri: String,
    /// Directory chunk files are written to.
    pub output_dir: PathBuf,
    /// Target stream time covered by each chunk.
    pub chunk_duration: Duration,
}

impl CaptureConfig {
    pub fn new(
        source_uri: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        chunk_duration: Duration,
    ) -> Self {
        Self {
            source_uri: source_uri.into(),
            output_dir: output_dir.into(),
            chunk_duration,
        }
    }
}

/// A finished chunk, ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReady {
    /// Path of the finalized chunk file.
    pub path: PathBuf,
    /// When the chunk was declared finished.
    pub created_at: DateTime<Utc>,
    /// Capture path that produced it.
    pub origin: CaptureKind,
}

impl ChunkReady {
    pub fn new(path: impl Into<PathBuf>, origin: CaptureKind) -> Self {
        Self {
            path: path.into(),
            created_at: Utc::now(),
            origin,
        }
    }
}

/// Handle to a running capture.
///
/// The task resolves `Ok(())` once a requested stop has completed and with
/// a fatal error if the capture ended on its own.
pub struct CaptureHandle {
    task: JoinHandle<Result<()>>,
}

impl CaptureHandle {
    pub fn new(task: JoinHandle<Result<()>>) -> Self {
        Self { task }
    }

    /// Wait for the capture task to end.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(crate::Error::Other(format!("Capture task aborted: {}", e))),
        }
    }
}

/// A way of turning a live source into chunk files.
#[async_trait]
pub trait CaptureStrategy: Send + Sync {
    /// Get the capture kind.
    fn kind(&self) -> CaptureKind;

    /// Check whether the tooling this strategy needs is present.
    async fn is_available(&self) -> bool;

    /// Whether chunks appear as files that must be discovered by the
    /// segment watcher (`true`), or are reported on `chunk_tx` directly.
    fn needs_watcher(&self) -> bool;

    /// Start capturing until `cancel` fires.
    ///
    /// Errors that can be detected up front (missing geometry, spawn
    /// failure) are returned here rather than through the handle.
    async fn start(
        &self,
        config: &CaptureConfig,
        chunk_tx: mpsc::Sender<ChunkReady>,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_kind_display() {
        assert_eq!(CaptureKind::Segment.to_string(), "segment");
        assert_eq!(CaptureKind::Fallback.as_str(), "fallback");
    }

    #[tokio::test]
    async fn test_capture_handle_reports_task_result() {
        let handle = CaptureHandle::new(tokio::spawn(async {
            Err(crate::Error::CaptureFailed {
                exit_code: Some(1),
                stderr_tail: "(none)".to_string(),
            })
        }));
        let err = handle.wait().await.unwrap_err();
        assert!(err.is_fatal_to_session());
    }
}
