//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    #[error("Capture tool not available: {0}")]
    CaptureToolMissing(String),

    #[error("Capture process exited unexpectedly (exit_code={exit_code:?}) stderr_tail={stderr_tail}")]
    CaptureFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Cannot determine stream geometry: {0}")]
    StreamGeometry(String),

    #[error("Source read failed {attempts} consecutive times: {last_error}")]
    SourceExhausted { attempts: u32, last_error: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Index write failed: {0}")]
    Index(String),

    #[error("Stage {stage} timed out after {secs}s")]
    StageTimeout { stage: &'static str, secs: u64 },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Errors that end a recording session (it moves to `Failed`).
    ///
    /// Everything else is either retried in place or isolated to one chunk.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::CaptureToolMissing(_)
                | Self::CaptureFailed { .. }
                | Self::StreamGeometry(_)
                | Self::SourceExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::CaptureToolMissing("ffmpeg".into()).is_fatal_to_session());
        assert!(
            Error::CaptureFailed {
                exit_code: Some(1),
                stderr_tail: "(none)".into()
            }
            .is_fatal_to_session()
        );
        assert!(!Error::Upload("boom".into()).is_fatal_to_session());
        assert!(!Error::AlreadyRecording.is_fatal_to_session());
    }

    #[test]
    fn test_session_error_messages() {
        assert_eq!(Error::AlreadyRecording.to_string(), "already recording");
        assert_eq!(Error::NotRecording.to_string(), "not recording");
    }
}
