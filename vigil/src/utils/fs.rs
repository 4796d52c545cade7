//! Filesystem helpers shared across modules.
//!
//! These helpers attach the operation and path to IO errors so log lines
//! say what was being done and where.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Size of a file, or `None` if it vanished or cannot be read.
pub async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Replace `target` with `replacement`, removing `replacement` on failure.
pub async fn replace_file(replacement: &Path, target: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::rename(replacement, target).await {
        let _ = tokio::fs::remove_file(replacement).await;
        return Err(io_error("replacing", target, e));
    }
    Ok(())
}
