//! Post-processing of stable segment files.
//!
//! Segments from the stream-copy path get a container-level faststart
//! rewrite. This is best effort: on failure the original file is left
//! untouched.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use crate::utils::fs::replace_file;
use crate::{Error, Result};

/// Container extensions that support `-movflags +faststart`.
const FASTSTART_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v"];

/// Make a stable segment ready for dispatch.
#[async_trait]
pub trait SegmentFinalizer: Send + Sync {
    /// Rewrite `path` in place. An error means the file was left as it was.
    async fn finalize(&self, path: &Path) -> Result<()>;
}

/// Finalizer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFinalizer;

#[async_trait]
impl SegmentFinalizer for NoopFinalizer {
    async fn finalize(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Moves the `moov` atom to the front without re-encoding.
#[derive(Debug, Clone)]
pub struct FaststartFinalizer {
    binary_path: String,
    timeout: Duration,
}

impl FaststartFinalizer {
    pub fn new(binary_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
        }
    }

    /// The temp output has a non-video extension so the watcher never sees
    /// it as a chunk, hence the explicit `-f`.
    fn build_args(input: &Path, output: &Path, format: &str) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            format.to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl SegmentFinalizer for FaststartFinalizer {
    async fn finalize(&self, path: &Path) -> Result<()> {
        let Some(ext) =
            extension_of(path).filter(|ext| FASTSTART_EXTENSIONS.contains(&ext.as_str()))
        else {
            debug!(path = %path.display(), "Skipping faststart for non-MP4 container");
            return Ok(());
        };

        let format = if ext == "mov" { "mov" } else { "mp4" };
        let temp = sibling_path(path, "faststart", "tmp");
        let args = Self::build_args(path, &temp, format);

        run_ffmpeg(&self.binary_path, &args, self.timeout, &temp).await?;
        replace_file(&temp, path).await
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// `<dir>/<stem>_<tag>.<ext>`
fn sibling_path(path: &Path, tag: &str, ext: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_{tag}.{ext}"))
}

/// Run ffmpeg to completion; `output` is removed if it does not succeed.
async fn run_ffmpeg(
    binary_path: &str,
    args: &[String],
    timeout: Duration,
    output: &Path,
) -> Result<()> {
    let run = process_utils::tokio_command(binary_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let failure = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(result)) if result.status.success() => return Ok(()),
        Ok(Ok(result)) => format!(
            "ffmpeg exited with {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        ),
        Ok(Err(e)) => format!("failed to run ffmpeg: {}", e),
        Err(_) => format!("ffmpeg did not finish within {}s", timeout.as_secs()),
    };

    let _ = tokio::fs::remove_file(output).await;
    Err(Error::Other(failure))
}
