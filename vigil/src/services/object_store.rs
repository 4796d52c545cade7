//! Object storage through the `rclone` command line tool.
//!
//! Any rclone remote works (S3, R2, GCS, ...). Objects are keyed by the
//! chunk file name and served from `public_url_base`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::ObjectStore;
use super::retry::RetryPolicy;
use crate::{Error, Result};

/// Settings for [`RcloneObjectStore`].
#[derive(Debug, Clone)]
pub struct RcloneSettings {
    pub binary_path: String,
    /// Destination such as `r2:recordings`.
    pub remote: String,
    /// Public base URL the remote is served from.
    pub public_url_base: String,
    /// Per-invocation timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl RcloneSettings {
    pub fn new(remote: impl Into<String>, public_url_base: impl Into<String>) -> Self {
        Self {
            binary_path: "rclone".to_string(),
            remote: remote.into(),
            public_url_base: public_url_base.into(),
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// [`ObjectStore`] backed by `rclone copyto` / `rclone deletefile`.
#[derive(Debug, Clone)]
pub struct RcloneObjectStore {
    settings: RcloneSettings,
}

impl RcloneObjectStore {
    pub fn new(settings: RcloneSettings) -> Self {
        Self { settings }
    }

    pub fn public_url(&self, object_key: &str) -> String {
        format!(
            "{}/{}",
            self.settings.public_url_base.trim_end_matches('/'),
            object_key
        )
    }

    fn remote_path(&self, object_key: &str) -> String {
        format!("{}/{}", self.settings.remote.trim_end_matches('/'), object_key)
    }

    fn upload_args(&self, local_path: &Path, object_key: &str) -> Vec<String> {
        vec![
            "copyto".to_string(),
            local_path.to_string_lossy().to_string(),
            self.remote_path(object_key),
            "--header-upload".to_string(),
            format!("Content-Type: {}", content_type_for(local_path)),
        ]
    }

    async fn run(&self, args: &[String]) -> std::result::Result<(), String> {
        let run = process_utils::tokio_command(&self.settings.binary_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.settings.timeout, run).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(format!(
                "rclone exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Err(e)) => Err(format!("failed to run {}: {}", self.settings.binary_path, e)),
            Err(_) => Err(format!(
                "rclone did not finish within {}s",
                self.settings.timeout.as_secs()
            )),
        }
    }

    /// Run `args`, retrying per the configured policy.
    async fn run_with_retry(&self, op: &str, args: &[String]) -> std::result::Result<(), String> {
        let mut attempt = 0;
        loop {
            match self.run(args).await {
                Ok(()) => return Ok(()),
                Err(e) if self.settings.retry.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "rclone failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ObjectStore for RcloneObjectStore {
    async fn upload(&self, local_path: &Path) -> Result<String> {
        let object_key = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Upload(format!("invalid chunk path {}", local_path.display())))?;

        let args = self.upload_args(local_path, object_key);
        debug!(path = %local_path.display(), key = object_key, "Uploading chunk");
        self.run_with_retry("upload", &args)
            .await
            .map_err(Error::Upload)?;

        let url = self.public_url(object_key);
        info!(key = object_key, url = %url, "Chunk uploaded");
        Ok(url)
    }

    async fn delete(&self, object_key: &str) -> Result<()> {
        let args = vec!["deletefile".to_string(), self.remote_path(object_key)];
        self.run_with_retry("delete", &args)
            .await
            .map_err(Error::Upload)?;
        info!(key = object_key, "Object deleted");
        Ok(())
    }
}

/// MIME type for a chunk file.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("avi") => "video/x-msvideo",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}
