//! ffmpeg segment-muxer capture.
//!
//! One long-lived ffmpeg process stream-copies the source video into
//! `chunk_YYYYMMDD_HHMMSS.mp4` files, rolling over every chunk duration.
//! Chunks are discovered by the segment watcher, so this module only owns
//! the process: spawn, diagnostic draining, crash detection and stop.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::diagnostics::{DEFAULT_TAIL_LINES, StderrTail};
use super::options::FfmpegOptions;
use super::traits::{CaptureConfig, CaptureHandle, CaptureKind, CaptureStrategy, ChunkReady};
use crate::recordings::segment_output_template;
use crate::utils::fs::ensure_dir_all_with_op;
use crate::{Error, Result};

/// Settings for the ffmpeg capture process.
#[derive(Debug, Clone)]
pub struct FfmpegCaptureSettings {
    /// Path or name of the ffmpeg binary.
    pub binary_path: String,
    /// How long ffmpeg gets to finalize after `q` before it is killed.
    pub stop_grace: Duration,
    /// Number of stderr lines kept for failure reports.
    pub stderr_tail_lines: usize,
    /// Socket IO timeout passed to ffmpeg.
    pub io_timeout: Duration,
    /// Extra arguments placed before `-i`.
    pub input_args: Vec<String>,
    /// Extra arguments placed before the segment muxer options.
    pub output_args: Vec<String>,
    /// Segment container extension.
    pub extension: String,
}

impl Default for FfmpegCaptureSettings {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            stop_grace: Duration::from_secs(5),
            stderr_tail_lines: DEFAULT_TAIL_LINES,
            io_timeout: Duration::from_secs(15),
            input_args: Vec::new(),
            output_args: Vec::new(),
            extension: "mp4".to_string(),
        }
    }
}

/// Capture strategy backed by ffmpeg's segment muxer.
pub struct FfmpegSegmentCapture {
    settings: FfmpegCaptureSettings,
    options: Arc<FfmpegOptions>,
    version: OnceCell<Option<String>>,
}

impl FfmpegSegmentCapture {
    pub fn new(settings: FfmpegCaptureSettings) -> Self {
        let options = Arc::new(FfmpegOptions::new(settings.binary_path.clone()));
        Self::with_options(settings, options)
    }

    /// Use existing option knowledge (shared cache, or pre-loaded in tests).
    pub fn with_options(settings: FfmpegCaptureSettings, options: Arc<FfmpegOptions>) -> Self {
        Self {
            settings,
            options,
            version: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &FfmpegCaptureSettings {
        &self.settings
    }

    /// Detected ffmpeg version line, if the binary runs.
    pub async fn version(&self) -> Option<String> {
        self.version
            .get_or_init(|| process_utils::query_version(&self.settings.binary_path, &["-version"]))
            .await
            .clone()
    }

    /// Build the ffmpeg argument list.
    ///
    /// `timeout_args` is the already-detected IO timeout option, if any.
    fn build_args(&self, config: &CaptureConfig, timeout_args: Vec<String>) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        args.extend(self.settings.input_args.iter().cloned());

        if is_rtsp(&config.source_uri) {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend(timeout_args);

        // Live sources often carry broken or missing timestamps.
        args.extend([
            "-fflags".into(),
            "+genpts".into(),
            "-use_wallclock_as_timestamps".into(),
            "1".into(),
            "-i".into(),
            config.source_uri.clone(),
        ]);

        // First video stream only, no re-encode.
        args.extend([
            "-map".into(),
            "0:v:0".into(),
            "-an".into(),
            "-c:v".into(),
            "copy".into(),
        ]);

        args.extend(self.settings.output_args.iter().cloned());

        args.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            config.chunk_duration.as_secs().max(1).to_string(),
            "-reset_timestamps".into(),
            "1".into(),
            "-strftime".into(),
            "1".into(),
        ]);

        let template = segment_output_template(&config.output_dir, &self.settings.extension);
        args.push(template.to_string_lossy().to_string());

        args
    }
}

fn is_rtsp(uri: &str) -> bool {
    uri.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("rtsp://"))
        || uri.get(..8).is_some_and(|scheme| scheme.eq_ignore_ascii_case("rtsps://"))
}

fn spawn_ffmpeg(binary_path: &str, args: &[String]) -> Result<Child> {
    process_utils::tokio_command(binary_path)
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CaptureToolMissing(binary_path.to_string())
            } else {
                Error::Other(format!("Failed to spawn ffmpeg: {}", e))
            }
        })
}

/// Drain ffmpeg's stderr into the ring buffer until EOF.
fn spawn_stderr_drainer(child: &mut Child, tail: Arc<StderrTail>) -> Option<JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "vigil::capture::ffmpeg", "ffmpeg: {}", line);
                    tail.push(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Error reading ffmpeg stderr: {}", e);
                    break;
                }
            }
        }
    }))
}

async fn join_drainer(drainer: Option<JoinHandle<()>>) {
    if let Some(drainer) = drainer {
        // stderr can outlive ffmpeg if it forked helpers; don't wait forever.
        let _ = tokio::time::timeout(Duration::from_secs(2), drainer).await;
    }
}

/// Everything the supervisor task needs, moved into it.
struct Supervisor {
    binary_path: String,
    args: Vec<String>,
    stop_grace: Duration,
    tail: Arc<StderrTail>,
    options: Arc<FfmpegOptions>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self, mut child: Child) -> Result<()> {
        loop {
            let drainer = spawn_stderr_drainer(&mut child, self.tail.clone());

            let exited = tokio::select! {
                _ = self.cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };

            let Some(status) = exited else {
                let outcome =
                    process_utils::stop_child(&mut child, Some(b"q"), self.stop_grace).await;
                join_drainer(drainer).await;
                info!(?outcome, "ffmpeg capture stopped");
                return Ok(());
            };

            join_drainer(drainer).await;

            if self.cancel.is_cancelled() {
                debug!("ffmpeg exited while a stop was in progress");
                return Ok(());
            }

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Error waiting for ffmpeg: {}", e);
                    None
                }
            };
            let diagnostics = self.tail.summary();

            // Each retry removes at least one flag, so this terminates.
            if let Some(stripped) = self.options.strip_unsupported(&self.args, &diagnostics) {
                self.args = stripped;
                self.tail.clear();
                child = spawn_ffmpeg(&self.binary_path, &self.args)?;
                continue;
            }

            warn!(
                exit_code = ?exit_code,
                stderr_tail = %diagnostics,
                "ffmpeg exited unexpectedly while recording"
            );
            return Err(Error::CaptureFailed {
                exit_code,
                stderr_tail: diagnostics,
            });
        }
    }
}

#[async_trait]
impl CaptureStrategy for FfmpegSegmentCapture {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Segment
    }

    async fn is_available(&self) -> bool {
        self.version().await.is_some()
    }

    fn needs_watcher(&self) -> bool {
        true
    }

    async fn start(
        &self,
        config: &CaptureConfig,
        _chunk_tx: mpsc::Sender<ChunkReady>,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle> {
        ensure_dir_all_with_op("creating recordings directory", &config.output_dir).await?;

        let timeout_us = u64::try_from(self.settings.io_timeout.as_micros()).unwrap_or(u64::MAX);
        let timeout_args = self.options.timeout_args(timeout_us).await;
        let args = self.build_args(config, timeout_args);

        info!(
            source = %config.source_uri,
            output_dir = %config.output_dir.display(),
            chunk_secs = config.chunk_duration.as_secs(),
            "Starting ffmpeg segment capture"
        );
        debug!("ffmpeg args: {:?}", args);

        let child = spawn_ffmpeg(&self.settings.binary_path, &args)?;

        let supervisor = Supervisor {
            binary_path: self.settings.binary_path.clone(),
            args,
            stop_grace: self.settings.stop_grace,
            tail: Arc::new(StderrTail::new(self.settings.stderr_tail_lines)),
            options: self.options.clone(),
            cancel,
        };

        Ok(CaptureHandle::new(tokio::spawn(supervisor.run(child))))
    }
}
