//! Frame-by-frame capture used when ffmpeg is not installed.
//!
//! The source is read in-process through a [`SourceOpener`] and its frames
//! are written to chunk files by the [`SinkFactory`] that belongs to that
//! opener. RTSP sources deliver H.264 access units that are muxed straight
//! into MP4; Y4M sources deliver raw frames. Reading runs on a blocking
//! thread and each closed chunk is reported as soon as it is on disk.

pub mod mp4_sink;
pub mod rtsp;
pub mod y4m;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{CaptureConfig, CaptureHandle, CaptureKind, CaptureStrategy, ChunkReady};
use crate::recordings::next_chunk_path;
use crate::utils::fs::{ensure_dir_all_with_op, io_error};
use crate::{Error, Result};

pub use mp4_sink::Mp4SinkFactory;
pub use rtsp::RtspOpener;
pub use y4m::{Y4mOpener, Y4mSinkFactory};

/// Frame rate assumed when the source reports none.
pub const DEFAULT_FPS: f64 = 30.0;

/// Largest accepted frame width or height.
pub const MAX_DIMENSION: u32 = 16_384;

/// Highest frame rate taken at face value.
const MAX_FPS: f64 = 1_000.0;

/// Basic properties of a video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Chroma layout tag as reported by the source, if any.
    pub chroma: Option<String>,
    /// Codec configuration record (`avcC`) for compressed sources.
    pub decoder_config: Option<Vec<u8>>,
}

/// One frame as delivered by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Presentation time since the source was opened.
    pub pts: Duration,
    /// Whether decoding can start at this frame.
    pub key: bool,
}

impl Frame {
    /// An uncompressed frame; every raw frame is a key frame.
    pub fn raw(data: Vec<u8>, pts: Duration) -> Self {
        Self {
            data,
            pts,
            key: true,
        }
    }
}

/// A live or recorded video stream.
pub trait FrameSource: Send {
    fn geometry(&self) -> Option<Geometry>;

    /// Read the next frame. `Ok(None)` means the stream ended.
    fn read_frame(&mut self) -> std::io::Result<Option<Frame>>;
}

/// Opens [`FrameSource`]s for URIs it understands.
pub trait SourceOpener: Send + Sync {
    fn can_open(&self, uri: &str) -> bool;

    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;

    /// Writer for the frames this opener's sources produce.
    fn sinks(&self) -> Arc<dyn SinkFactory>;
}

/// Destination for the frames of one chunk.
pub trait FrameSink: Send {
    /// Append `frame`, presented `at` after the start of the chunk.
    fn write_frame(&mut self, frame: &Frame, at: Duration) -> std::io::Result<()>;

    /// Flush and close the chunk file.
    fn finish(self: Box<Self>) -> std::io::Result<()>;
}

/// Creates a [`FrameSink`] per chunk file.
pub trait SinkFactory: Send + Sync {
    /// Extension of the files this factory writes.
    fn extension(&self) -> &str;

    fn create(
        &self,
        path: &std::path::Path,
        geometry: &Geometry,
    ) -> std::io::Result<Box<dyn FrameSink>>;
}

/// Tunables of the fallback path.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Consecutive read failures tolerated before the session is aborted.
    pub max_read_failures: u32,
    /// Pause before reopening the source after a read failure.
    pub reconnect_delay: Duration,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_read_failures: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Capture strategy that reads and writes frames itself.
pub struct CaptureFallback {
    openers: Vec<Arc<dyn SourceOpener>>,
    settings: FallbackSettings,
}

impl CaptureFallback {
    pub fn new(openers: Vec<Arc<dyn SourceOpener>>, settings: FallbackSettings) -> Self {
        Self { openers, settings }
    }

    /// RTSP (H.264 to MP4) and Y4M sources.
    pub fn standard(settings: FallbackSettings) -> Self {
        let openers: Vec<Arc<dyn SourceOpener>> = vec![
            Arc::new(RtspOpener::default()),
            Arc::new(Y4mOpener::default()),
        ];
        Self::new(openers, settings)
    }

    fn opener_for(&self, uri: &str) -> Option<Arc<dyn SourceOpener>> {
        self.openers.iter().find(|o| o.can_open(uri)).cloned()
    }
}

/// Validate source geometry, filling in a default frame rate.
fn usable_geometry(geometry: Option<Geometry>) -> Result<Geometry> {
    let mut geometry = geometry
        .ok_or_else(|| Error::StreamGeometry("source did not report its geometry".to_string()))?;

    let (width, height) = (geometry.width, geometry.height);
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(Error::StreamGeometry(format!(
            "unsupported frame size {width}x{height} (limit {MAX_DIMENSION} per side)"
        )));
    }
    if !geometry.fps.is_finite() || geometry.fps <= 0.0 || geometry.fps > MAX_FPS {
        warn!("Source reported no usable frame rate, assuming {}", DEFAULT_FPS);
        geometry.fps = DEFAULT_FPS;
    }
    Ok(geometry)
}

/// Maps source timestamps onto one timeline that keeps running across
/// reconnects, where every new connection starts its clock again.
#[derive(Debug)]
struct MediaClock {
    /// Source timestamp of the first frame since the last (re)connect.
    origin: Option<Duration>,
    /// Timeline position of `origin`.
    base: Duration,
    last: Option<Duration>,
    /// Gap inserted at a reconnect.
    step: Duration,
}

impl MediaClock {
    fn new(fps: f64) -> Self {
        Self {
            origin: None,
            base: Duration::ZERO,
            last: None,
            step: Duration::from_secs_f64(1.0 / fps),
        }
    }

    fn resync(&mut self) {
        self.origin = None;
    }

    fn place(&mut self, pts: Duration) -> Duration {
        let origin = match self.origin {
            Some(origin) => origin,
            None => {
                self.base = self.last.map(|last| last + self.step).unwrap_or_default();
                self.origin = Some(pts);
                pts
            }
        };

        let mut at = self.base + pts.saturating_sub(origin);
        if let Some(last) = self.last {
            at = at.max(last);
        }
        self.last = Some(at);
        at
    }
}

/// State owned by the blocking frame loop.
struct FrameLoop {
    uri: String,
    output_dir: PathBuf,
    geometry: Geometry,
    chunk_duration: Duration,
    opener: Arc<dyn SourceOpener>,
    sinks: Arc<dyn SinkFactory>,
    settings: FallbackSettings,
    cancel: CancellationToken,
    chunk_tx: mpsc::Sender<ChunkReady>,
}

/// The chunk currently being written.
struct OpenChunk {
    path: PathBuf,
    sink: Box<dyn FrameSink>,
    /// Timeline position of the first frame.
    started: Duration,
    frames: u64,
}

impl FrameLoop {
    fn run(self, source: Box<dyn FrameSource>) -> Result<()> {
        let mut source = Some(source);
        let mut chunk: Option<OpenChunk> = None;
        let mut clock = MediaClock::new(self.geometry.fps);
        let mut failures = 0u32;
        let mut last_error = String::new();

        loop {
            if self.cancel.is_cancelled() {
                self.discard_partial(chunk.take());
                return Ok(());
            }

            let Some(active) = source.as_mut() else {
                if !self.pause() {
                    continue;
                }
                match self.opener.open(&self.uri) {
                    Ok(reopened) => {
                        if reopened.geometry().is_some_and(|g| {
                            g.width != self.geometry.width || g.height != self.geometry.height
                        }) {
                            warn!("Source geometry changed after reconnect, keeping the original");
                        }
                        info!(source = %self.uri, "Reconnected to source");
                        clock.resync();
                        source = Some(reopened);
                    }
                    Err(e) => {
                        failures += 1;
                        last_error = e.to_string();
                        warn!(attempt = failures, error = %e, "Failed to reopen source");
                        if failures > self.settings.max_read_failures {
                            self.discard_partial(chunk.take());
                            return Err(Error::SourceExhausted {
                                attempts: failures,
                                last_error,
                            });
                        }
                    }
                }
                continue;
            };

            let read_error = match active.read_frame() {
                Ok(Some(frame)) => {
                    failures = 0;
                    let at = clock.place(frame.pts);
                    self.write(&mut chunk, &frame, at)?;
                    continue;
                }
                Ok(None) => "source stream ended".to_string(),
                Err(e) => e.to_string(),
            };

            failures += 1;
            warn!(attempt = failures, error = %read_error, "Frame read failed");
            last_error = read_error;
            source = None;

            if failures > self.settings.max_read_failures {
                self.discard_partial(chunk.take());
                return Err(Error::SourceExhausted {
                    attempts: failures,
                    last_error,
                });
            }
        }
    }

    /// Write one frame. A chunk is closed at the first key frame once it
    /// covers `chunk_duration`, so every chunk starts decodable.
    fn write(&self, chunk: &mut Option<OpenChunk>, frame: &Frame, at: Duration) -> Result<()> {
        let full = chunk
            .as_ref()
            .is_some_and(|open| at.saturating_sub(open.started) >= self.chunk_duration);
        if frame.key
            && full
            && let Some(done) = chunk.take()
        {
            self.close(done)?;
        }

        if chunk.is_none() {
            if !frame.key {
                return Ok(());
            }
            let path = next_chunk_path(&self.output_dir, self.sinks.extension());
            let sink = self
                .sinks
                .create(&path, &self.geometry)
                .map_err(|e| io_error("creating chunk file", &path, e))?;
            debug!(path = %path.display(), "Opened chunk");
            *chunk = Some(OpenChunk {
                path,
                sink,
                started: at,
                frames: 0,
            });
        }

        let Some(open) = chunk.as_mut() else {
            return Ok(());
        };
        open.sink
            .write_frame(frame, at.saturating_sub(open.started))
            .map_err(|e| io_error("writing frame to", &open.path, e))?;
        open.frames += 1;
        Ok(())
    }

    fn close(&self, done: OpenChunk) -> Result<()> {
        let path = done.path;
        done.sink
            .finish()
            .map_err(|e| io_error("closing chunk file", &path, e))?;

        info!(chunk = %path.display(), frames = done.frames, "Chunk closed");
        if self
            .chunk_tx
            .blocking_send(ChunkReady::new(path, CaptureKind::Fallback))
            .is_err()
        {
            debug!("Chunk receiver dropped");
        }
        Ok(())
    }

    /// Close an incomplete chunk without reporting it.
    fn discard_partial(&self, chunk: Option<OpenChunk>) {
        if let Some(partial) = chunk {
            debug!(
                path = %partial.path.display(),
                frames = partial.frames,
                "Closing partial chunk"
            );
            if let Err(e) = partial.sink.finish() {
                warn!(path = %partial.path.display(), error = %e, "Failed to close partial chunk");
            }
        }
    }

    /// Sleep for the reconnect delay. Returns `false` if cancelled meanwhile.
    fn pause(&self) -> bool {
        let step = Duration::from_millis(50);
        let mut remaining = self.settings.reconnect_delay;
        while !remaining.is_zero() {
            if self.cancel.is_cancelled() {
                return false;
            }
            let nap = remaining.min(step);
            std::thread::sleep(nap);
            remaining -= nap;
        }
        !self.cancel.is_cancelled()
    }
}

#[async_trait]
impl CaptureStrategy for CaptureFallback {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Fallback
    }

    async fn is_available(&self) -> bool {
        !self.openers.is_empty()
    }

    fn needs_watcher(&self) -> bool {
        false
    }

    async fn start(
        &self,
        config: &CaptureConfig,
        chunk_tx: mpsc::Sender<ChunkReady>,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle> {
        let opener = self.opener_for(&config.source_uri).ok_or_else(|| {
            Error::StreamGeometry(format!("no decoder for source {}", config.source_uri))
        })?;
        ensure_dir_all_with_op("creating recordings directory", &config.output_dir).await?;

        let open_with = opener.clone();
        let uri = config.source_uri.clone();
        let source = tokio::task::spawn_blocking(move || open_with.open(&uri))
            .await
            .map_err(|e| Error::Other(format!("Source open task failed: {}", e)))?
            .map_err(|e| match e {
                Error::StreamGeometry(_) => e,
                other => Error::StreamGeometry(format!("cannot open source: {}", other)),
            })?;

        let geometry = usable_geometry(source.geometry())?;
        let sinks = opener.sinks();
        info!(
            source = %config.source_uri,
            width = geometry.width,
            height = geometry.height,
            fps = geometry.fps,
            container = sinks.extension(),
            "Starting fallback capture"
        );

        let frame_loop = FrameLoop {
            uri: config.source_uri.clone(),
            output_dir: config.output_dir.clone(),
            geometry,
            chunk_duration: config.chunk_duration,
            opener,
            sinks,
            settings: self.settings.clone(),
            cancel,
            chunk_tx,
        };

        let task = tokio::spawn(async move {
            tokio::task::spawn_blocking(move || frame_loop.run(source))
                .await
                .map_err(|e| Error::Other(format!("Frame loop panicked: {}", e)))
                .and_then(|r| r)
        });

        Ok(CaptureHandle::new(task))
    }
}
