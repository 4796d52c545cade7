//! Capture strategies: turning a live source into chunk files.
//!
//! Two implementations share the [`CaptureStrategy`] interface:
//! - [`FfmpegSegmentCapture`]: stream-copy through ffmpeg's segment muxer,
//!   chunks discovered by the segment watcher.
//! - [`CaptureFallback`]: in-process RTSP/Y4M reading, chunks reported
//!   directly. Only used when ffmpeg cannot be found.
//!
//! The strategy is chosen once per session by [`CaptureStrategies::select`].

pub mod diagnostics;
pub mod fallback;
pub mod ffmpeg;
pub mod finalize;
pub mod options;
pub mod traits;

use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

pub use fallback::{CaptureFallback, FallbackSettings, RtspOpener, Y4mOpener};
pub use ffmpeg::{FfmpegCaptureSettings, FfmpegSegmentCapture};
pub use finalize::{FaststartFinalizer, NoopFinalizer, SegmentFinalizer};
pub use traits::{CaptureConfig, CaptureHandle, CaptureKind, CaptureStrategy, ChunkReady};

use crate::{Error, Result};

/// Ports RTMP servers usually listen on.
const RTMP_PORTS: &[u16] = &[1935, 1945];

/// Primary strategy plus an optional fallback.
#[derive(Clone)]
pub struct CaptureStrategies {
    primary: Arc<dyn CaptureStrategy>,
    fallback: Option<Arc<dyn CaptureStrategy>>,
}

impl CaptureStrategies {
    pub fn new(
        primary: Arc<dyn CaptureStrategy>,
        fallback: Option<Arc<dyn CaptureStrategy>>,
    ) -> Self {
        Self { primary, fallback }
    }

    /// Pick the strategy for a new session.
    pub async fn select(&self) -> Result<Arc<dyn CaptureStrategy>> {
        if self.primary.is_available().await {
            return Ok(self.primary.clone());
        }

        match &self.fallback {
            Some(fallback) if fallback.is_available().await => {
                warn!(
                    primary = %self.primary.kind(),
                    fallback = %fallback.kind(),
                    "Primary capture tool unavailable, using fallback capture"
                );
                Ok(fallback.clone())
            }
            _ => Err(Error::CaptureToolMissing(format!(
                "{} capture is unavailable and no fallback is configured",
                self.primary.kind()
            ))),
        }
    }
}

/// Non-fatal problems with a source URI, as human-readable warnings.
///
/// Common misconfigurations (an RTSP URI pointed at an RTMP port, or one
/// without a stream path) are reported but never rejected.
pub fn source_uri_warnings(uri: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    let Ok(url) = Url::parse(uri) else {
        return warnings;
    };
    if !url.scheme().eq_ignore_ascii_case("rtsp") {
        return warnings;
    }

    if let Some(port) = url.port()
        && RTMP_PORTS.contains(&port)
    {
        warnings.push(format!(
            "RTSP URI uses port {port}, which is typically an RTMP port; RTSP usually listens on 554 or 8554"
        ));
    }

    let path = url.path().trim_matches('/');
    if path.is_empty() {
        warnings.push("RTSP URI has no stream path (e.g. rtsp://host:8554/live)".to_string());
    }

    warnings
}

/// Log [`source_uri_warnings`] for `uri`.
pub fn log_source_uri_warnings(uri: &str) {
    let warnings = source_uri_warnings(uri);
    if warnings.is_empty() {
        info!(source = %uri, "Source URI looks valid");
    }
    for warning in warnings {
        warn!(source = %uri, "{}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixed {
        kind: CaptureKind,
        available: bool,
    }

    #[async_trait]
    impl CaptureStrategy for Fixed {
        fn kind(&self) -> CaptureKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        fn needs_watcher(&self) -> bool {
            self.kind == CaptureKind::Segment
        }

        async fn start(
            &self,
            _config: &CaptureConfig,
            _chunk_tx: mpsc::Sender<ChunkReady>,
            _cancel: CancellationToken,
        ) -> Result<CaptureHandle> {
            Ok(CaptureHandle::new(tokio::spawn(async { Ok(()) })))
        }
    }

    fn fixed(kind: CaptureKind, available: bool) -> Arc<dyn CaptureStrategy> {
        Arc::new(Fixed { kind, available })
    }

    #[tokio::test]
    async fn test_select_prefers_primary() {
        let strategies = CaptureStrategies::new(
            fixed(CaptureKind::Segment, true),
            Some(fixed(CaptureKind::Fallback, true)),
        );
        assert_eq!(strategies.select().await.unwrap().kind(), CaptureKind::Segment);
    }

    #[tokio::test]
    async fn test_select_falls_back() {
        let strategies = CaptureStrategies::new(
            fixed(CaptureKind::Segment, false),
            Some(fixed(CaptureKind::Fallback, true)),
        );
        assert_eq!(strategies.select().await.unwrap().kind(), CaptureKind::Fallback);
    }

    #[tokio::test]
    async fn test_select_without_any_tool() {
        let strategies = CaptureStrategies::new(fixed(CaptureKind::Segment, false), None);
        let err = strategies.select().await.err().unwrap();
        assert!(matches!(err, Error::CaptureToolMissing(_)));
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn test_source_uri_warnings() {
        assert!(source_uri_warnings("rtsp://cam.local:8554/live").is_empty());
        assert!(source_uri_warnings("http://cam.local:1935/").is_empty());

        let warnings = source_uri_warnings("rtsp://cam.local:1935/");
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("1935"));

        assert_eq!(source_uri_warnings("rtsp://cam.local").len(), 1);
    }
}
