//! RTSP sources, read in-process with `retina`.
//!
//! The RTSP session runs as a task on the async runtime and hands H.264
//! access units to the blocking frame loop over a bounded channel. Frames
//! stay compressed; they are muxed into MP4 by [`Mp4SinkFactory`].

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use retina::client::{
    Demuxed, PlayOptions, Session, SessionOptions, SetupOptions, TcpTransportOptions, Transport,
};
use retina::codec::{CodecItem, ParametersRef, VideoFrame};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use super::{Frame, FrameSource, Geometry, Mp4SinkFactory, SinkFactory, SourceOpener};
use crate::{Error, Result};

type FrameResult = std::result::Result<Frame, String>;

/// Opens `rtsp://` sources carrying H.264 video.
#[derive(Debug, Clone)]
pub struct RtspOpener {
    /// Limit for connecting and receiving the first video frame.
    pub connect_timeout: Duration,
    /// Longest silence tolerated once the stream is playing.
    pub read_timeout: Duration,
    /// Frames buffered between the session task and the frame loop.
    pub queue_frames: usize,
}

impl Default for RtspOpener {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
            queue_frames: 256,
        }
    }
}

impl SourceOpener for RtspOpener {
    fn can_open(&self, uri: &str) -> bool {
        Url::parse(uri).is_ok_and(|url| url.scheme().eq_ignore_ascii_case("rtsp"))
    }

    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let url = Url::parse(uri)
            .map_err(|e| Error::validation(format!("invalid RTSP URI {uri}: {e}")))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("RTSP capture needs a tokio runtime: {e}")))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (frame_tx, frame_rx) = mpsc::channel(self.queue_frames.max(1));
        let session = runtime.spawn(run_session(
            url,
            self.connect_timeout,
            self.read_timeout,
            ready_tx,
            frame_tx,
        ));

        let geometry = match ready_rx.blocking_recv() {
            Ok(Ok(geometry)) => geometry,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Other(
                    "RTSP session ended before the stream started".to_string(),
                ));
            }
        };

        Ok(Box::new(RtspSource {
            geometry,
            frames: frame_rx,
            session,
        }))
    }

    fn sinks(&self) -> Arc<dyn SinkFactory> {
        Arc::new(Mp4SinkFactory)
    }
}

/// A playing RTSP session.
struct RtspSource {
    geometry: Geometry,
    frames: mpsc::Receiver<FrameResult>,
    session: JoinHandle<()>,
}

impl FrameSource for RtspSource {
    fn geometry(&self) -> Option<Geometry> {
        Some(self.geometry.clone())
    }

    fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        match self.frames.blocking_recv() {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(message)) => Err(io::Error::other(message)),
            None => Ok(None),
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.session.abort();
    }
}

fn session_error(e: retina::Error) -> Error {
    Error::Other(format!("RTSP session failed: {e}"))
}

/// Source timestamp of `frame` since the start of the session.
fn pts_of(elapsed: i64, clock_rate: u32) -> Duration {
    let elapsed = u128::try_from(elapsed).unwrap_or(0);
    let nanos = elapsed * 1_000_000_000 / u128::from(clock_rate.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn to_frame(frame: VideoFrame) -> Frame {
    let timestamp = frame.timestamp();
    let pts = pts_of(timestamp.elapsed(), timestamp.clock_rate().get());
    let key = frame.is_random_access_point();
    Frame {
        data: frame.into_data(),
        pts,
        key,
    }
}

/// Frames per second from an H.264 frame duration given as
/// `(numerator, denominator)` seconds.
fn fps_from_frame_duration(duration: Option<(u32, u32)>) -> f64 {
    match duration {
        Some((num, den)) if num > 0 && den > 0 => f64::from(den) / f64::from(num),
        _ => 0.0,
    }
}

fn geometry_of(parameters: Option<ParametersRef<'_>>) -> Result<Geometry> {
    let Some(ParametersRef::Video(video)) = parameters else {
        return Err(Error::StreamGeometry(
            "RTSP source did not describe its video parameters".to_string(),
        ));
    };
    let (width, height) = video.pixel_dimensions();
    Ok(Geometry {
        width,
        height,
        fps: fps_from_frame_duration(video.frame_rate()),
        chroma: None,
        decoder_config: Some(video.extra_data().to_vec()),
    })
}

/// Connect, start playing, and wait for the first video frame.
async fn connect(url: Url) -> Result<(Pin<Box<Demuxed>>, usize, Geometry, Frame)> {
    let options = SessionOptions::default().user_agent(format!(
        "vigil/{}",
        env!("CARGO_PKG_VERSION")
    ));
    let mut session = Session::describe(url, options)
        .await
        .map_err(session_error)?;

    let stream = session
        .streams()
        .iter()
        .position(|s| s.media() == "video" && s.encoding_name().eq_ignore_ascii_case("h264"))
        .ok_or_else(|| {
            Error::StreamGeometry("RTSP source has no H.264 video stream".to_string())
        })?;

    session
        .setup(
            stream,
            SetupOptions::default().transport(Transport::Tcp(TcpTransportOptions::default())),
        )
        .await
        .map_err(session_error)?;
    let playing = session
        .play(PlayOptions::default())
        .await
        .map_err(session_error)?;
    let mut demuxed = Box::pin(playing.demuxed().map_err(session_error)?);

    // Parameters are only certain once the first frame has been depacketized.
    loop {
        let item = demuxed
            .next()
            .await
            .ok_or_else(|| {
                Error::StreamGeometry("RTSP stream ended before the first frame".to_string())
            })?
            .map_err(session_error)?;
        if let CodecItem::VideoFrame(frame) = item
            && frame.stream_id() == stream
        {
            let geometry = geometry_of(demuxed.streams()[stream].parameters())?;
            return Ok((demuxed, stream, geometry, to_frame(frame)));
        }
    }
}

async fn run_session(
    url: Url,
    connect_timeout: Duration,
    read_timeout: Duration,
    ready_tx: oneshot::Sender<Result<Geometry>>,
    frame_tx: mpsc::Sender<FrameResult>,
) {
    let (mut demuxed, stream, geometry, first) =
        match tokio::time::timeout(connect_timeout, connect(url.clone())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
            Err(_) => {
                let _ = ready_tx.send(Err(Error::StreamGeometry(format!(
                    "RTSP source sent no video within {}s",
                    connect_timeout.as_secs()
                ))));
                return;
            }
        };

    info!(
        source = %url,
        width = geometry.width,
        height = geometry.height,
        "RTSP stream playing"
    );
    if ready_tx.send(Ok(geometry)).is_err() || frame_tx.send(Ok(first)).await.is_err() {
        return;
    }

    loop {
        let next = match tokio::time::timeout(read_timeout, demuxed.next()).await {
            Err(_) => Err(format!("no RTSP data for {}s", read_timeout.as_secs())),
            Ok(None) => {
                debug!(source = %url, "RTSP stream ended");
                return;
            }
            Ok(Some(Err(e))) => Err(e.to_string()),
            Ok(Some(Ok(CodecItem::VideoFrame(frame)))) if frame.stream_id() == stream => {
                Ok(to_frame(frame))
            }
            Ok(Some(Ok(_))) => continue,
        };

        let failed = next.is_err();
        if frame_tx.send(next).await.is_err() || failed {
            return;
        }
    }
}
