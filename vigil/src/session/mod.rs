//! Recording session: one start/stop-able unit of capture plus watcher.
//!
//! At most one session runs per [`RecordingSession`]. All mutable session
//! fields live behind a single lock that is never held across an await.
//! Finished chunks are forwarded to the pipeline's channel; the forwarder
//! is the single place that sees every chunk of a session.

pub mod events;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::{
    CaptureConfig, CaptureHandle, CaptureKind, CaptureStrategies, ChunkReady, SegmentFinalizer,
    log_source_uri_warnings,
};
use crate::utils::fs::ensure_dir_all_with_op;
use crate::watcher::{SegmentWatcher, StabilityTracker, WatcherConfig};
use crate::{Error, Result};

pub use events::{SessionEvent, SessionEventBroadcaster};
pub use state::SessionState;

/// Capacity of the capture-to-forwarder channel.
const INTERNAL_CHANNEL_CAPACITY: usize = 16;

/// Session defaults and tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Recordings directory used when a start request names none.
    pub output_dir: PathBuf,
    /// Chunk duration used when a start request names none.
    pub chunk_duration: Duration,
    pub watcher: WatcherConfig,
    /// Upper bound on how long `stop()` waits for capture to wind down.
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            chunk_duration: Duration::from_secs(600),
            watcher: WatcherConfig::default(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Parameters of a `start()` call.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source_uri: String,
    pub output_dir: Option<PathBuf>,
    pub chunk_duration: Option<Duration>,
}

impl StartRequest {
    pub fn new(source_uri: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            output_dir: None,
            chunk_duration: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_chunk_duration(mut self, duration: Duration) -> Self {
        self.chunk_duration = Some(duration);
        self
    }
}

/// How the previous session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    StoppedByRequest,
    StoppedUnexpectedly { reason: String },
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub source_uri: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub chunk_duration_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub capture_kind: Option<CaptureKind>,
    /// Chunks handed to the pipeline by the current (or last) session.
    pub chunks_dispatched: u64,
    pub last_outcome: Option<SessionOutcome>,
}

struct ActiveSession {
    source_uri: String,
    output_dir: PathBuf,
    chunk_duration: Duration,
    started_at: DateTime<Utc>,
    kind: CaptureKind,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    active: Option<ActiveSession>,
    last_outcome: Option<SessionOutcome>,
    generation: u64,
}

impl Inner {
    fn transition(&mut self, target: SessionState) -> Result<()> {
        self.state = self.state.transition_to(target)?;
        Ok(())
    }
}

/// What `launch` hands back to `start`.
struct Launched {
    active: ActiveSession,
    armed: oneshot::Sender<()>,
}

/// The recording state machine.
pub struct RecordingSession {
    inner: Arc<Mutex<Inner>>,
    strategies: CaptureStrategies,
    finalizer: Arc<dyn SegmentFinalizer>,
    chunk_sink: mpsc::Sender<ChunkReady>,
    events: SessionEventBroadcaster,
    chunks_dispatched: Arc<AtomicU64>,
    config: SessionConfig,
}

impl RecordingSession {
    /// `chunk_sink` receives every finished chunk (normally the pipeline's
    /// dispatch channel).
    pub fn new(
        strategies: CaptureStrategies,
        finalizer: Arc<dyn SegmentFinalizer>,
        chunk_sink: mpsc::Sender<ChunkReady>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            strategies,
            finalizer,
            chunk_sink,
            events: SessionEventBroadcaster::new(),
            chunks_dispatched: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        let active = inner.active.as_ref();
        SessionStatus {
            state: inner.state,
            source_uri: active.map(|a| a.source_uri.clone()),
            output_dir: active.map(|a| a.output_dir.clone()),
            chunk_duration_secs: active.map(|a| a.chunk_duration.as_secs()),
            started_at: active.map(|a| a.started_at),
            capture_kind: active.map(|a| a.kind),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            last_outcome: inner.last_outcome.clone(),
        }
    }

    /// Start recording. Only valid while idle.
    pub async fn start(&self, request: StartRequest) -> Result<SessionStatus> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(Error::AlreadyRecording);
            }
            inner.transition(SessionState::Starting)?;
            inner.generation += 1;
            inner.generation
        };

        match self.launch(request, generation).await {
            Ok(Launched { active, armed }) => {
                let event = SessionEvent::Started {
                    source_uri: active.source_uri.clone(),
                    kind: active.kind,
                };
                {
                    let mut inner = self.inner.lock();
                    inner.transition(SessionState::Active)?;
                    inner.active = Some(active);
                }
                // The supervisor only acts on the state once it is Active.
                let _ = armed.send(());
                self.events.publish(event);
                Ok(self.status())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.state = SessionState::Idle;
                inner.active = None;
                Err(e)
            }
        }
    }

    async fn launch(&self, request: StartRequest, generation: u64) -> Result<Launched> {
        let output_dir = request
            .output_dir
            .unwrap_or_else(|| self.config.output_dir.clone());
        let chunk_duration = request.chunk_duration.unwrap_or(self.config.chunk_duration);
        if chunk_duration.is_zero() {
            return Err(Error::validation("chunk duration must be greater than zero"));
        }
        if request.source_uri.trim().is_empty() {
            return Err(Error::validation("source URI must not be empty"));
        }

        log_source_uri_warnings(&request.source_uri);
        ensure_dir_all_with_op("creating recordings directory", &output_dir).await?;

        let strategy = self.strategies.select().await?;
        let capture_config = CaptureConfig::new(&request.source_uri, &output_dir, chunk_duration);
        let cancel = CancellationToken::new();
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);

        let watcher = if strategy.needs_watcher() {
            let mut watcher = SegmentWatcher::new(
                &output_dir,
                self.config.watcher.clone(),
                self.finalizer.clone(),
            );
            watcher.seed_existing().await?;
            Some(watcher)
        } else {
            None
        };

        let handle = strategy
            .start(&capture_config, internal_tx.clone(), cancel.clone())
            .await?;
        let watcher_task = watcher.map(|w| w.spawn(internal_tx, cancel.clone()));

        self.chunks_dispatched.store(0, Ordering::Relaxed);
        let forwarder = tokio::spawn(forward_chunks(
            internal_rx,
            self.chunk_sink.clone(),
            self.events.clone(),
            self.chunks_dispatched.clone(),
        ));

        let (armed_tx, armed_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            SupervisorContext {
                inner: self.inner.clone(),
                events: self.events.clone(),
                generation,
                cancel: cancel.clone(),
            },
            handle,
            watcher_task,
            forwarder,
            armed_rx,
        ));

        info!(
            session = generation,
            source = %request.source_uri,
            output_dir = %output_dir.display(),
            chunk_secs = chunk_duration.as_secs(),
            capture = %strategy.kind(),
            "Recording started"
        );

        Ok(Launched {
            active: ActiveSession {
                source_uri: request.source_uri,
                output_dir,
                chunk_duration,
                started_at: Utc::now(),
                kind: strategy.kind(),
                cancel,
                supervisor: Some(supervisor),
            },
            armed: armed_tx,
        })
    }

    /// Stop recording. Only valid while active.
    ///
    /// Returns within the configured stop timeout even if capture hangs.
    /// Chunks already handed to the pipeline are not affected.
    pub async fn stop(&self) -> Result<SessionStatus> {
        let (cancel, supervisor) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return Err(Error::NotRecording);
            }
            inner.transition(SessionState::Stopping)?;
            match inner.active.as_mut() {
                Some(active) => (active.cancel.clone(), active.supervisor.take()),
                None => (CancellationToken::new(), None),
            }
        };

        info!("Stopping recording");
        cancel.cancel();

        if let Some(mut supervisor) = supervisor
            && tokio::time::timeout(self.config.stop_timeout, &mut supervisor)
                .await
                .is_err()
        {
            warn!(
                timeout_secs = self.config.stop_timeout.as_secs(),
                "Capture did not wind down in time, abandoning it"
            );
            supervisor.abort();
        }

        {
            let mut inner = self.inner.lock();
            inner.transition(SessionState::Idle)?;
            inner.active = None;
            inner.last_outcome = Some(SessionOutcome::StoppedByRequest);
        }
        self.events.publish(SessionEvent::Stopped);
        info!(chunks = self.chunks_dispatched.load(Ordering::Relaxed), "Recording stopped");
        Ok(self.status())
    }
}

/// Hand chunks to the pipeline and announce them.
async fn forward_chunks(
    mut rx: mpsc::Receiver<ChunkReady>,
    sink: mpsc::Sender<ChunkReady>,
    events: SessionEventBroadcaster,
    dispatched: Arc<AtomicU64>,
) {
    while let Some(chunk) = rx.recv().await {
        let path = chunk.path.clone();
        if sink.send(chunk).await.is_err() {
            error!(chunk = %path.display(), "Pipeline is not accepting chunks, dropping");
            continue;
        }
        dispatched.fetch_add(1, Ordering::Relaxed);
        events.publish(SessionEvent::ChunkReady { path });
    }
}

struct SupervisorContext {
    inner: Arc<Mutex<Inner>>,
    events: SessionEventBroadcaster,
    generation: u64,
    cancel: CancellationToken,
}

/// Wait for capture to end and turn an unrequested end into `Failed -> Idle`.
async fn supervise(
    ctx: SupervisorContext,
    capture: CaptureHandle,
    watcher: Option<JoinHandle<StabilityTracker>>,
    forwarder: JoinHandle<()>,
    armed: oneshot::Receiver<()>,
) {
    let result = capture.wait().await;

    // Capture is gone either way; take the watcher down with it.
    ctx.cancel.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    let _ = forwarder.await;

    if armed.await.is_err() {
        return;
    }

    let reason = match result {
        Ok(()) => "capture ended without a stop request".to_string(),
        Err(e) => e.to_string(),
    };

    let failed = {
        let mut inner = ctx.inner.lock();
        if inner.generation != ctx.generation || inner.state != SessionState::Active {
            false
        } else {
            inner.state = SessionState::Failed;
            inner.active = None;
            inner.last_outcome = Some(SessionOutcome::StoppedUnexpectedly {
                reason: reason.clone(),
            });
            inner.state = SessionState::Idle;
            true
        }
    };

    if failed {
        error!(session = ctx.generation, reason = %reason, "Recording stopped unexpectedly");
        ctx.events.publish(SessionEvent::Failed { reason });
    }
}
