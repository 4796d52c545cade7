//! In-process fakes shared by the integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use vigil::alerts::AlertEngine;
use vigil::capture::{
    CaptureConfig, CaptureHandle, CaptureKind, CaptureStrategy, ChunkReady,
};
use vigil::database::repositories::SqlxAlertRepository;
use vigil::database::{self, DbPool};
use vigil::pipeline::PipelineServices;
use vigil::services::{IndexFields, ObjectStore, VectorIndex, VisionAnalyzer};
use vigil::{Error, Result};

pub async fn migrated_pool() -> (DbPool, TempDir) {
    let temp = TempDir::new().unwrap();
    let url = format!("sqlite:{}?mode=rwc", temp.path().join("vigil.db").display());
    let pool = database::init_pool_with_size(&url, 2).await.unwrap();
    database::run_migrations(&pool).await.unwrap();
    (pool, temp)
}

pub fn alert_engine(pool: DbPool) -> AlertEngine {
    AlertEngine::new(Arc::new(SqlxAlertRepository::new(pool)))
}

/// Object store that records uploads and may refuse them.
#[derive(Default)]
pub struct FakeStore {
    pub fail: bool,
    pub uploads: Mutex<Vec<PathBuf>>,
}

impl FakeStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn upload(&self, local_path: &Path) -> Result<String> {
        if self.fail {
            return Err(Error::Upload("bucket unavailable".into()));
        }
        self.uploads.lock().push(local_path.to_path_buf());
        let name = local_path.file_name().unwrap().to_string_lossy();
        Ok(format!("https://cdn.example.com/{name}"))
    }

    async fn delete(&self, _object_key: &str) -> Result<()> {
        Ok(())
    }
}

/// Analyzer that answers with a fixed text, optionally held behind a gate.
pub struct ScriptedAnalyzer {
    reply: Mutex<Box<dyn Fn(&str) -> String + Send>>,
    pub prompts: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAnalyzer {
    pub fn replying(reply: impl Fn(&str) -> String + Send + 'static) -> Self {
        Self {
            reply: Mutex::new(Box::new(reply)),
            prompts: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Blocks every call until permits are added to the returned semaphore.
    pub fn gated(reply: impl Fn(&str) -> String + Send + 'static) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut analyzer = Self::replying(reply);
        analyzer.gate = Some(gate.clone());
        (analyzer, gate)
    }
}

#[async_trait]
impl VisionAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _video_url: &str, prompt: &str, _sampling_fps: u32) -> Result<String> {
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| Error::Analysis(e.to_string()))?;
        }
        self.prompts.lock().push(prompt.to_string());
        let reply = (self.reply.lock())(prompt);
        Ok(reply)
    }
}

/// Index that keeps documents in memory.
#[derive(Default)]
pub struct MemoryIndex {
    pub docs: Mutex<Vec<(String, String, IndexFields)>>,
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn add(&self, content: &str, url: &str, extra: IndexFields) -> Result<()> {
        self.docs
            .lock()
            .push((content.to_string(), url.to_string(), extra));
        Ok(())
    }

    async fn clear(&self) -> Result<u64> {
        let mut docs = self.docs.lock();
        let n = docs.len() as u64;
        docs.clear();
        Ok(n)
    }
}

pub fn services(
    store: Arc<FakeStore>,
    analyzer: Arc<ScriptedAnalyzer>,
    index: Arc<MemoryIndex>,
    alerts: AlertEngine,
) -> PipelineServices {
    PipelineServices {
        object_store: store,
        analyzer,
        index,
        alerts,
    }
}

/// What a [`FakeCapture`] does once started.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report a chunk every `every` until cancelled.
    Emit { every: Duration },
    /// Exit with a fatal error after the delay.
    FailAfter(Duration),
    /// Ignore cancellation entirely.
    Hang,
    /// Write these files into the output directory, then wait for cancel.
    WriteFiles(Vec<String>),
}

/// Capture strategy driven by a [`Behavior`].
pub struct FakeCapture {
    kind: CaptureKind,
    behavior: Behavior,
}

impl FakeCapture {
    pub fn new(behavior: Behavior) -> Self {
        let kind = match behavior {
            Behavior::WriteFiles(_) => CaptureKind::Segment,
            _ => CaptureKind::Fallback,
        };
        Self { kind, behavior }
    }
}

#[async_trait]
impl CaptureStrategy for FakeCapture {
    fn kind(&self) -> CaptureKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn needs_watcher(&self) -> bool {
        self.kind == CaptureKind::Segment
    }

    async fn start(
        &self,
        config: &CaptureConfig,
        chunk_tx: mpsc::Sender<ChunkReady>,
        cancel: CancellationToken,
    ) -> Result<CaptureHandle> {
        let behavior = self.behavior.clone();
        let dir = config.output_dir.clone();

        let task = tokio::spawn(run_behavior(behavior, dir, chunk_tx, cancel));
        Ok(CaptureHandle::new(task))
    }
}

async fn run_behavior(
    behavior: Behavior,
    dir: PathBuf,
    chunk_tx: mpsc::Sender<ChunkReady>,
    cancel: CancellationToken,
) -> Result<()> {
    match behavior {
        Behavior::Emit { every } => {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            let mut n = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        n += 1;
                        let path = dir.join(format!("chunk_fake_{n:05}.y4m"));
                        let chunk = ChunkReady::new(path, CaptureKind::Fallback);
                        if chunk_tx.send(chunk).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Behavior::FailAfter(delay) => {
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                _ = tokio::time::sleep(delay) => Err(Error::CaptureFailed {
                    exit_code: Some(1),
                    stderr_tail: "Connection refused".into(),
                }),
            }
        }
        Behavior::Hang => {
            std::future::pending::<()>().await;
            Ok(())
        }
        Behavior::WriteFiles(names) => {
            for name in names {
                tokio::fs::write(dir.join(&name), b"segment data").await?;
            }
            cancel.cancelled().await;
            Ok(())
        }
    }
}
