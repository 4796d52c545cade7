//! Per-chunk pipeline runner.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::alerts::{build_prompt, parse_alert_responses, snippet};
use super::stats::{PipelineStats, PipelineStatsSnapshot, Stage};
use crate::alerts::AlertEngine;
use crate::capture::ChunkReady;
use crate::database::models::AlertRuleDbModel;
use crate::services::{IndexFields, ObjectStore, VectorIndex, VisionAnalyzer};
use crate::{Error, Result};

/// Instruction sent with every chunk unless the configuration replaces it.
pub const DEFAULT_PREPROMPT: &str = concat!(
    "This video comes from a fixed camera. ",
    "Describe every person who appears and narrate their actions in detail. ",
    "Note each person's clothing and appearance. ",
    "Format your answer as structured JSON."
);

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fixed instruction sent with every chunk.
    pub preprompt: String,
    /// Frames per second the analyzer samples.
    pub sampling_fps: u32,
    /// Upper bound for any single stage.
    pub stage_timeout: Duration,
    /// Length of the analysis excerpt stored with a trigger.
    pub snippet_chars: usize,
    /// Trailing lines of the analysis searched for alert verdicts.
    pub alert_scan_lines: usize,
    /// Capacity of the session-to-pipeline channel.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preprompt: DEFAULT_PREPROMPT.to_string(),
            sampling_fps: 2,
            stage_timeout: Duration::from_secs(300),
            snippet_chars: 200,
            alert_scan_lines: 10,
            channel_capacity: 64,
        }
    }
}

/// Collaborators the stages call into.
#[derive(Clone)]
pub struct PipelineServices {
    pub object_store: Arc<dyn ObjectStore>,
    pub analyzer: Arc<dyn VisionAnalyzer>,
    pub index: Arc<dyn VectorIndex>,
    pub alerts: AlertEngine,
}

/// One chunk's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    pub local_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ChunkTask {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            created_at: Utc::now(),
        }
    }

    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl From<ChunkReady> for ChunkTask {
    fn from(chunk: ChunkReady) -> Self {
        Self {
            local_path: chunk.path,
            created_at: chunk.created_at,
        }
    }
}

struct Uploaded {
    task: ChunkTask,
    video_url: String,
}

struct Analyzed {
    uploaded: Uploaded,
    content: String,
    rules: Vec<AlertRuleDbModel>,
}

/// Result of a chunk that went through every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub local_path: PathBuf,
    pub video_url: String,
    /// Ids of the alert rules that fired.
    pub triggered: Vec<String>,
}

struct PipelineInner {
    config: PipelineConfig,
    services: PipelineServices,
    stats: PipelineStats,
    tracker: TaskTracker,
}

/// Runs Upload -> Analyze -> AlertRecord -> Index for each submitted chunk.
#[derive(Clone)]
pub struct ChunkPipeline {
    inner: Arc<PipelineInner>,
}

impl ChunkPipeline {
    pub fn new(config: PipelineConfig, services: PipelineServices) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                config,
                services,
                stats: PipelineStats::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Queue a chunk and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, task: impl Into<ChunkTask>) {
        let task = task.into();
        self.inner.stats.record_submitted();
        debug!(chunk = %task.local_path.display(), "Chunk submitted");

        let pipeline = self.clone();
        self.inner.tracker.spawn(async move {
            // Failures are logged and counted inside.
            let _ = pipeline.process(task).await;
        });
    }

    /// Submit every chunk received on `rx` until all senders are gone.
    pub fn spawn_dispatcher(&self, mut rx: mpsc::Receiver<ChunkReady>) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                pipeline.submit(chunk);
            }
            debug!("Chunk dispatcher finished");
        })
    }

    /// Wait until no chunk is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let tracker = &self.inner.tracker;
        tracker.close();
        let idle = tokio::time::timeout(timeout, tracker.wait()).await.is_ok();
        tracker.reopen();
        idle
    }

    /// Run every stage for `task` in order.
    ///
    /// A failing stage ends the run; the failure is logged and counted.
    pub async fn process(&self, task: ChunkTask) -> Result<ChunkOutcome> {
        let chunk = task.local_path.clone();
        let started = Instant::now();

        match self.run_stages(task).await {
            Ok(outcome) => {
                self.inner.stats.record_completed();
                info!(
                    chunk = %chunk.display(),
                    alerts = outcome.triggered.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Chunk processed"
                );
                Ok(outcome)
            }
            Err((stage, e)) => {
                self.inner.stats.record_failure(stage);
                error!(chunk = %chunk.display(), %stage, error = %e, "Chunk processing failed");
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        task: ChunkTask,
    ) -> std::result::Result<ChunkOutcome, (Stage, Error)> {
        let uploaded = self.stage(Stage::Upload, self.upload(task)).await?;
        let analyzed = self.stage(Stage::Analyze, self.analyze(uploaded)).await?;
        let (analyzed, triggered) = self
            .stage(Stage::AlertRecord, self.record_alerts(analyzed))
            .await?;
        let outcome = self.stage(Stage::Index, self.index(analyzed, triggered)).await?;
        Ok(outcome)
    }

    async fn stage<T>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, (Stage, Error)> {
        let timeout = self.inner.config.stage_timeout;
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StageTimeout {
                stage: stage.as_str(),
                secs: timeout.as_secs(),
            }),
        };
        match result {
            Ok(value) => {
                self.inner.stats.record_stage_done(stage);
                Ok(value)
            }
            Err(e) => Err((stage, e)),
        }
    }

    async fn upload(&self, task: ChunkTask) -> Result<Uploaded> {
        let video_url = self
            .inner
            .services
            .object_store
            .upload(&task.local_path)
            .await?;
        Ok(Uploaded { task, video_url })
    }

    async fn analyze(&self, uploaded: Uploaded) -> Result<Analyzed> {
        let config = &self.inner.config;
        let rules = self.inner.services.alerts.list_enabled_rules().await?;
        let prompt = build_prompt(&config.preprompt, &rules);

        let content = self
            .inner
            .services
            .analyzer
            .analyze(&uploaded.video_url, &prompt, config.sampling_fps)
            .await?;
        debug!(
            chunk = %uploaded.task.local_path.display(),
            rules = rules.len(),
            chars = content.len(),
            "Chunk analyzed"
        );
        Ok(Analyzed {
            uploaded,
            content,
            rules,
        })
    }

    async fn record_alerts(&self, analyzed: Analyzed) -> Result<(Analyzed, Vec<String>)> {
        if analyzed.rules.is_empty() {
            return Ok((analyzed, Vec::new()));
        }

        let config = &self.inner.config;
        let ids: Vec<&str> = analyzed.rules.iter().map(|r| r.id.as_str()).collect();
        let verdicts = parse_alert_responses(&analyzed.content, &ids, config.alert_scan_lines);
        let excerpt = snippet(&analyzed.content, config.snippet_chars);
        let filename = analyzed.uploaded.task.file_name();

        let mut triggered = Vec::new();
        for rule in &analyzed.rules {
            if !verdicts.get(&rule.id).copied().unwrap_or(false) {
                continue;
            }
            self.inner
                .services
                .alerts
                .record_trigger(rule, &analyzed.uploaded.video_url, &filename, &excerpt)
                .await?;
            triggered.push(rule.id.clone());
        }

        if !triggered.is_empty() {
            warn!(chunk = %filename, alerts = ?triggered, "Alerts triggered");
            self.inner.stats.record_alerts(triggered.len() as u64);
        }
        Ok((analyzed, triggered))
    }

    async fn index(&self, analyzed: Analyzed, triggered: Vec<String>) -> Result<ChunkOutcome> {
        let Analyzed {
            uploaded, content, ..
        } = analyzed;
        let now = Utc::now();

        let mut extra = IndexFields::new();
        extra.insert("video_url".into(), Value::from(uploaded.video_url.clone()));
        extra.insert("timestamp".into(), Value::from(now.to_rfc3339()));
        extra.insert("timestamp_unix".into(), Value::from(now.timestamp()));
        extra.insert("local_path".into(), Value::from(uploaded.task.file_name()));

        self.inner
            .services
            .index
            .add(&content, &uploaded.video_url, extra)
            .await?;

        Ok(ChunkOutcome {
            local_path: uploaded.task.local_path,
            video_url: uploaded.video_url,
            triggered,
        })
    }
}
