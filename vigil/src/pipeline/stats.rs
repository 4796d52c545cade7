//! Pipeline counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Analyze,
    AlertRecord,
    Index,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Analyze => "analyze",
            Self::AlertRecord => "alert_record",
            Self::Index => "index",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free counters updated by pipeline tasks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    submitted: AtomicU64,
    uploaded: AtomicU64,
    analyzed: AtomicU64,
    alerts_triggered: AtomicU64,
    indexed: AtomicU64,
    completed: AtomicU64,
    upload_failed: AtomicU64,
    analyze_failed: AtomicU64,
    alert_record_failed: AtomicU64,
    index_failed: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage_done(&self, stage: Stage) {
        let counter = match stage {
            Stage::Upload => &self.uploaded,
            Stage::Analyze => &self.analyzed,
            // Counted per trigger instead.
            Stage::AlertRecord => return,
            Stage::Index => &self.indexed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_alerts(&self, count: u64) {
        self.alerts_triggered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, stage: Stage) {
        let counter = match stage {
            Stage::Upload => &self.upload_failed,
            Stage::Analyze => &self.analyze_failed,
            Stage::AlertRecord => &self.alert_record_failed,
            Stage::Index => &self.index_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            alerts_triggered: self.alerts_triggered.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            upload_failed: self.upload_failed.load(Ordering::Relaxed),
            analyze_failed: self.analyze_failed.load(Ordering::Relaxed),
            alert_record_failed: self.alert_record_failed.load(Ordering::Relaxed),
            index_failed: self.index_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub submitted: u64,
    pub uploaded: u64,
    pub analyzed: u64,
    pub alerts_triggered: u64,
    pub indexed: u64,
    /// Chunks that went through every stage.
    pub completed: u64,
    pub upload_failed: u64,
    pub analyze_failed: u64,
    pub alert_record_failed: u64,
    pub index_failed: u64,
}

impl PipelineStatsSnapshot {
    pub fn failed(&self) -> u64 {
        self.upload_failed + self.analyze_failed + self.alert_record_failed + self.index_failed
    }

    /// Submitted chunks that have neither completed nor failed yet.
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed())
    }
}
