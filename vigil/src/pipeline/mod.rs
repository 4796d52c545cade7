//! Chunk pipeline: Upload -> Analyze -> AlertRecord -> Index.
//!
//! Every chunk runs in its own task. Stages within one chunk are strictly
//! ordered; chunks are not ordered relative to each other. A failing stage
//! ends that chunk's run and nothing else.

pub mod alerts;
pub mod manager;
pub mod stats;

pub use alerts::{build_prompt, parse_alert_responses, snippet};
pub use manager::{ChunkOutcome, ChunkPipeline, ChunkTask, PipelineConfig, PipelineServices};
pub use stats::{PipelineStats, PipelineStatsSnapshot, Stage};
