mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeStore, MemoryIndex, ScriptedAnalyzer, alert_engine, migrated_pool, services};
use vigil::Error;
use vigil::pipeline::{ChunkPipeline, ChunkTask, PipelineConfig};

#[tokio::test]
async fn upload_failure_skips_alerts_and_index() {
    let (pool, _temp) = migrated_pool().await;
    let alerts = alert_engine(pool);
    alerts.create_rule("anyone at the desk", true).await.unwrap();

    let analyzer = Arc::new(ScriptedAnalyzer::replying(|_| "ignored".into()));
    let index = Arc::new(MemoryIndex::default());
    let pipeline = ChunkPipeline::new(
        PipelineConfig::default(),
        services(Arc::new(FakeStore::failing()), analyzer.clone(), index.clone(), alerts.clone()),
    );

    let err = pipeline
        .process(ChunkTask::new("/rec/chunk_20240101_000000.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upload(_)));

    assert!(analyzer.prompts.lock().is_empty());
    assert!(index.docs.lock().is_empty());
    assert!(alerts.history(10).await.unwrap().is_empty());

    let stats = pipeline.stats();
    assert_eq!(stats.upload_failed, 1);
    assert_eq!(stats.completed, 0);
}

#[tokio::test]
async fn submitted_upload_failure_stays_inside_the_task() {
    let (pool, _temp) = migrated_pool().await;
    let pipeline = ChunkPipeline::new(
        PipelineConfig::default(),
        services(
            Arc::new(FakeStore::failing()),
            Arc::new(ScriptedAnalyzer::replying(|_| String::new())),
            Arc::new(MemoryIndex::default()),
            alert_engine(pool),
        ),
    );

    pipeline.submit(ChunkTask::new("/rec/chunk_20240101_000000.mp4"));
    pipeline.submit(ChunkTask::new("/rec/chunk_20240101_001000.mp4"));
    assert!(pipeline.wait_idle(Duration::from_secs(5)).await);

    let stats = pipeline.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.upload_failed, 2);
    assert_eq!(stats.in_flight(), 0);
}

#[tokio::test]
async fn triggered_alerts_are_recorded_and_indexed() {
    let (pool, _temp) = migrated_pool().await;
    let alerts = alert_engine(pool);
    let running = alerts.create_rule("someone running", true).await.unwrap();
    let sitting = alerts.create_rule("someone sitting", true).await.unwrap();
    let silent = alerts.create_rule("a dog", true).await.unwrap();
    let disabled = alerts.create_rule("a cat", false).await.unwrap();

    let (running_id, sitting_id) = (running.id.clone(), sitting.id.clone());
    let analyzer = Arc::new(ScriptedAnalyzer::replying(move |_| {
        format!("{{\"people\": 3}}\n{running_id}: TRUE\n{sitting_id}: FALSE")
    }));
    let index = Arc::new(MemoryIndex::default());
    let pipeline = ChunkPipeline::new(
        PipelineConfig::default(),
        services(Arc::new(FakeStore::default()), analyzer.clone(), index.clone(), alerts.clone()),
    );

    let outcome = pipeline
        .process(ChunkTask::new("/rec/chunk_20240101_000000.mp4"))
        .await
        .unwrap();
    assert_eq!(outcome.video_url, "https://cdn.example.com/chunk_20240101_000000.mp4");
    assert_eq!(outcome.triggered, vec![running.id.clone()]);

    let prompt = analyzer.prompts.lock()[0].clone();
    assert!(prompt.contains(&format!("- {}: someone running", running.id)));
    assert!(prompt.contains(&format!("- {}: a dog", silent.id)));
    assert!(!prompt.contains(&disabled.id));

    let history = alerts.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].alert_id, running.id);
    assert_eq!(history[0].local_filename, "chunk_20240101_000000.mp4");
    assert!(history[0].analysis_snippet.starts_with("{\"people\": 3}"));
    assert_eq!(alerts.get_rule(&running.id).await.unwrap().trigger_count, 1);
    assert_eq!(alerts.get_rule(&sitting.id).await.unwrap().trigger_count, 0);
    assert_eq!(alerts.get_rule(&silent.id).await.unwrap().trigger_count, 0);

    let docs = index.docs.lock();
    assert_eq!(docs.len(), 1);
    let (_, url, extra) = &docs[0];
    assert_eq!(url, "https://cdn.example.com/chunk_20240101_000000.mp4");
    assert_eq!(extra["local_path"], "chunk_20240101_000000.mp4");
    assert_eq!(extra["video_url"], url.as_str());
    assert!(extra["timestamp_unix"].as_i64().unwrap() > 0);
    assert!(extra.contains_key("timestamp"));

    let stats = pipeline.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.alerts_triggered, 1);
}

#[tokio::test]
async fn no_rules_sends_plain_preprompt() {
    let (pool, _temp) = migrated_pool().await;
    let analyzer = Arc::new(ScriptedAnalyzer::replying(|_| "quiet room".into()));
    let pipeline = ChunkPipeline::new(
        PipelineConfig {
            preprompt: "describe the room".into(),
            ..PipelineConfig::default()
        },
        services(
            Arc::new(FakeStore::default()),
            analyzer.clone(),
            Arc::new(MemoryIndex::default()),
            alert_engine(pool),
        ),
    );

    let outcome = pipeline
        .process(ChunkTask::new("/rec/chunk_20240101_000000.mp4"))
        .await
        .unwrap();
    assert!(outcome.triggered.is_empty());
    assert_eq!(analyzer.prompts.lock()[0], "describe the room");
}
