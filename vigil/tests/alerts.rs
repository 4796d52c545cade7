mod common;

use common::{alert_engine, migrated_pool};

#[tokio::test]
async fn history_is_capped_and_evicts_oldest() {
    let (pool, _temp) = migrated_pool().await;
    let alerts = alert_engine(pool);
    assert_eq!(alerts.history_cap(), 1000);
    let rule = alerts.create_rule("open window", true).await.unwrap();

    for i in 0..1001 {
        alerts
            .record_trigger(&rule, &format!("https://cdn/{i}.mp4"), &format!("{i}.mp4"), "")
            .await
            .unwrap();
    }

    let history = alerts.history(5000).await.unwrap();
    assert_eq!(history.len(), 1000);
    assert_eq!(history[0].video_url, "https://cdn/1000.mp4");
    assert_eq!(history[999].video_url, "https://cdn/1.mp4");
    assert!(history.iter().all(|h| h.video_url != "https://cdn/0.mp4"));

    assert_eq!(alerts.get_rule(&rule.id).await.unwrap().trigger_count, 1001);
    assert_eq!(alerts.history(3).await.unwrap().len(), 3);
}

#[tokio::test]
async fn smaller_cap_is_honored() {
    let (pool, _temp) = migrated_pool().await;
    let alerts = alert_engine(pool).with_history_cap(2);
    let rule = alerts.create_rule("lights off", true).await.unwrap();

    for i in 0..4 {
        alerts
            .record_trigger(&rule, &format!("https://cdn/{i}.mp4"), &format!("{i}.mp4"), "")
            .await
            .unwrap();
    }

    let urls: Vec<String> = alerts
        .history(10)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.video_url)
        .collect();
    assert_eq!(urls, vec!["https://cdn/3.mp4", "https://cdn/2.mp4"]);
}
