//! Alert rule and trigger history repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{AlertRuleDbModel, AlertTriggerDbModel};
use crate::{Error, Result};

/// Alert repository trait.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    // Rules
    async fn create_rule(&self, rule: &AlertRuleDbModel) -> Result<()>;
    async fn get_rule(&self, id: &str) -> Result<AlertRuleDbModel>;
    async fn list_rules(&self) -> Result<Vec<AlertRuleDbModel>>;
    async fn list_enabled_rules(&self) -> Result<Vec<AlertRuleDbModel>>;
    async fn update_rule(
        &self,
        id: &str,
        query_text: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<AlertRuleDbModel>;
    /// Returns `false` if no such rule existed.
    async fn delete_rule(&self, id: &str) -> Result<bool>;

    // History
    /// Append a trigger, prune history to the newest `cap` entries and bump
    /// the rule's trigger count, atomically.
    async fn record_trigger(&self, trigger: &AlertTriggerDbModel, cap: i64) -> Result<()>;
    async fn list_history(&self, limit: i64) -> Result<Vec<AlertTriggerDbModel>>;
    async fn count_history(&self) -> Result<i64>;
}

/// SQLx implementation of [`AlertRepository`].
pub struct SqlxAlertRepository {
    pool: SqlitePool,
}

impl SqlxAlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertRepository for SqlxAlertRepository {
    async fn create_rule(&self, rule: &AlertRuleDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_rule (id, query_text, enabled, created_at, trigger_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.query_text)
        .bind(rule.enabled)
        .bind(rule.created_at)
        .bind(rule.trigger_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_rule(&self, id: &str) -> Result<AlertRuleDbModel> {
        sqlx::query_as::<_, AlertRuleDbModel>("SELECT * FROM alert_rule WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("AlertRule", id))
    }

    async fn list_rules(&self) -> Result<Vec<AlertRuleDbModel>> {
        let rules = sqlx::query_as::<_, AlertRuleDbModel>(
            "SELECT * FROM alert_rule ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn list_enabled_rules(&self) -> Result<Vec<AlertRuleDbModel>> {
        let rules = sqlx::query_as::<_, AlertRuleDbModel>(
            "SELECT * FROM alert_rule WHERE enabled = 1 ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn update_rule(
        &self,
        id: &str,
        query_text: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<AlertRuleDbModel> {
        let result = sqlx::query(
            r#"
            UPDATE alert_rule SET
                query_text = COALESCE(?, query_text),
                enabled = COALESCE(?, enabled)
            WHERE id = ?
            "#,
        )
        .bind(query_text)
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("AlertRule", id));
        }
        self.get_rule(id).await
    }

    async fn delete_rule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alert_rule WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_trigger(&self, trigger: &AlertTriggerDbModel, cap: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO alert_history (
                id, alert_id, alert_query, video_url, local_filename, timestamp, analysis_snippet
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trigger.id)
        .bind(&trigger.alert_id)
        .bind(&trigger.alert_query)
        .bind(&trigger.video_url)
        .bind(&trigger.local_filename)
        .bind(trigger.timestamp)
        .bind(&trigger.analysis_snippet)
        .execute(&mut *tx)
        .await?;

        // FIFO eviction beyond the cap
        sqlx::query(
            r#"
            DELETE FROM alert_history WHERE seq NOT IN (
                SELECT seq FROM alert_history ORDER BY seq DESC LIMIT ?
            )
            "#,
        )
        .bind(cap)
        .execute(&mut *tx)
        .await?;

        // A rule deleted meanwhile keeps its history entry.
        sqlx::query("UPDATE alert_rule SET trigger_count = trigger_count + 1 WHERE id = ?")
            .bind(&trigger.alert_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_history(&self, limit: i64) -> Result<Vec<AlertTriggerDbModel>> {
        let history = sqlx::query_as::<_, AlertTriggerDbModel>(
            "SELECT * FROM alert_history ORDER BY seq DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }

    async fn count_history(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alert_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::migrated_pool;

    #[tokio::test]
    async fn test_rule_crud() {
        let (pool, _temp) = migrated_pool().await;
        let repo = SqlxAlertRepository::new(pool);

        let rule = AlertRuleDbModel::new("person near the shelves", true);
        repo.create_rule(&rule).await.unwrap();
        assert_eq!(repo.get_rule(&rule.id).await.unwrap(), rule);

        let updated = repo.update_rule(&rule.id, None, Some(false)).await.unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.query_text, "person near the shelves");
        assert!(repo.list_enabled_rules().await.unwrap().is_empty());

        assert!(repo.delete_rule(&rule.id).await.unwrap());
        assert!(!repo.delete_rule(&rule.id).await.unwrap());
        assert!(matches!(repo.get_rule(&rule.id).await, Err(Error::NotFound { .. })));
        assert!(matches!(
            repo.update_rule(&rule.id, Some("x"), None).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_trigger_counts_and_orders() {
        let (pool, _temp) = migrated_pool().await;
        let repo = SqlxAlertRepository::new(pool);

        let rule = AlertRuleDbModel::new("open door", true);
        repo.create_rule(&rule).await.unwrap();

        for i in 0..3 {
            let trigger = AlertTriggerDbModel::new(
                &rule,
                format!("https://cdn/{i}.mp4"),
                format!("{i}.mp4"),
                "snippet",
            );
            repo.record_trigger(&trigger, 2).await.unwrap();
        }

        assert_eq!(repo.get_rule(&rule.id).await.unwrap().trigger_count, 3);
        assert_eq!(repo.count_history().await.unwrap(), 2);

        let history = repo.list_history(10).await.unwrap();
        let urls: Vec<&str> = history.iter().map(|h| h.video_url.as_str()).collect();
        assert_eq!(urls, vec!["https://cdn/2.mp4", "https://cdn/1.mp4"]);
        assert_eq!(repo.list_history(1).await.unwrap().len(), 1);
    }
}
