//! Alert rules and their trigger history.
//!
//! The engine is a thin layer over [`AlertRepository`] that validates input
//! and owns the history cap.

use std::sync::Arc;

use tracing::{debug, info};

use crate::database::models::{AlertRuleDbModel, AlertTriggerDbModel};
use crate::database::repositories::AlertRepository;
use crate::{Error, Result};

/// Maximum number of trigger records kept.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// Alert rule CRUD plus the bounded trigger history.
#[derive(Clone)]
pub struct AlertEngine {
    repo: Arc<dyn AlertRepository>,
    history_cap: usize,
}

impl AlertEngine {
    pub fn new(repo: Arc<dyn AlertRepository>) -> Self {
        Self {
            repo,
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    pub async fn create_rule(&self, query_text: &str, enabled: bool) -> Result<AlertRuleDbModel> {
        let query_text = validate_query(query_text)?;
        let rule = AlertRuleDbModel::new(query_text, enabled);
        self.repo.create_rule(&rule).await?;
        info!(alert_id = %rule.id, enabled, "Alert rule created");
        Ok(rule)
    }

    pub async fn get_rule(&self, id: &str) -> Result<AlertRuleDbModel> {
        self.repo.get_rule(id).await
    }

    pub async fn list_rules(&self) -> Result<Vec<AlertRuleDbModel>> {
        self.repo.list_rules().await
    }

    pub async fn list_enabled_rules(&self) -> Result<Vec<AlertRuleDbModel>> {
        self.repo.list_enabled_rules().await
    }

    /// Change the query text and/or the enabled flag. `None` leaves a field as is.
    pub async fn update_rule(
        &self,
        id: &str,
        query_text: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<AlertRuleDbModel> {
        let query_text = query_text.map(validate_query).transpose()?;
        let rule = self.repo.update_rule(id, query_text, enabled).await?;
        debug!(alert_id = %id, enabled = rule.enabled, "Alert rule updated");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        if !self.repo.delete_rule(id).await? {
            return Err(Error::not_found("AlertRule", id));
        }
        info!(alert_id = %id, "Alert rule deleted");
        Ok(())
    }

    /// Append a trigger for `rule` and bump its trigger count.
    pub async fn record_trigger(
        &self,
        rule: &AlertRuleDbModel,
        video_url: &str,
        local_filename: &str,
        analysis_snippet: &str,
    ) -> Result<AlertTriggerDbModel> {
        let trigger = AlertTriggerDbModel::new(rule, video_url, local_filename, analysis_snippet);
        self.repo
            .record_trigger(&trigger, self.history_cap as i64)
            .await?;
        info!(alert_id = %rule.id, query = %rule.query_text, video_url, "Alert triggered");
        Ok(trigger)
    }

    /// Most recent triggers first, at most `limit`.
    pub async fn history(&self, limit: usize) -> Result<Vec<AlertTriggerDbModel>> {
        let limit = limit.min(self.history_cap) as i64;
        self.repo.list_history(limit).await
    }
}

fn validate_query(query_text: &str) -> Result<&str> {
    let trimmed = query_text.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("alert query must not be empty"));
    }
    Ok(trimmed)
}
