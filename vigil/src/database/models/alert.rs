//! Alert rule and trigger history models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, now_ms};

/// A standing query evaluated against every chunk analysis.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct AlertRuleDbModel {
    pub id: String,
    pub query_text: String,
    pub enabled: bool,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub trigger_count: i64,
}

impl AlertRuleDbModel {
    pub fn new(query_text: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query_text: query_text.into(),
            enabled,
            created_at: now_ms(),
            trigger_count: 0,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.created_at)
    }
}

/// One alert trigger, newest first when listed.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct AlertTriggerDbModel {
    /// Insertion order.
    #[serde(skip)]
    pub seq: i64,
    pub id: String,
    pub alert_id: String,
    pub alert_query: String,
    pub video_url: String,
    pub local_filename: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub analysis_snippet: String,
}

impl AlertTriggerDbModel {
    pub fn new(
        rule: &AlertRuleDbModel,
        video_url: impl Into<String>,
        local_filename: impl Into<String>,
        analysis_snippet: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            alert_id: rule.id.clone(),
            alert_query: rule.query_text.clone(),
            video_url: video_url.into(),
            local_filename: local_filename.into(),
            timestamp: now_ms(),
            analysis_snippet: analysis_snippet.into(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        ms_to_datetime(self.timestamp)
    }
}
