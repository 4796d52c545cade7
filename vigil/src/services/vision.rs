//! OpenAI-compatible vision model client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::VisionAnalyzer;
use crate::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://dashscope-intl.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen3-vl-plus";

/// Settings for [`OpenAiVisionAnalyzer`].
#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl VisionSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// [`VisionAnalyzer`] speaking the `/chat/completions` protocol.
pub struct OpenAiVisionAnalyzer {
    settings: VisionSettings,
    client: Client,
}

impl OpenAiVisionAnalyzer {
    pub fn new(settings: VisionSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    fn build_payload(&self, video_url: &str, prompt: &str, sampling_fps: u32) -> Value {
        json!({
            "model": self.settings.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "video_url",
                            "video_url": { "url": video_url },
                            "fps": sampling_fps
                        },
                        {
                            "type": "text",
                            "text": prompt
                        }
                    ]
                }
            ]
        })
    }
}

/// Pull the assistant text out of a completion response.
///
/// `content` is either a string or a list of parts; text parts are joined.
fn extract_content(response: &Value) -> Result<String> {
    let content = response
        .pointer("/choices/0/message/content")
        .ok_or_else(|| Error::Analysis("response has no choices[0].message.content".to_string()))?;

    match content {
        Value::String(text) => Ok(text.clone()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")),
        other => Err(Error::Analysis(format!("unexpected content type: {}", other))),
    }
}

#[async_trait]
impl VisionAnalyzer for OpenAiVisionAnalyzer {
    async fn analyze(&self, video_url: &str, prompt: &str, sampling_fps: u32) -> Result<String> {
        let payload = self.build_payload(video_url, prompt, sampling_fps);
        debug!(video_url, model = %self.settings.model, "Requesting video analysis");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Analysis(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Vision API returned an error");
            return Err(Error::Analysis(format!("{} - {}", status, body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Analysis(format!("invalid response body: {}", e)))?;
        let content = extract_content(&body)?;
        info!(video_url, chars = content.len(), "Video analysis complete");
        Ok(content)
    }
}
