//! Block-found notifications.
//!
//! Delivery is fire-and-forget: a failing hook is logged and never touches
//! the block pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::session::MiningMode;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockFoundEvent {
    pub height: u64,
    pub block_id: String,
    pub mode: MiningMode,
    pub finder_address: String,
    pub finder_worker: String,
    pub effort_percent: f64,
    pub found_at: DateTime<Utc>,
}

impl BlockFoundEvent {
    /// Finder address shortened for public channels.
    pub fn short_finder(&self) -> String {
        let prefix: String = self.finder_address.chars().take(12).collect();
        format!("{}...{}", prefix, self.finder_worker)
    }
}

#[async_trait]
pub trait BlockNotifier: Send + Sync {
    async fn block_found(&self, event: &BlockFoundEvent) -> Result<(), NotifyError>;
}

/// Posts a Discord-style embed to a webhook URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        Ok(Self { url: url.to_string(), client })
    }

    pub fn payload(event: &BlockFoundEvent) -> serde_json::Value {
        json!({
            "embeds": [{
                "title": "Block found!",
                "color": 65280,
                "description": format!(
                    "Height: **{}**\nMode: **{}**\nMiner: {}\nEffort: {:.2}%",
                    event.height,
                    event.mode.as_str().to_uppercase(),
                    event.short_finder(),
                    event.effort_percent
                ),
                "timestamp": event.found_at.to_rfc3339(),
            }]
        })
    }
}

#[async_trait]
impl BlockNotifier for WebhookNotifier {
    async fn block_found(&self, event: &BlockFoundEvent) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&Self::payload(event))
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_mentions_height_and_mode() {
        let event = BlockFoundEvent {
            height: 1_234_567,
            block_id: "abc".to_string(),
            mode: MiningMode::Solo,
            finder_address: "9fRAWhdxEsTcdb8PhGNrZfwqa65zfkuYHAMmkQLcic1gdLSV5vA".to_string(),
            finder_worker: "rig1".to_string(),
            effort_percent: 87.5,
            found_at: Utc::now(),
        };
        let text = WebhookNotifier::payload(&event)["embeds"][0]["description"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(text.contains("1234567"));
        assert!(text.contains("SOLO"));
        assert!(text.contains("9fRAWhdxEsTc...rig1"));
    }
}
