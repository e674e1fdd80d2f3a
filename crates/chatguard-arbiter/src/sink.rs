//! Enforcement sinks
//!
//! A sink receives each violation at most once per message link; the
//! enforcement worker guarantees that through the dedup store before
//! calling it.

use async_trait::async_trait;
use chatguard_core::{Decision, Error, NegativeFinding, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Executes a violation decision (ban, flag to moderators, ...)
#[async_trait]
pub trait EnforcementSink: Send + Sync {
    async fn enforce(&self, decision: &Decision, finding: &NegativeFinding) -> Result<()>;

    fn name(&self) -> &str;
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Log only
    #[default]
    Log,

    /// POST each finding to a moderator webhook
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

/// Sink that only writes a structured warning
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EnforcementSink for LogSink {
    async fn enforce(&self, decision: &Decision, finding: &NegativeFinding) -> Result<()> {
        warn!(
            message_id = %decision.message_id,
            link = %finding.message_link,
            chat_id = finding.chat_id,
            sender_id = finding.sender_id,
            sender = %finding.sender_username,
            reason = %decision.combined_reason,
            "Violation reported to moderators"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Sink posting findings as JSON to a moderator webhook
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    decision: &'a Decision,
    finding: &'a NegativeFinding,
}

#[async_trait]
impl EnforcementSink for WebhookSink {
    async fn enforce(&self, decision: &Decision, finding: &NegativeFinding) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&WebhookPayload { decision, finding })
            .send()
            .await
            .map_err(|e| Error::transient(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 429 || status.is_server_error() {
            Err(Error::transient(format!("webhook returned {}", status)))
        } else {
            Err(Error::internal(format!("webhook rejected finding: {}", status)))
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Build the configured sink
pub fn build_sink(config: &SinkConfig, client: &reqwest::Client) -> Arc<dyn EnforcementSink> {
    match config {
        SinkConfig::Log => Arc::new(LogSink),
        SinkConfig::Webhook { url, timeout_ms } => Arc::new(WebhookSink::new(
            client.clone(),
            url.clone(),
            Duration::from_millis(*timeout_ms),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_config_parsing() {
        let config: SinkConfig = serde_json::from_str(r#"{"type":"webhook","url":"http://mods"}"#).unwrap();
        match config {
            SinkConfig::Webhook { url, timeout_ms } => {
                assert_eq!(url, "http://mods");
                assert_eq!(timeout_ms, 5_000);
            }
            other => panic!("unexpected config: {:?}", other),
        }

        let config: SinkConfig = serde_json::from_str(r#"{"type":"log"}"#).unwrap();
        assert!(matches!(config, SinkConfig::Log));
    }

    #[test]
    fn test_build_sink_names() {
        let client = reqwest::Client::new();
        assert_eq!(build_sink(&SinkConfig::Log, &client).name(), "log");
        let webhook = SinkConfig::Webhook {
            url: "http://localhost/hook".into(),
            timeout_ms: 100,
        };
        assert_eq!(build_sink(&webhook, &client).name(), "webhook");
    }
}
