//! Remote media classifier

use crate::analyzer::{Analyzer, AnalyzerKind, Assessment};
use crate::config::MediaConfig;
use async_trait::async_trait;
use chatguard_core::{Classification, Error, Message, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Sends the media URL of a message to a classifier returning `{label, score}`
pub struct MediaAnalyzer {
    name: String,
    client: Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    threshold: f32,
}

impl MediaAnalyzer {
    pub fn new(name: impl Into<String>, config: &MediaConfig, client: Client) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::config(format!("environment variable {} is not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            name: name.into(),
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            threshold: config.threshold,
        })
    }

    fn interpret(&self, reply: MediaReply) -> Assessment {
        let score = reply.score.clamp(0.0, 1.0);
        match Classification::parse_label(&reply.label) {
            Some(Classification::Violation) => {
                Assessment::violation(format!("media flagged as {}", reply.label), score)
            }
            Some(Classification::Clean) => Assessment::clean("media looks fine").with_confidence(score),
            Some(Classification::Uncertain) => Assessment {
                classification: Classification::Uncertain,
                reason: "media classifier unsure".to_string(),
                confidence: Some(score),
            },
            // Category labels such as "nsfw" or "scam" are judged by score
            None if score >= self.threshold => {
                Assessment::violation(format!("media flagged as {}", reply.label), score)
            }
            None => Assessment::clean(format!("media below threshold for {}", reply.label))
                .with_confidence(1.0 - score),
        }
    }
}

#[async_trait]
impl Analyzer for MediaAnalyzer {
    async fn evaluate(&self, message: &Message, rules: &[String]) -> Result<Assessment> {
        let Some(media_url) = &message.media_url else {
            return Ok(Assessment::clean("no media attached"));
        };

        let Some(endpoint) = &self.endpoint else {
            return Ok(Assessment {
                classification: Classification::Uncertain,
                reason: "no media classifier configured".to_string(),
                confidence: None,
            });
        };

        let mut request = self.client.post(endpoint).json(&MediaRequest {
            url: media_url,
            rules,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transient(format!("{} request failed: {}", self.name, e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::transient(format!("{} returned {}", self.name, status)));
        }
        if !status.is_success() {
            return Err(Error::internal(format!("{} returned {}", self.name, status)));
        }

        let reply: MediaReply = response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("{} returned invalid JSON: {}", self.name, e)))?;
        if !reply.score.is_finite() {
            return Err(Error::malformed(format!("{} returned a non-numeric score", self.name)));
        }

        Ok(self.interpret(reply))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::MediaModel
    }
}

#[derive(Serialize)]
struct MediaRequest<'a> {
    url: &'a str,
    rules: &'a [String],
}

#[derive(Debug, Deserialize)]
struct MediaReply {
    label: String,
    score: f32,
}
