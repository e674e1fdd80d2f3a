//! Language-model reviewers
//!
//! Talks to any OpenAI-compatible `chat/completions` endpoint. The model is
//! asked to answer with a single JSON object:
//!
//! ```json
//! {"classification": "violation", "reason": "advertising", "confidence": 0.7}
//! ```
//!
//! Anything else is a [`Error::MalformedResponse`], which the stage retries
//! like a network failure.

use crate::analyzer::{Analyzer, AnalyzerKind, Assessment};
use crate::config::ModelConfig;
use async_trait::async_trait;
use chatguard_core::{Classification, Error, Message, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a chat moderator. Judge the user's message against the \
chat rules. Reply with one JSON object and nothing else: \
{\"classification\": \"clean\" | \"violation\" | \"uncertain\", \"reason\": string, \
\"confidence\": number between 0 and 1}.";

/// Analyzer backed by a chat completion API.
///
/// Client and credentials are owned by the analyzer; nothing is read from
/// process-wide state after construction.
pub struct ModelAnalyzer {
    name: String,
    kind: AnalyzerKind,
    client: Client,
    completions_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl ModelAnalyzer {
    /// Create a new model analyzer, reading the API key from the configured
    /// environment variable
    pub fn new(
        name: impl Into<String>,
        kind: AnalyzerKind,
        config: &ModelConfig,
        client: Client,
    ) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::config(format!("environment variable {} is not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            name: name.into(),
            kind,
            client,
            completions_url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn request_body(&self, message: &Message, rules: &[String]) -> CompletionRequest<'_> {
        let rules = if rules.is_empty() {
            "(no chat-specific rules)".to_string()
        } else {
            rules
                .iter()
                .enumerate()
                .map(|(i, rule)| format!("{}. {}", i + 1, rule))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut user = format!("Chat rules:\n{}\n\nMessage:\n{}", rules, message.text);
        if let Some(media) = &message.media_url {
            user.push_str(&format!("\n\nAttached media: {}", media));
        }

        CompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl Analyzer for ModelAnalyzer {
    async fn evaluate(&self, message: &Message, rules: &[String]) -> Result<Assessment> {
        let mut request = self
            .client
            .post(&self.completions_url)
            .json(&self.request_body(message, rules));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transient(format!("{} request failed: {}", self.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &body));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("{} returned invalid JSON: {}", self.name, e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::malformed(format!("{} returned no choices", self.name)))?;

        debug!(
            analyzer = %self.name,
            message_id = %message.message_id,
            reply = %content,
            "Model reply"
        );

        parse_model_reply(&content)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AnalyzerKind {
        self.kind
    }
}

/// Map a non-success HTTP status to the error taxonomy
fn status_error(name: &str, status: StatusCode, body: &str) -> Error {
    let detail = format!("{} returned {}: {}", name, status, body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::transient(detail)
    } else {
        Error::internal(detail)
    }
}

/// Parse the model's text reply into an assessment.
///
/// Tolerates code fences and prose around the JSON object.
pub fn parse_model_reply(content: &str) -> Result<Assessment> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => return Err(Error::malformed(format!("no JSON object in reply: {:?}", content))),
    };

    let reply: ModelReply = serde_json::from_str(json)
        .map_err(|e| Error::malformed(format!("unparseable reply: {}", e)))?;

    let classification = Classification::parse_label(&reply.classification).ok_or_else(|| {
        Error::malformed(format!("unknown classification {:?}", reply.classification))
    })?;

    let mut assessment = Assessment {
        classification,
        reason: reply.reason,
        confidence: None,
    };
    if let Some(confidence) = reply.confidence {
        if !confidence.is_finite() {
            return Err(Error::malformed("confidence is not a number"));
        }
        assessment = assessment.with_confidence(confidence);
    }

    Ok(assessment)
}

#[derive(Deserialize)]
struct ModelReply {
    classification: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
