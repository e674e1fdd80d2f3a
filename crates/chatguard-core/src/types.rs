//! Core types for ChatGuard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// An incoming chat message. Created once at ingestion and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique identifier
    pub message_id: String,

    /// Chat the message was posted in
    pub chat_id: i64,

    /// Platform id of the author
    pub sender_id: i64,

    /// Display handle of the author
    pub sender_username: String,

    /// Message body
    pub text: String,

    /// Permalink to the message; the unit of moderator reporting
    pub link: String,

    /// Attached media, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,

    /// Ingestion time
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message received now
    pub fn new(
        message_id: impl Into<String>,
        chat_id: i64,
        sender_id: i64,
        sender_username: impl Into<String>,
        text: impl Into<String>,
        link: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            chat_id,
            sender_id,
            sender_username: sender_username.into(),
            text: text.into(),
            link: link.into(),
            media_url: None,
            received_at: Utc::now(),
        }
    }

    /// Attach a media reference
    pub fn with_media(mut self, url: impl Into<String>) -> Self {
        self.media_url = Some(url.into());
        self
    }
}

/// Payload placed on a stage input topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEnvelope {
    #[serde(flatten)]
    pub message: Message,

    /// Delivery attempt, bumped every time the envelope is requeued
    #[serde(default)]
    pub attempt: u32,

    /// Policy strings of the chat the message belongs to
    #[serde(default)]
    pub rules: Vec<String>,
}

impl StageEnvelope {
    /// Wrap a freshly ingested message
    pub fn new(message: Message, rules: Vec<String>) -> Self {
        Self {
            message,
            attempt: 0,
            rules,
        }
    }

    /// Copy of this envelope for the next delivery attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// A single stage's classification of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Clean,
    Violation,
    Uncertain,
}

impl Classification {
    /// Parse a label produced by an external capability.
    ///
    /// Accepts a few synonyms models tend to emit.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "clean" | "ok" | "safe" | "allowed" => Some(Self::Clean),
            "violation" | "spam" | "unsafe" | "blocked" => Some(Self::Violation),
            "uncertain" | "unknown" | "unsure" => Some(Self::Uncertain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Violation => "violation",
            Self::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage's opinion on one message. Keyed by `(message_id, stage_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub message_id: String,

    pub stage_name: String,

    pub classification: Classification,

    /// Human-readable explanation
    pub reason: String,

    /// Confidence score (0.0-1.0), when the stage provides one
    #[serde(default)]
    pub confidence: Option<f32>,

    #[serde(default = "Utc::now")]
    pub produced_at: DateTime<Utc>,

    /// Delivery attempt of the envelope this verdict was produced from
    #[serde(default)]
    pub attempt: u32,
}

impl Verdict {
    /// Create a new verdict produced now
    pub fn new(
        message_id: impl Into<String>,
        stage_name: impl Into<String>,
        classification: Classification,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            stage_name: stage_name.into(),
            classification,
            reason: reason.into(),
            confidence: None,
            produced_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Verdict emitted when a stage gave up on a message
    pub fn uncertain(
        message_id: impl Into<String>,
        stage_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(message_id, stage_name, Classification::Uncertain, reason)
    }

    /// Set the confidence, clamped into 0.0-1.0
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Set the delivery attempt
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// A violation vote counts when its confidence is at or above the
    /// threshold (inclusive). Missing confidence counts as a qualifying vote.
    pub fn is_qualifying_violation(&self, threshold: f32) -> bool {
        self.classification == Classification::Violation
            && self.confidence.map_or(true, |c| c >= threshold)
    }
}

/// Verdicts known for one message, at most one per stage.
///
/// Inserting goes through [`VerdictSet::upsert`], so redelivered verdicts
/// replace the earlier copy instead of accumulating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerdictSet {
    verdicts: BTreeMap<String, Verdict>,
}

impl VerdictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the verdict for its stage. Returns true when the
    /// stored content changed.
    pub fn upsert(&mut self, verdict: Verdict) -> bool {
        match self.verdicts.get(&verdict.stage_name) {
            Some(existing) if *existing == verdict => false,
            _ => {
                self.verdicts.insert(verdict.stage_name.clone(), verdict);
                true
            }
        }
    }

    pub fn get(&self, stage_name: &str) -> Option<&Verdict> {
        self.verdicts.get(stage_name)
    }

    /// Verdicts ordered by stage name
    pub fn iter(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.values()
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.verdicts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

impl FromIterator<Verdict> for VerdictSet {
    fn from_iter<I: IntoIterator<Item = Verdict>>(iter: I) -> Self {
        let mut set = Self::new();
        for verdict in iter {
            set.upsert(verdict);
        }
        set
    }
}

/// Final outcome of arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalClassification {
    Clean,
    Violation,
}

impl FinalClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Violation => "violation",
        }
    }
}

impl fmt::Display for FinalClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the arbiter got to its decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionResolution {
    /// Every expected stage reported
    #[default]
    Complete,
    /// The arbitration window elapsed first
    WindowElapsed,
}

/// The arbiter's combined decision. Exactly one per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub message_id: String,

    pub final_classification: FinalClassification,

    pub combined_reason: String,

    /// Stages whose verdicts were considered
    pub contributing_stages: BTreeSet<String>,

    #[serde(default)]
    pub resolution: DecisionResolution,

    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_violation(&self) -> bool {
        self.final_classification == FinalClassification::Violation
    }
}

/// Persisted record of a reported violation, unique per message link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeFinding {
    pub message_link: String,
    pub message_id: String,
    pub chat_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl NegativeFinding {
    /// Build the finding for a violation decision on `message`
    pub fn new(decision: &Decision, message: &Message) -> Self {
        Self {
            message_link: message.link.clone(),
            message_id: message.message_id.clone(),
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            sender_username: message.sender_username.clone(),
            reason: decision.combined_reason.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_envelope_wire_format() {
        let json = r#"{
            "message_id": "m-1",
            "chat_id": -1001,
            "sender_id": 42,
            "sender_username": "alice",
            "text": "hello",
            "link": "https://t.me/c/1001/7",
            "attempt": 2
        }"#;

        let envelope: StageEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.message.message_id, "m-1");
        assert_eq!(envelope.message.chat_id, -1001);
        assert_eq!(envelope.attempt, 2);
        assert!(envelope.rules.is_empty());
        assert!(envelope.message.media_url.is_none());
        assert_eq!(envelope.next_attempt().attempt, 3);
    }

    #[test]
    fn test_verdict_wire_format() {
        let json = r#"{"message_id": "m-1", "stage_name": "llm", "classification": "violation", "reason": "advertising", "confidence": null}"#;
        let verdict: Verdict = serde_json::from_str(json).unwrap();

        assert_eq!(verdict.classification, Classification::Violation);
        assert_eq!(verdict.confidence, None);
        assert!(verdict.is_qualifying_violation(0.5));

        let encoded = serde_json::to_value(&verdict).unwrap();
        assert_eq!(encoded["classification"], "violation");
        assert!(encoded["confidence"].is_null());
    }

    #[test]
    fn test_qualifying_violation_threshold() {
        let weak = Verdict::new("m", "s", Classification::Violation, "maybe").with_confidence(0.3);
        let strong = Verdict::new("m", "s", Classification::Violation, "spam").with_confidence(0.8);
        let clean = Verdict::new("m", "s", Classification::Clean, "fine").with_confidence(0.99);

        assert!(!weak.is_qualifying_violation(0.5));
        assert!(strong.is_qualifying_violation(0.5));
        assert!(!clean.is_qualifying_violation(0.5));

        let boundary = Verdict::new("m", "s", Classification::Violation, "spam").with_confidence(0.5);
        assert!(boundary.is_qualifying_violation(0.5));
    }

    #[test]
    fn test_verdict_set_upsert_replaces_by_stage() {
        let mut set = VerdictSet::new();
        let first = Verdict::new("m", "llm", Classification::Uncertain, "timeout");
        let second = Verdict::new("m", "llm", Classification::Clean, "fine");

        assert!(set.upsert(first));
        assert!(!set.upsert(set.get("llm").unwrap().clone()));
        assert!(set.upsert(second));

        assert_eq!(set.len(), 1);
        assert_eq!(set.get("llm").unwrap().classification, Classification::Clean);
    }

    #[test]
    fn test_parse_label_synonyms() {
        assert_eq!(Classification::parse_label(" Violation "), Some(Classification::Violation));
        assert_eq!(Classification::parse_label("safe"), Some(Classification::Clean));
        assert_eq!(Classification::parse_label("unsure"), Some(Classification::Uncertain));
        assert_eq!(Classification::parse_label("banana"), None);
    }
}
