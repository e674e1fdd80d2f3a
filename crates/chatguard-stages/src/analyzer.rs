//! Analyzer trait and common types

use async_trait::async_trait;
use chatguard_core::{Classification, Message, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An external analysis capability.
///
/// Implementations own whatever client state they need (HTTP clients,
/// credentials, pattern tables); nothing is shared through globals, so a
/// fake implementation can stand in for any of them in tests.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Assess a message against the chat's rules
    async fn evaluate(&self, message: &Message, rules: &[String]) -> Result<Assessment>;

    /// Get the analyzer name
    fn name(&self) -> &str;

    /// Which family of capability this is
    fn kind(&self) -> AnalyzerKind;
}

/// Capability families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    Heuristic,
    PrimaryModel,
    SecondaryModel,
    MediaModel,
}

impl AnalyzerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::PrimaryModel => "primary_model",
            Self::SecondaryModel => "secondary_model",
            Self::MediaModel => "media_model",
        }
    }

    /// Whether the capability makes network calls
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Heuristic)
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one analysis call
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub classification: Classification,

    pub reason: String,

    /// Confidence score (0.0-1.0)
    pub confidence: Option<f32>,
}

impl Assessment {
    pub fn clean(reason: impl Into<String>) -> Self {
        Self {
            classification: Classification::Clean,
            reason: reason.into(),
            confidence: None,
        }
    }

    pub fn violation(reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            classification: Classification::Violation,
            reason: reason.into(),
            confidence: Some(confidence.clamp(0.0, 1.0)),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}
