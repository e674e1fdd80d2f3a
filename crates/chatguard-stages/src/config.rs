//! Configuration for analysis stages

use crate::analyzer::AnalyzerKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stage of the pipeline as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageSpec {
    /// Local link and phrase rules
    Heuristic {
        name: String,
        #[serde(default)]
        settings: HeuristicConfig,
    },

    /// First language-model reviewer
    PrimaryModel { name: String, settings: ModelConfig },

    /// Second language-model reviewer
    SecondaryModel { name: String, settings: ModelConfig },

    /// Remote media classifier
    MediaModel {
        name: String,
        #[serde(default)]
        settings: MediaConfig,
    },
}

impl StageSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Heuristic { name, .. }
            | Self::PrimaryModel { name, .. }
            | Self::SecondaryModel { name, .. }
            | Self::MediaModel { name, .. } => name,
        }
    }

    pub fn kind(&self) -> AnalyzerKind {
        match self {
            Self::Heuristic { .. } => AnalyzerKind::Heuristic,
            Self::PrimaryModel { .. } => AnalyzerKind::PrimaryModel,
            Self::SecondaryModel { .. } => AnalyzerKind::SecondaryModel,
            Self::MediaModel { .. } => AnalyzerKind::MediaModel,
        }
    }
}

/// Heuristic analyzer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicConfig {
    /// Phrases that are always violations, keyed by label
    #[serde(default)]
    pub forbidden_phrases: BTreeMap<String, Vec<String>>,

    /// Domains links may point to without being flagged
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Flag links to domains outside `allowed_domains`; chat invites are
    /// flagged regardless
    #[serde(default = "default_block_external_links")]
    pub block_external_links: bool,

    /// Confidence reported for link violations
    #[serde(default = "default_link_confidence")]
    pub link_confidence: f32,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            forbidden_phrases: BTreeMap::new(),
            allowed_domains: Vec::new(),
            block_external_links: default_block_external_links(),
            link_confidence: default_link_confidence(),
        }
    }
}

fn default_block_external_links() -> bool {
    true
}

fn default_link_confidence() -> f32 {
    0.9
}

/// Language-model reviewer settings (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub endpoint: String,

    /// Model identifier sent with each request
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.0
}

fn default_max_tokens() -> u32 {
    256
}

/// Media classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Classifier URL; without one, media is reported as uncertain
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Score at or above which an unrecognised label counts as a violation
    #[serde(default = "default_media_threshold")]
    pub threshold: f32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: None,
            threshold: default_media_threshold(),
        }
    }
}

fn default_media_threshold() -> f32 {
    0.7
}
