//! Link and phrase heuristics
//!
//! Runs in-process and never fails transiently. Link checks come first so
//! a message carrying both an invite and a forbidden phrase is reported
//! with the link reason.

use crate::analyzer::{Analyzer, AnalyzerKind, Assessment};
use crate::config::HeuristicConfig;
use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use chatguard_core::{Error, Message, Result};
use regex::Regex;
use tracing::debug;
use url::Url;

const INVITE_HOSTS: &[&str] = &["t.me", "telegram.me", "telegram.dog"];

const LINK_PATTERN: &str = r#"(?i)\b(?:https?://|www\.|(?:t\.me|telegram\.(?:me|dog))/)[^\s<>"']+"#;

/// Heuristic analyzer using Aho-Corasick phrase matching and a link scanner
pub struct HeuristicAnalyzer {
    name: String,
    phrases: Option<AhoCorasick>,
    phrase_labels: Vec<String>,
    link_finder: Regex,
    allowed_domains: Vec<String>,
    block_external_links: bool,
    link_confidence: f32,
}

impl HeuristicAnalyzer {
    /// Create a new heuristic analyzer
    pub fn new(name: impl Into<String>, config: &HeuristicConfig) -> Result<Self> {
        let (phrase_labels, patterns): (Vec<_>, Vec<_>) = config
            .forbidden_phrases
            .iter()
            .flat_map(|(label, phrases)| phrases.iter().map(move |p| (label.clone(), p.clone())))
            .unzip();

        let phrases = if patterns.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&patterns)
                    .map_err(|e| Error::config(format!("Failed to build phrase matcher: {}", e)))?,
            )
        };

        let link_finder = Regex::new(LINK_PATTERN)
            .map_err(|e| Error::config(format!("Invalid link pattern: {}", e)))?;

        Ok(Self {
            name: name.into(),
            phrases,
            phrase_labels,
            link_finder,
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches("www.").to_ascii_lowercase())
                .collect(),
            block_external_links: config.block_external_links,
            link_confidence: config.link_confidence,
        })
    }

    fn is_allowed(&self, host: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{}", d)))
    }

    /// First link in `text` that breaks the link policy
    fn forbidden_link<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.link_finder.find_iter(text).map(|m| m.as_str()).find(|raw| {
            match link_host(raw) {
                Some(host) if INVITE_HOSTS.contains(&host.as_str()) => true,
                Some(host) => self.block_external_links && !self.is_allowed(&host),
                None => self.block_external_links,
            }
        })
    }

    fn forbidden_phrase(&self, text: &str) -> Option<&str> {
        let found = self.phrases.as_ref()?.find(text)?;
        self.phrase_labels
            .get(found.pattern().as_usize())
            .map(String::as_str)
    }
}

/// Lowercased host of a scanned link, without a leading `www.`
fn link_host(raw: &str) -> Option<String> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let url = Url::parse(&candidate).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

#[async_trait]
impl Analyzer for HeuristicAnalyzer {
    async fn evaluate(&self, message: &Message, _rules: &[String]) -> Result<Assessment> {
        if let Some(link) = self.forbidden_link(&message.text) {
            debug!(message_id = %message.message_id, link, "Forbidden link");
            return Ok(Assessment::violation("forbidden link", self.link_confidence));
        }

        if let Some(label) = self.forbidden_phrase(&message.text) {
            return Ok(Assessment::violation(format!("forbidden phrase: {}", label), 1.0));
        }

        Ok(Assessment::clean("no heuristic matched"))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Heuristic
    }
}
