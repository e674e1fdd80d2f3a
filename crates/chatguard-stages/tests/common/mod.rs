//! Fake analyzers and stores for stage tests

#![allow(dead_code)]

use async_trait::async_trait;
use chatguard_broker::DedupStore;
use chatguard_core::{Classification, Error, Message, Result};
use chatguard_stages::{Analyzer, AnalyzerKind, Assessment};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A configurable fake analyzer
pub struct MockAnalyzer {
    name: String,
    kind: AnalyzerKind,
    assessment: Assessment,
    simulated_latency: Option<Duration>,
    failures_before_success: u32,
    failure: fn(String) -> Error,
    call_count: AtomicU32,
}

impl MockAnalyzer {
    /// Analyzer answering `clean` with no confidence
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: AnalyzerKind::PrimaryModel,
            assessment: Assessment::clean("looks fine"),
            simulated_latency: None,
            failures_before_success: 0,
            failure: Error::TransientIo,
            call_count: AtomicU32::new(0),
        }
    }

    pub fn with_kind(mut self, kind: AnalyzerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Answer with a violation
    pub fn violation(mut self, reason: &str, confidence: f32) -> Self {
        self.assessment = Assessment::violation(reason, confidence);
        self
    }

    pub fn uncertain(mut self, reason: &str) -> Self {
        self.assessment = Assessment {
            classification: Classification::Uncertain,
            reason: reason.to_string(),
            confidence: None,
        };
        self
    }

    /// Set simulated latency for every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = Some(latency);
        self
    }

    /// Fail the first `count` calls with a network error
    pub fn failing_first(mut self, count: u32) -> Self {
        self.failures_before_success = count;
        self.failure = Error::TransientIo;
        self
    }

    /// Fail the first `count` calls with an unparseable reply
    pub fn malformed_first(mut self, count: u32) -> Self {
        self.failures_before_success = count;
        self.failure = Error::MalformedResponse;
        self
    }

    /// Fail every call with a permanent error
    pub fn always_rejecting(mut self) -> Self {
        self.failures_before_success = u32::MAX;
        self.failure = Error::Internal;
        self
    }

    /// Get the number of times evaluate was called
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn evaluate(&self, _message: &Message, _rules: &[String]) -> Result<Assessment> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.simulated_latency {
            tokio::time::sleep(latency).await;
        }

        if call < self.failures_before_success {
            return Err((self.failure)(format!("simulated failure #{}", call + 1)));
        }
        Ok(self.assessment.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AnalyzerKind {
        self.kind
    }
}

/// Dedup store whose reads always fail
pub struct UnreachableDedup;

#[async_trait]
impl DedupStore for UnreachableDedup {
    async fn try_mark_decided(&self, _message_id: &str) -> Result<bool> {
        Err(Error::transient("dedup store unreachable"))
    }

    async fn is_decided(&self, _message_id: &str) -> Result<bool> {
        Err(Error::transient("dedup store unreachable"))
    }

    async fn try_mark_reported(&self, _message_link: &str) -> Result<bool> {
        Err(Error::transient("dedup store unreachable"))
    }

    async fn is_reported(&self, _message_link: &str) -> Result<bool> {
        Err(Error::transient("dedup store unreachable"))
    }
}

pub fn message(id: &str, text: &str) -> Message {
    Message::new(id, -1001, 7, "mallory", text, format!("https://t.me/c/1001/{}", id))
}
