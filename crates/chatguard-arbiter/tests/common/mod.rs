//! Shared fixtures for arbiter and enforcement tests

#![allow(dead_code)]

use async_trait::async_trait;
use chatguard_arbiter::{Arbiter, ArbiterConfig, ArbiterContext, ArbiterWorker, EnforcementSink};
use chatguard_broker::{
    Broker, Delivery, MemoryBroker, MemoryDedupStore, MemoryRecordStore, MemoryVerdictStore,
    RecordStore, Topics,
};
use chatguard_core::{
    Classification, Decision, Error, Message, NegativeFinding, Result, RetryPolicy, Verdict,
};
use chatguard_telemetry::PipelineMetrics;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const STAGES: [&str; 3] = ["heuristic", "llm", "media"];

/// Memory-backed stores shared by every worker of one test pipeline
#[derive(Clone)]
pub struct Pipeline {
    pub broker: MemoryBroker,
    pub dedup: Arc<MemoryDedupStore>,
    pub verdicts: Arc<MemoryVerdictStore>,
    pub records: Arc<MemoryRecordStore>,
    pub topics: Topics,
    pub metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            dedup: Arc::new(MemoryDedupStore::new()),
            verdicts: Arc::new(MemoryVerdictStore::new()),
            records: Arc::new(MemoryRecordStore::new()),
            topics: Topics::new("test"),
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn context(&self, consumer: &str) -> ArbiterContext {
        ArbiterContext {
            broker: self.broker.for_consumer(consumer),
            dedup: self.dedup.clone(),
            verdicts: self.verdicts.clone(),
            records: self.records.clone(),
            topics: self.topics.clone(),
            retry: RetryPolicy::fixed(3, Duration::from_millis(5)),
            metrics: self.metrics.clone(),
        }
    }

    pub fn arbiter(&self, id: &str, config: ArbiterConfig) -> ArbiterWorker {
        ArbiterWorker::new(id, Arbiter::new(config), self.context(id))
            .with_poll_wait(Duration::from_millis(20))
    }

    /// Every payload currently waiting on the decisions topic
    pub async fn drain_decisions(&self) -> Vec<Decision> {
        let mut decisions = Vec::new();
        while let Some(delivery) = self
            .broker
            .pop(&self.topics.decisions(), Duration::from_millis(5))
            .await
            .unwrap()
        {
            self.broker.ack(&delivery).await.unwrap();
            decisions.push(serde_json::from_str(&delivery.payload).unwrap());
        }
        decisions
    }
}

pub fn config() -> ArbiterConfig {
    ArbiterConfig {
        expected_stages: STAGES.iter().map(|s| s.to_string()).collect(),
        ..ArbiterConfig::default()
    }
}

pub fn verdict(
    message_id: &str,
    stage: &str,
    classification: Classification,
    confidence: Option<f32>,
    reason: &str,
) -> Verdict {
    let mut verdict = Verdict::new(message_id, stage, classification, reason);
    verdict.confidence = confidence;
    verdict
}

pub fn message(id: &str) -> Message {
    Message::new(
        id,
        -1001,
        99,
        "spammer",
        "buy crypto now, join t.me/spam",
        format!("https://t.me/c/1001/{}", id),
    )
}

/// Sink recording every call; optionally failing the first few
pub struct RecordingSink {
    calls: AtomicU32,
    failures: u32,
    permanent: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures: 0,
            permanent: false,
        }
    }

    /// Fail the first `count` calls with a transient error
    pub fn failing_first(mut self, count: u32) -> Self {
        self.failures = count;
        self
    }

    /// Reject every call permanently
    pub fn rejecting(mut self) -> Self {
        self.failures = u32::MAX;
        self.permanent = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnforcementSink for RecordingSink {
    async fn enforce(&self, _decision: &Decision, _finding: &NegativeFinding) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(if self.permanent {
                Error::internal("moderator bot removed from chat")
            } else {
                Error::transient("moderator api timeout")
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Record store whose finding inserts fail while `outage` calls remain
pub struct FlakyRecords {
    inner: Arc<MemoryRecordStore>,
    outage: AtomicU32,
}

impl FlakyRecords {
    pub fn new(inner: Arc<MemoryRecordStore>, failed_inserts: u32) -> Self {
        Self {
            inner,
            outage: AtomicU32::new(failed_inserts),
        }
    }
}

fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RecordStore for FlakyRecords {
    async fn put_message(&self, message: &Message) -> Result<()> {
        self.inner.put_message(message).await
    }

    async fn message(&self, message_id: &str) -> Result<Option<Message>> {
        self.inner.message(message_id).await
    }

    async fn upsert_decision(&self, decision: &Decision) -> Result<()> {
        self.inner.upsert_decision(decision).await
    }

    async fn decision(&self, message_id: &str) -> Result<Option<Decision>> {
        self.inner.decision(message_id).await
    }

    async fn insert_finding(&self, finding: &NegativeFinding) -> Result<bool> {
        if take_failure(&self.outage) {
            return Err(Error::broker("record store connection reset"));
        }
        self.inner.insert_finding(finding).await
    }

    async fn finding(&self, message_link: &str) -> Result<Option<NegativeFinding>> {
        self.inner.finding(message_link).await
    }

    async fn findings(&self) -> Result<Vec<NegativeFinding>> {
        self.inner.findings().await
    }
}

/// Broker whose publishes to one topic fail while `outage` calls remain
pub struct FlakyBroker {
    inner: Arc<dyn Broker>,
    topic: String,
    outage: Arc<AtomicU32>,
}

impl FlakyBroker {
    pub fn new(inner: Arc<dyn Broker>, topic: impl Into<String>, failed_publishes: u32) -> Self {
        Self {
            inner,
            topic: topic.into(),
            outage: Arc::new(AtomicU32::new(failed_publishes)),
        }
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if topic == self.topic && take_failure(&self.outage) {
            return Err(Error::broker("connection refused"));
        }
        self.inner.publish(topic, payload).await
    }

    async fn pop(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        self.inner.pop(topic, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.ack(delivery).await
    }

    async fn recover(&self, topic: &str) -> Result<usize> {
        self.inner.recover(topic).await
    }

    async fn len(&self, topic: &str) -> Result<usize> {
        self.inner.len(topic).await
    }

    fn for_consumer(&self, consumer_id: &str) -> Arc<dyn Broker> {
        Arc::new(FlakyBroker {
            inner: self.inner.for_consumer(consumer_id),
            topic: self.topic.clone(),
            outage: Arc::clone(&self.outage),
        })
    }

    fn name(&self) -> &str {
        "flaky"
    }
}
