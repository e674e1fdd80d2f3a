//! Analysis stage worker
//!
//! One stage consumes `<prefix>:stage:<name>`, runs its analyzer, and
//! publishes exactly one verdict per delivery onto `<prefix>:verdicts`.
//! The delivery is acknowledged only after the verdict is published, so a
//! crash in between causes a redelivery and, at worst, a duplicate verdict
//! that the arbiter upserts away.
//!
//! An envelope's attempt counter grows with every requeue and every crash
//! redelivery, so a payload that keeps killing the worker eventually gets
//! an `uncertain` verdict instead of another analyzer call.

use crate::analyzer::Analyzer;
use chatguard_broker::{publish_with_retry, Broker, DedupStore, Delivery, Topics};
use chatguard_core::retry::with_timeout;
use chatguard_core::{Error, Result, RetryPolicy, StageEnvelope, Verdict};
use chatguard_telemetry::PipelineMetrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Tuning for a stage worker
#[derive(Debug, Clone)]
pub struct StageSettings {
    /// Backoff around each analyzer call
    pub retry: RetryPolicy,

    /// Deadline for a single analyzer call
    pub call_timeout: Duration,

    /// Bounded wait of each pop
    pub poll_wait: Duration,

    /// Envelopes delivered this many times get an `uncertain` verdict
    /// without calling the analyzer
    pub max_deliveries: u32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
            poll_wait: Duration::from_secs(1),
            max_deliveries: 5,
        }
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// A verdict was published
    Published(Verdict),

    /// The message already has a decision
    SkippedDecided,

    /// The payload could not be decoded and was discarded
    Dropped,

    /// Put back with a bumped attempt counter
    Requeued,
}

/// Worker wrapping one analyzer
pub struct AnalysisStage {
    name: String,
    analyzer: Arc<dyn Analyzer>,
    broker: Arc<dyn Broker>,
    dedup: Arc<dyn DedupStore>,
    topics: Topics,
    settings: StageSettings,
    metrics: PipelineMetrics,
}

impl AnalysisStage {
    /// Create a stage named after its analyzer
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        broker: Arc<dyn Broker>,
        dedup: Arc<dyn DedupStore>,
        topics: Topics,
        settings: StageSettings,
    ) -> Self {
        Self {
            name: analyzer.name().to_string(),
            analyzer,
            broker,
            dedup,
            topics,
            settings,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Report into a shared metrics collector
    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_topic(&self) -> String {
        self.topics.stage(&self.name)
    }

    /// Produce this stage's verdict for an envelope. Never fails: capability
    /// errors surviving the retry budget become an `uncertain` verdict.
    pub async fn evaluate(&self, envelope: &StageEnvelope) -> Verdict {
        let message = &envelope.message;
        let start = Instant::now();

        let verdict = if envelope.attempt >= self.settings.max_deliveries {
            warn!(
                stage = %self.name,
                message_id = %message.message_id,
                attempt = envelope.attempt,
                "Delivery budget exhausted"
            );
            self.metrics.record_stage_failure(&self.name);
            Verdict::uncertain(&message.message_id, &self.name, "delivery budget exhausted")
        } else {
            let call_timeout = self.settings.call_timeout;
            let result = self
                .settings
                .retry
                .run(&self.name, |attempt| {
                    debug!(stage = %self.name, message_id = %message.message_id, attempt, "Calling analyzer");
                    with_timeout(
                        call_timeout,
                        &self.name,
                        self.analyzer.evaluate(message, &envelope.rules),
                    )
                })
                .await;

            match result {
                Ok(assessment) => {
                    let mut verdict = Verdict::new(
                        &message.message_id,
                        &self.name,
                        assessment.classification,
                        assessment.reason,
                    );
                    verdict.confidence = assessment.confidence;
                    verdict
                }
                Err(e) => {
                    warn!(
                        stage = %self.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Analyzer failed, reporting uncertain"
                    );
                    self.metrics.record_stage_failure(&self.name);
                    Verdict::uncertain(&message.message_id, &self.name, format!("analysis failed: {}", e))
                }
            }
        };

        let verdict = verdict.with_attempt(envelope.attempt);
        self.metrics.record_verdict(
            &self.name,
            verdict.classification.as_str(),
            start.elapsed().as_micros() as u64,
        );
        verdict
    }

    /// Handle one delivery from the input topic
    pub async fn process(&self, delivery: &Delivery) -> Result<StageOutcome> {
        let mut envelope: StageEnvelope = match serde_json::from_str(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(stage = %self.name, error = %e, payload = %delivery.payload, "Dropping undecodable envelope");
                self.broker.ack(delivery).await?;
                return Ok(StageOutcome::Dropped);
            }
        };
        if delivery.is_redelivery() {
            envelope.attempt = envelope.attempt.saturating_add(delivery.redeliveries);
            warn!(
                stage = %self.name,
                message_id = %envelope.message.message_id,
                redeliveries = delivery.redeliveries,
                attempt = envelope.attempt,
                "Envelope redelivered after a crash"
            );
        }
        let message_id = envelope.message.message_id.as_str();

        if envelope.attempt < self.settings.max_deliveries {
            match self.dedup.is_decided(message_id).await {
                Ok(true) => {
                    debug!(stage = %self.name, message_id, "Already decided, skipping");
                    self.broker.ack(delivery).await?;
                    return Ok(StageOutcome::SkippedDecided);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(stage = %self.name, message_id, error = %e, "Dedup lookup failed, requeueing");
                    let next = serde_json::to_string(&envelope.next_attempt())?;
                    self.broker.requeue(delivery, &next).await?;
                    return Ok(StageOutcome::Requeued);
                }
            }
        }

        let verdict = self.evaluate(&envelope).await;
        let payload = serde_json::to_string(&verdict)?;
        publish_with_retry(
            self.broker.as_ref(),
            &self.settings.retry,
            &self.topics.verdicts(),
            &payload,
        )
        .await?;
        self.broker.ack(delivery).await?;

        info!(
            stage = %self.name,
            message_id,
            classification = %verdict.classification,
            confidence = ?verdict.confidence,
            "Verdict published"
        );
        Ok(StageOutcome::Published(verdict))
    }

    /// Pop and handle at most one delivery
    pub async fn run_once(&self) -> Result<Option<StageOutcome>> {
        let topic = self.input_topic();
        let wait = self.settings.poll_wait;
        let broker = self.broker.as_ref();

        let delivery = self
            .settings
            .retry
            .run("broker_pop", |_| broker.pop(&topic, wait))
            .await
            .map_err(|e| Error::broker(e.to_string()))?;

        match delivery {
            Some(delivery) => self.process(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Put back deliveries this consumer left unacknowledged
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.broker.recover(&self.input_topic()).await?;
        if recovered > 0 {
            info!(stage = %self.name, recovered, "Recovered unacknowledged deliveries");
        }
        Ok(recovered)
    }

    /// Run until the shutdown flag flips. Broker failures past the retry
    /// budget end the loop with an error.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;
        info!(stage = %self.name, topic = %self.input_topic(), broker = self.broker.name(), "Stage started");

        while !*shutdown.borrow() {
            self.run_once().await?;
        }

        info!(stage = %self.name, "Stage stopped");
        Ok(())
    }
}
