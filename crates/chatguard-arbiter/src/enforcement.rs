//! Enforcement worker
//!
//! Consumes decisions. Clean decisions are only logged. For violations the
//! worker claims `reported(link)`, records the negative finding, and calls
//! the sink. The claim comes first, so moderators hear about a link at most
//! once even when decisions are redelivered or several enforcers run.
//!
//! A claim whose finding was never recorded belongs to an enforcer that
//! crashed in between. When that enforcer gets the decision back through
//! recovery it finishes the report; the finding's link uniqueness keeps
//! the takeover exactly-once.

use crate::sink::EnforcementSink;
use chatguard_broker::{Broker, DedupStore, Delivery, RecordStore, Topics};
use chatguard_core::{Decision, Error, NegativeFinding, Result, RetryPolicy};
use chatguard_telemetry::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What the worker did with one decision
#[derive(Debug, Clone, PartialEq)]
pub enum EnforcementOutcome {
    /// Clean decision, nothing to do
    Ignored,

    /// Finding recorded and sink notified
    Reported(NegativeFinding),

    /// Finding recorded, but the sink kept failing
    SinkFailed(NegativeFinding),

    /// The link was already reported
    Duplicate,

    /// The decided message is unknown to the record store
    UnknownMessage,

    /// Payload could not be decoded
    Dropped,
}

/// Worker turning violation decisions into moderator reports
pub struct EnforcementWorker {
    id: String,
    broker: Arc<dyn Broker>,
    dedup: Arc<dyn DedupStore>,
    records: Arc<dyn RecordStore>,
    sink: Arc<dyn EnforcementSink>,
    topics: Topics,
    retry: RetryPolicy,
    poll_wait: Duration,
    metrics: PipelineMetrics,
}

impl EnforcementWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        broker: Arc<dyn Broker>,
        dedup: Arc<dyn DedupStore>,
        records: Arc<dyn RecordStore>,
        sink: Arc<dyn EnforcementSink>,
        topics: Topics,
        retry: RetryPolicy,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            id: id.into(),
            broker,
            dedup,
            records,
            sink,
            topics,
            retry,
            poll_wait: Duration::from_secs(1),
            metrics,
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Handle one decision delivery
    pub async fn process(&self, delivery: &Delivery) -> Result<EnforcementOutcome> {
        let decision: Decision = match serde_json::from_str(&delivery.payload) {
            Ok(decision) => decision,
            Err(e) => {
                error!(enforcer = %self.id, error = %e, payload = %delivery.payload, "Dropping undecodable decision");
                self.broker.ack(delivery).await?;
                return Ok(EnforcementOutcome::Dropped);
            }
        };

        let outcome = self.apply(&decision, delivery.is_redelivery()).await?;
        self.broker.ack(delivery).await?;
        Ok(outcome)
    }

    /// Apply one decision
    pub async fn enforce(&self, decision: &Decision) -> Result<EnforcementOutcome> {
        self.apply(decision, false).await
    }

    async fn apply(&self, decision: &Decision, redelivered: bool) -> Result<EnforcementOutcome> {
        if !decision.is_violation() {
            debug!(enforcer = %self.id, message_id = %decision.message_id, "Clean decision, no action");
            return Ok(EnforcementOutcome::Ignored);
        }

        let message_id = decision.message_id.as_str();
        let message = self
            .retry
            .run("load_message", |_| self.records.message(message_id))
            .await?;
        let Some(message) = message else {
            error!(enforcer = %self.id, message_id, "Violation for unknown message, cannot report");
            return Ok(EnforcementOutcome::UnknownMessage);
        };

        let link = message.link.as_str();
        let claimed = self
            .retry
            .run("claim_report", |_| self.dedup.try_mark_reported(link))
            .await?;
        if !claimed && !(redelivered && self.claim_orphaned(link).await?) {
            return Ok(self.duplicate(message_id, link));
        }
        if !claimed {
            warn!(enforcer = %self.id, message_id, link, "Finishing a report interrupted before its finding was stored");
        }

        let finding = NegativeFinding::new(decision, &message);
        let inserted = self
            .retry
            .run("store_finding", |_| self.records.insert_finding(&finding))
            .await?;
        if !inserted {
            if !claimed {
                return Ok(self.duplicate(message_id, link));
            }
            // Claim and record disagree only if the dedup store lost state
            warn!(enforcer = %self.id, message_id, link, "Finding already recorded for link");
        }

        let sink = self.sink.as_ref();
        match self
            .retry
            .run("enforcement_sink", |_| sink.enforce(decision, &finding))
            .await
        {
            Ok(()) => {
                self.metrics.record_enforcement(true);
                info!(enforcer = %self.id, message_id, link, sink = sink.name(), "Violation enforced");
                Ok(EnforcementOutcome::Reported(finding))
            }
            Err(e) => {
                self.metrics.record_enforcement(false);
                error!(
                    enforcer = %self.id,
                    message_id,
                    link,
                    sink = sink.name(),
                    error = %e,
                    "Enforcement sink failed; finding stays recorded"
                );
                Ok(EnforcementOutcome::SinkFailed(finding))
            }
        }
    }

    /// The link is claimed but no finding was ever stored for it
    async fn claim_orphaned(&self, link: &str) -> Result<bool> {
        let existing = self
            .retry
            .run("load_finding", |_| self.records.finding(link))
            .await?;
        Ok(existing.is_none())
    }

    fn duplicate(&self, message_id: &str, link: &str) -> EnforcementOutcome {
        info!(enforcer = %self.id, message_id, link, "Link already reported, skipping");
        self.metrics.record_duplicate_report();
        EnforcementOutcome::Duplicate
    }

    /// Pop at most one decision and handle it
    pub async fn run_once(&self) -> Result<Option<EnforcementOutcome>> {
        let topic = self.topics.decisions();
        let broker = self.broker.as_ref();
        let wait = self.poll_wait;

        let delivery = self
            .retry
            .run("broker_pop", |_| broker.pop(&topic, wait))
            .await
            .map_err(|e| Error::broker(e.to_string()))?;

        match delivery {
            Some(delivery) => self.process(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run until the shutdown flag flips
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self.broker.recover(&self.topics.decisions()).await?;
        info!(enforcer = %self.id, recovered, sink = self.sink.name(), "Enforcer started");

        while !*shutdown.borrow() {
            self.run_once().await?;
        }

        info!(enforcer = %self.id, "Enforcer stopped");
        Ok(())
    }
}
