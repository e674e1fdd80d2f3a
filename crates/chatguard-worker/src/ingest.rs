//! Message ingestion: persist, then fan out to every stage topic

use chatguard_broker::{publish_with_retry, Broker, DedupStore, RecordStore, Topics};
use chatguard_core::{Message, Result, RetryPolicy, StageEnvelope};
use chatguard_telemetry::PipelineMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Body of `POST /v1/messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub message: Message,

    /// Chat rules for the model stages; falls back to the configured defaults
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Envelopes published to these stage topics
    Queued { topics: Vec<String> },

    /// A decision already exists; nothing was queued
    AlreadyDecided,
}

/// Entry point of the pipeline
pub struct Ingestor {
    broker: Arc<dyn Broker>,
    dedup: Arc<dyn DedupStore>,
    records: Arc<dyn RecordStore>,
    topics: Topics,
    stage_names: Vec<String>,
    default_rules: Vec<String>,
    retry: RetryPolicy,
    metrics: PipelineMetrics,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        dedup: Arc<dyn DedupStore>,
        records: Arc<dyn RecordStore>,
        topics: Topics,
        stage_names: Vec<String>,
        default_rules: Vec<String>,
        retry: RetryPolicy,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            broker,
            dedup,
            records,
            topics,
            stage_names,
            default_rules,
            retry,
            metrics,
        }
    }

    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Topics whose depth is worth reporting
    pub fn watched_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .stage_names
            .iter()
            .map(|name| self.topics.stage(name))
            .collect();
        topics.push(self.topics.verdicts());
        topics.push(self.topics.decisions());
        topics
    }

    pub fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    /// Queue a message for every stage.
    ///
    /// The message record is written before any envelope so the enforcer can
    /// always find the link of a decided message. Resubmitting a queued but
    /// undecided message publishes it again; stages and the arbiter absorb
    /// the duplicates.
    pub async fn submit(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let message_id = request.message.message_id.clone();

        let decided = self
            .retry
            .run("check_decided", |_| self.dedup.is_decided(&message_id))
            .await?;
        if decided {
            debug!(message_id = %message_id, "Message already decided, not queueing");
            return Ok(IngestOutcome::AlreadyDecided);
        }

        self.retry
            .run("store_message", |_| self.records.put_message(&request.message))
            .await?;

        let rules = if request.rules.is_empty() {
            self.default_rules.clone()
        } else {
            request.rules
        };
        let payload = serde_json::to_string(&StageEnvelope::new(request.message, rules))?;

        let mut topics = Vec::with_capacity(self.stage_names.len());
        for stage in &self.stage_names {
            let topic = self.topics.stage(stage);
            publish_with_retry(self.broker.as_ref(), &self.retry, &topic, &payload).await?;
            topics.push(topic);
        }

        self.metrics.record_ingested();
        info!(message_id = %message_id, stages = topics.len(), "Message queued for analysis");
        Ok(IngestOutcome::Queued { topics })
    }
}
