//! Arbiter worker
//!
//! Pops verdicts, accumulates them in the verdict store, and commits a
//! decision once the policy allows. Commit order:
//! 1. claim `decided(message_id)` in the dedup store
//! 2. persist the decision
//! 3. publish it on the decisions topic
//! 4. drop the accumulated verdicts
//!
//! Only the worker that wins step 1 continues; every other arbiter sees
//! a duplicate and discards its copy.
//!
//! Verdicts still stored for a decided message mean a commit stopped
//! between steps 1 and 4. The arbiter that owned it finishes the commit
//! when its verdict comes back through recovery, and any arbiter does so
//! from the sweep once the entry is two windows old. Finishing republishes
//! the persisted decision, or decides again if none was persisted.
//! Enforcement is idempotent per link, so an extra copy is harmless.

use crate::policy::{Arbiter, Outcome, Ruling};
use chatguard_broker::{
    publish_with_retry, Broker, DedupStore, Delivery, PendingMessage, RecordStore, Topics,
    VerdictStore,
};
use chatguard_core::{Decision, Error, Result, RetryPolicy, Verdict};
use chatguard_telemetry::PipelineMetrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared state an arbiter worker coordinates through
#[derive(Clone)]
pub struct ArbiterContext {
    pub broker: Arc<dyn Broker>,
    pub dedup: Arc<dyn DedupStore>,
    pub verdicts: Arc<dyn VerdictStore>,
    pub records: Arc<dyn RecordStore>,
    pub topics: Topics,
    pub retry: RetryPolicy,
    pub metrics: PipelineMetrics,
}

/// Worker applying the [`Arbiter`] policy to the verdict stream
pub struct ArbiterWorker {
    id: String,
    policy: Arbiter,
    ctx: ArbiterContext,
    poll_wait: Duration,
}

impl ArbiterWorker {
    pub fn new(id: impl Into<String>, policy: Arbiter, ctx: ArbiterContext) -> Self {
        Self {
            id: id.into(),
            policy,
            ctx,
            poll_wait: Duration::from_secs(1),
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one verdict delivery at time `now`. Returns the decision if
    /// this worker committed one.
    pub async fn process(&self, delivery: &Delivery, now: DateTime<Utc>) -> Result<Option<Decision>> {
        let verdict: Verdict = match serde_json::from_str(&delivery.payload) {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(arbiter = %self.id, error = %e, payload = %delivery.payload, "Dropping undecodable verdict");
                self.ctx.broker.ack(delivery).await?;
                return Ok(None);
            }
        };

        let decision = self.fold(&verdict, now, delivery.is_redelivery()).await?;
        self.ctx.broker.ack(delivery).await?;
        Ok(decision)
    }

    /// Fold one verdict into its message's state and decide if possible
    pub async fn handle_verdict(&self, verdict: &Verdict, now: DateTime<Utc>) -> Result<Option<Decision>> {
        self.fold(verdict, now, false).await
    }

    async fn fold(&self, verdict: &Verdict, now: DateTime<Utc>, redelivered: bool) -> Result<Option<Decision>> {
        let message_id = verdict.message_id.as_str();

        if self.is_decided(message_id).await? {
            if redelivered {
                if let Some(pending) = self.ctx.verdicts.load(message_id).await? {
                    return self.resume(&pending, now).await;
                }
            }
            debug!(
                arbiter = %self.id,
                message_id,
                stage = %verdict.stage_name,
                "Late verdict for decided message, ignoring"
            );
            return Ok(None);
        }

        let pending = self
            .ctx
            .retry
            .run("verdict_upsert", |_| self.ctx.verdicts.upsert(verdict, now))
            .await?;

        debug!(
            arbiter = %self.id,
            message_id,
            stage = %verdict.stage_name,
            classification = %verdict.classification,
            received = pending.verdicts.len(),
            "Verdict recorded"
        );

        self.decide(&pending, now, false).await
    }

    /// Decide every pending message whose window has elapsed by `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Decision>> {
        let window = chrono::Duration::from_std(self.policy.config().window())
            .map_err(|e| Error::config(format!("arbitration window out of range: {}", e)))?;
        let stale = now - window * 2;

        let due = self
            .ctx
            .retry
            .run("verdict_sweep", |_| self.ctx.verdicts.pending_since(now - window))
            .await?;

        let mut decisions = Vec::new();
        for message_id in due {
            let Some(pending) = self.ctx.verdicts.load(&message_id).await? else {
                continue;
            };
            let decision = if self.is_decided(&message_id).await? {
                if pending.first_seen > stale {
                    // The owner may still be committing
                    continue;
                }
                self.resume(&pending, now).await?
            } else {
                self.decide(&pending, now, true).await?
            };
            if let Some(decision) = decision {
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    async fn decide(
        &self,
        pending: &PendingMessage,
        now: DateTime<Utc>,
        from_sweep: bool,
    ) -> Result<Option<Decision>> {
        let elapsed = (now - pending.first_seen).to_std().unwrap_or(Duration::ZERO);

        match self.policy.evaluate(&pending.verdicts, elapsed) {
            Ruling::Pending => Ok(None),
            Ruling::Decide(outcome) => {
                if from_sweep {
                    let timeout = Error::ArbitrationTimeout(pending.message_id.clone());
                    warn!(
                        arbiter = %self.id,
                        message_id = %pending.message_id,
                        missing = ?self.policy.missing_stages(&pending.verdicts),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "{}", timeout
                    );
                    self.ctx.metrics.record_arbitration_timeout();
                }

                match self.commit(&pending.message_id, outcome, now).await {
                    Ok(decision) => Ok(Some(decision)),
                    Err(Error::DuplicateDecision(message_id)) => {
                        info!(arbiter = %self.id, message_id = %message_id, "Decision already committed elsewhere, discarding");
                        self.ctx.metrics.record_duplicate_decision();
                        self.ctx.verdicts.clear(&message_id).await?;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Commit an outcome exactly once per message
    pub async fn commit(&self, message_id: &str, outcome: Outcome, now: DateTime<Utc>) -> Result<Decision> {
        let claimed = self
            .ctx
            .retry
            .run("claim_decision", |_| self.ctx.dedup.try_mark_decided(message_id))
            .await?;
        if !claimed {
            return Err(Error::DuplicateDecision(message_id.to_string()));
        }

        let decision = outcome.into_decision(message_id, now);

        self.ctx
            .retry
            .run("store_decision", |_| self.ctx.records.upsert_decision(&decision))
            .await?;

        self.publish(&decision).await?;

        info!(
            arbiter = %self.id,
            message_id,
            decision = %decision.final_classification,
            reason = %decision.combined_reason,
            stages = ?decision.contributing_stages,
            "Decision committed"
        );
        Ok(decision)
    }

    /// Finish a commit that claimed `decided` but never dropped its verdicts
    async fn resume(&self, pending: &PendingMessage, now: DateTime<Utc>) -> Result<Option<Decision>> {
        let message_id = pending.message_id.as_str();
        let stored = self
            .ctx
            .retry
            .run("load_decision", |_| self.ctx.records.decision(message_id))
            .await?;

        let decision = match stored {
            Some(decision) => decision,
            None => {
                let elapsed = (now - pending.first_seen).to_std().unwrap_or(Duration::ZERO);
                let Ruling::Decide(outcome) = self.policy.evaluate(&pending.verdicts, elapsed) else {
                    debug!(arbiter = %self.id, message_id, "Interrupted commit not decidable yet");
                    return Ok(None);
                };
                let decision = outcome.into_decision(message_id, now);
                self.ctx
                    .retry
                    .run("store_decision", |_| self.ctx.records.upsert_decision(&decision))
                    .await?;
                decision
            }
        };

        warn!(
            arbiter = %self.id,
            message_id,
            decision = %decision.final_classification,
            "Finishing interrupted commit"
        );
        self.publish(&decision).await?;
        Ok(Some(decision))
    }

    /// Steps 3 and 4 of a commit
    async fn publish(&self, decision: &Decision) -> Result<()> {
        let payload = serde_json::to_string(decision)?;
        publish_with_retry(
            self.ctx.broker.as_ref(),
            &self.ctx.retry,
            &self.ctx.topics.decisions(),
            &payload,
        )
        .await?;

        self.ctx.verdicts.clear(&decision.message_id).await?;
        self.ctx.metrics.record_decision(decision.is_violation());
        Ok(())
    }

    async fn is_decided(&self, message_id: &str) -> Result<bool> {
        self.ctx
            .retry
            .run("check_decided", |_| self.ctx.dedup.is_decided(message_id))
            .await
    }

    async fn pop(&self) -> Result<Option<Delivery>> {
        let topic = self.ctx.topics.verdicts();
        let broker = self.ctx.broker.as_ref();
        let wait = self.poll_wait;

        self.ctx
            .retry
            .run("broker_pop", |_| broker.pop(&topic, wait))
            .await
            .map_err(|e| Error::broker(e.to_string()))
    }

    /// Pop at most one verdict and handle it
    pub async fn run_once(&self) -> Result<Option<Decision>> {
        match self.pop().await? {
            Some(delivery) => self.process(&delivery, Utc::now()).await,
            None => Ok(None),
        }
    }

    /// Run until the shutdown flag flips. Pending windows are swept whenever
    /// the topic is idle and at least once per sweep interval.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self.ctx.broker.recover(&self.ctx.topics.verdicts()).await?;
        info!(arbiter = %self.id, recovered, broker = self.ctx.broker.name(), "Arbiter started");

        let sweep_interval = self.policy.config().sweep_interval();
        let mut next_sweep = Instant::now() + sweep_interval;

        while !*shutdown.borrow() {
            let idle = match self.pop().await? {
                Some(delivery) => {
                    self.process(&delivery, Utc::now()).await?;
                    false
                }
                None => true,
            };

            if idle || Instant::now() >= next_sweep {
                self.sweep(Utc::now()).await?;
                next_sweep = Instant::now() + sweep_interval;
            }
        }

        info!(arbiter = %self.id, "Arbiter stopped");
        Ok(())
    }
}
