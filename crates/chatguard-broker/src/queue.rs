//! Topic-based queue transport
//!
//! Topics are durable, ordered, at-least-once channels. A pop hands out a
//! [`Delivery`] that stays in the consumer's in-flight list until it is
//! acknowledged; a consumer that crashes before acking gets the delivery
//! back through [`Broker::recover`] on restart. Every recovery bumps the
//! payload's redelivery count, which the next pop reports.

use async_trait::async_trait;
use chatguard_core::{Error, Result, RetryPolicy};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

/// A payload popped from a topic, pending acknowledgement
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the payload came from
    pub topic: String,

    /// Raw JSON payload
    pub payload: String,

    /// Times this payload came back through [`Broker::recover`]
    pub redeliveries: u32,

    /// Backend-specific handle used to acknowledge
    pub(crate) receipt: String,
}

impl Delivery {
    pub(crate) fn new(topic: impl Into<String>, payload: String, receipt: String) -> Self {
        Self {
            topic: topic.into(),
            payload,
            redeliveries: 0,
            receipt,
        }
    }

    pub(crate) fn with_redeliveries(mut self, redeliveries: u32) -> Self {
        self.redeliveries = redeliveries;
        self
    }

    /// Whether a consumer crashed while holding this payload before
    pub fn is_redelivery(&self) -> bool {
        self.redeliveries > 0
    }
}

/// Queue broker contract
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a payload to the tail of a topic
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Take the head of a topic, waiting at most `wait`. `None` is not an error.
    async fn pop(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Mark a delivery as processed
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Replace a delivery with a new payload on the same topic
    async fn requeue(&self, delivery: &Delivery, payload: &str) -> Result<()> {
        self.publish(&delivery.topic, payload).await?;
        self.ack(delivery).await
    }

    /// Move this consumer's unacknowledged deliveries back onto the topic,
    /// counting one more redelivery for each
    async fn recover(&self, topic: &str) -> Result<usize>;

    /// Number of payloads waiting on a topic
    async fn len(&self, topic: &str) -> Result<usize>;

    /// A handle for another consumer sharing the same underlying queues
    fn for_consumer(&self, consumer_id: &str) -> Arc<dyn Broker>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Publish with the bounded backoff; exhaustion is fatal for the caller.
pub async fn publish_with_retry(
    broker: &dyn Broker,
    retry: &RetryPolicy,
    topic: &str,
    payload: &str,
) -> Result<()> {
    retry
        .run("broker_publish", move |_| broker.publish(topic, payload))
        .await
        .map_err(|e| {
            error!(topic, broker = broker.name(), error = %e, "Publish retries exhausted");
            match e {
                Error::BrokerUnavailable(_) => e,
                other => Error::broker(other.to_string()),
            }
        })
}

/// Topic naming for one pipeline deployment
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Input topic of an analysis stage
    pub fn stage(&self, stage_name: &str) -> String {
        format!("{}:stage:{}", self.prefix, stage_name)
    }

    /// Arbiter input
    pub fn verdicts(&self) -> String {
        format!("{}:verdicts", self.prefix)
    }

    /// Enforcement input
    pub fn decisions(&self) -> String {
        format!("{}:decisions", self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("chatguard")
    }
}

/// In-process broker.
///
/// Not durable across process restarts; used by tests and single-node runs.
/// Handles created with [`Broker::for_consumer`] share the queues but keep
/// separate in-flight bookkeeping.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<MemoryShared>,
    consumer: String,
}

struct MemoryShared {
    state: Mutex<MemoryQueues>,
    notify: Notify,
    next_receipt: AtomicU64,
}

#[derive(Default)]
struct MemoryQueues {
    topics: HashMap<String, VecDeque<Queued>>,
    in_flight: HashMap<String, InFlight>,
}

struct Queued {
    payload: String,
    redeliveries: u32,
}

struct InFlight {
    topic: String,
    payload: String,
    redeliveries: u32,
    consumer: String,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                state: Mutex::new(MemoryQueues::default()),
                notify: Notify::new(),
                next_receipt: AtomicU64::new(1),
            }),
            consumer: "default".to_string(),
        }
    }

    /// Number of unacknowledged deliveries across all consumers
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    fn try_pop(&self, topic: &str) -> Option<Delivery> {
        let mut state = self.shared.state.lock();
        let Queued {
            payload,
            redeliveries,
        } = state.topics.get_mut(topic)?.pop_front()?;

        let receipt = self
            .shared
            .next_receipt
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        state.in_flight.insert(
            receipt.clone(),
            InFlight {
                topic: topic.to_string(),
                payload: payload.clone(),
                redeliveries,
                consumer: self.consumer.clone(),
            },
        );

        Some(Delivery::new(topic, payload, receipt).with_redeliveries(redeliveries))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.shared
            .state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(Queued {
                payload: payload.to_string(),
                redeliveries: 0,
            });
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so a publish in between is not missed.
            let notified = self.shared.notify.notified();

            if let Some(delivery) = self.try_pop(topic) {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(topic));
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.shared.state.lock().in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn recover(&self, topic: &str) -> Result<usize> {
        let mut state = self.shared.state.lock();

        let mut receipts: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.topic == topic && f.consumer == self.consumer)
            .filter_map(|(receipt, _)| receipt.parse().ok())
            .collect();
        receipts.sort_unstable();

        let count = receipts.len();
        // Oldest delivery ends up at the head again
        for receipt in receipts.into_iter().rev() {
            if let Some(flight) = state.in_flight.remove(&receipt.to_string()) {
                state
                    .topics
                    .entry(flight.topic)
                    .or_default()
                    .push_front(Queued {
                        payload: flight.payload,
                        redeliveries: flight.redeliveries.saturating_add(1),
                    });
            }
        }
        drop(state);

        if count > 0 {
            debug!(topic, consumer = %self.consumer, count, "Recovered in-flight deliveries");
            self.shared.notify.notify_waiters();
        }
        Ok(count)
    }

    async fn len(&self, topic: &str) -> Result<usize> {
        Ok(self
            .shared
            .state
            .lock()
            .topics
            .get(topic)
            .map_or(0, VecDeque::len))
    }

    fn for_consumer(&self, consumer_id: &str) -> Arc<dyn Broker> {
        Arc::new(Self {
            shared: Arc::clone(&self.shared),
            consumer: consumer_id.to_string(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
