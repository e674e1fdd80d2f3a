//! Redis implementations of the broker and stores
//!
//! Key layout (prefix defaults to `chatguard`):
//! - topics: lists named by [`Topics`](crate::Topics)
//! - in-flight: `<topic>:processing:<consumer>` lists
//! - redelivery counts: hash `<topic>:redeliveries` (field = sha256(payload))
//! - dedup: `<prefix>:decided:<message_id>`, `<prefix>:reported:<sha256(link)>`
//! - verdicts: hash `<prefix>:verdicts:<message_id>` (field = stage name),
//!   sorted set `<prefix>:pending` scored by first-seen milliseconds
//! - records: hashes `<prefix>:messages`, `<prefix>:decisions`, `<prefix>:findings`

use crate::dedup::{link_key, DedupStore};
use crate::queue::{Broker, Delivery};
use crate::records::RecordStore;
use crate::verdict_store::{PendingMessage, VerdictStore};
use async_trait::async_trait;
use chatguard_core::{Decision, Error, Message, NegativeFinding, Result, Verdict, VerdictSet};
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn redis_err(e: redis::RedisError) -> Error {
    Error::broker(e.to_string())
}

/// Shared connection state for all Redis-backed components
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    manager: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect to Redis and verify the connection
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::config(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(redis_err)?;

        let backend = Self {
            client,
            manager,
            prefix: prefix.into(),
        };
        backend.ping().await?;
        info!(prefix = %backend.prefix, "Connected to redis");
        Ok(backend)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    /// Broker handle owned by one consumer
    pub fn broker(&self, consumer_id: &str) -> RedisBroker {
        RedisBroker {
            client: self.client.clone(),
            manager: self.manager.clone(),
            consumer: consumer_id.to_string(),
            blocking: Mutex::new(None),
        }
    }

    pub fn dedup(&self, decided_ttl: Option<Duration>) -> RedisDedupStore {
        RedisDedupStore {
            manager: self.manager.clone(),
            prefix: self.prefix.clone(),
            decided_ttl,
        }
    }

    pub fn verdicts(&self) -> RedisVerdictStore {
        RedisVerdictStore {
            manager: self.manager.clone(),
            prefix: self.prefix.clone(),
        }
    }

    pub fn records(&self) -> RedisRecordStore {
        RedisRecordStore {
            manager: self.manager.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

/// Redis list broker.
///
/// Pops use `BLMOVE` into a per-consumer processing list on a dedicated
/// connection, so a blocked pop never stalls the shared multiplexed
/// connection used for everything else.
pub struct RedisBroker {
    client: Client,
    manager: ConnectionManager,
    consumer: String,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    fn processing_list(&self, topic: &str) -> String {
        processing_key(topic, &self.consumer)
    }
}

fn processing_key(topic: &str, consumer: &str) -> String {
    format!("{}:processing:{}", topic, consumer)
}

fn redeliveries_key(topic: &str) -> String {
    format!("{}:redeliveries", topic)
}

fn payload_digest(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("RPUSH")
            .arg(topic)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn pop(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        let mut slot = self.blocking.lock().await;
        if slot.is_none() {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(redis_err)?;
            *slot = Some(conn);
        }

        let processing = self.processing_list(topic);
        // A zero timeout would block forever
        let wait_secs = wait.as_secs_f64().max(0.01);

        let result = match slot.as_mut() {
            Some(conn) => {
                redis::cmd("BLMOVE")
                    .arg(topic)
                    .arg(&processing)
                    .arg("LEFT")
                    .arg("RIGHT")
                    .arg(wait_secs)
                    .query_async::<_, Option<String>>(conn)
                    .await
            }
            None => return Err(Error::internal("blocking connection missing")),
        };

        let payload = match result {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(e) => {
                // Drop the connection; the next pop reconnects
                *slot = None;
                return Err(redis_err(e));
            }
        };
        drop(slot);

        let mut conn = self.manager.clone();
        let redeliveries: Option<u32> = redis::cmd("HGET")
            .arg(redeliveries_key(topic))
            .arg(payload_digest(&payload))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(Some(
            Delivery::new(topic, payload, processing).with_redeliveries(redeliveries.unwrap_or(0)),
        ))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.manager.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&delivery.receipt)
            .arg(1)
            .arg(&delivery.payload)
            .cmd("HDEL")
            .arg(redeliveries_key(&delivery.topic))
            .arg(payload_digest(&delivery.payload))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if removed == 0 {
            debug!(topic = %delivery.topic, "Ack found nothing in the processing list");
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(&delivery.topic)
            .arg(payload)
            .ignore()
            .cmd("LREM")
            .arg(&delivery.receipt)
            .arg(1)
            .arg(&delivery.payload)
            .ignore()
            .cmd("HDEL")
            .arg(redeliveries_key(&delivery.topic))
            .arg(payload_digest(&delivery.payload))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn recover(&self, topic: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        let processing = self.processing_list(topic);
        let mut count = 0;

        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&processing)
                .arg(topic)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            let Some(payload) = moved else {
                break;
            };
            redis::cmd("HINCRBY")
                .arg(redeliveries_key(topic))
                .arg(payload_digest(&payload))
                .arg(1)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(redis_err)?;
            count += 1;
        }

        if count > 0 {
            warn!(topic, consumer = %self.consumer, count, "Recovered unacknowledged deliveries");
        }
        Ok(count)
    }

    async fn len(&self, topic: &str) -> Result<usize> {
        let mut conn = self.manager.clone();
        redis::cmd("LLEN")
            .arg(topic)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }

    fn for_consumer(&self, consumer_id: &str) -> Arc<dyn Broker> {
        Arc::new(RedisBroker {
            client: self.client.clone(),
            manager: self.manager.clone(),
            consumer: consumer_id.to_string(),
            blocking: Mutex::new(None),
        })
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// `SET NX` based dedup store
pub struct RedisDedupStore {
    manager: ConnectionManager,
    prefix: String,
    decided_ttl: Option<Duration>,
}

impl RedisDedupStore {
    fn decided_key(&self, message_id: &str) -> String {
        format!("{}:decided:{}", self.prefix, message_id)
    }

    fn reported_key(&self, message_link: &str) -> String {
        format!("{}:reported:{}", self.prefix, link_key(message_link))
    }

    async fn set_nx(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(Utc::now().timestamp_millis()).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(count > 0)
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn try_mark_decided(&self, message_id: &str) -> Result<bool> {
        self.set_nx(&self.decided_key(message_id), self.decided_ttl).await
    }

    async fn is_decided(&self, message_id: &str) -> Result<bool> {
        self.exists(&self.decided_key(message_id)).await
    }

    async fn try_mark_reported(&self, message_link: &str) -> Result<bool> {
        // Reports must survive restarts indefinitely: no TTL
        self.set_nx(&self.reported_key(message_link), None).await
    }

    async fn is_reported(&self, message_link: &str) -> Result<bool> {
        self.exists(&self.reported_key(message_link)).await
    }
}

/// Hash + sorted-set verdict store
pub struct RedisVerdictStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisVerdictStore {
    fn verdicts_key(&self, message_id: &str) -> String {
        format!("{}:verdicts:{}", self.prefix, message_id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }
}

fn decode_pending(
    message_id: &str,
    fields: HashMap<String, String>,
    first_seen_ms: Option<f64>,
) -> Result<Option<PendingMessage>> {
    let Some(first_seen_ms) = first_seen_ms else {
        return Ok(None);
    };

    let verdicts = fields
        .values()
        .map(|raw| serde_json::from_str::<Verdict>(raw))
        .collect::<std::result::Result<VerdictSet, _>>()?;

    let first_seen = DateTime::from_timestamp_millis(first_seen_ms as i64)
        .ok_or_else(|| Error::internal(format!("bad first-seen timestamp for {}", message_id)))?;

    Ok(Some(PendingMessage {
        message_id: message_id.to_string(),
        first_seen,
        verdicts,
    }))
}

#[async_trait]
impl VerdictStore for RedisVerdictStore {
    async fn upsert(&self, verdict: &Verdict, now: DateTime<Utc>) -> Result<PendingMessage> {
        let mut conn = self.manager.clone();
        let key = self.verdicts_key(&verdict.message_id);
        let payload = serde_json::to_string(verdict)?;

        let (fields, first_seen): (HashMap<String, String>, Option<f64>) = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(&verdict.stage_name)
            .arg(&payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.pending_key())
            .arg("NX")
            .arg(now.timestamp_millis())
            .arg(&verdict.message_id)
            .ignore()
            .cmd("HGETALL")
            .arg(&key)
            .cmd("ZSCORE")
            .arg(self.pending_key())
            .arg(&verdict.message_id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        decode_pending(&verdict.message_id, fields, first_seen)?
            .ok_or_else(|| Error::internal("pending entry vanished during upsert"))
    }

    async fn load(&self, message_id: &str) -> Result<Option<PendingMessage>> {
        let mut conn = self.manager.clone();
        let (fields, first_seen): (HashMap<String, String>, Option<f64>) = redis::pipe()
            .cmd("HGETALL")
            .arg(self.verdicts_key(message_id))
            .cmd("ZSCORE")
            .arg(self.pending_key())
            .arg(message_id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        decode_pending(message_id, fields, first_seen)
    }

    async fn pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(self.pending_key())
            .arg("-inf")
            .arg(cutoff.timestamp_millis())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn clear(&self, message_id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.verdicts_key(message_id))
            .ignore()
            .cmd("ZREM")
            .arg(self.pending_key())
            .arg(message_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }
}

/// Hash-backed record store
pub struct RedisRecordStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisRecordStore {
    fn key(&self, table: &str) -> String {
        format!("{}:{}", self.prefix, table)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, table: &str, field: &str) -> Result<Option<T>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key(table))
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        raw.map(|r| serde_json::from_str(&r).map_err(Error::from))
            .transpose()
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("HSETNX")
            .arg(self.key("messages"))
            .arg(&message.message_id)
            .arg(serde_json::to_string(message)?)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn message(&self, message_id: &str) -> Result<Option<Message>> {
        self.get_json("messages", message_id).await
    }

    async fn upsert_decision(&self, decision: &Decision) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("HSET")
            .arg(self.key("decisions"))
            .arg(&decision.message_id)
            .arg(serde_json::to_string(decision)?)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn decision(&self, message_id: &str) -> Result<Option<Decision>> {
        self.get_json("decisions", message_id).await
    }

    async fn insert_finding(&self, finding: &NegativeFinding) -> Result<bool> {
        let mut conn = self.manager.clone();
        let inserted: i64 = redis::cmd("HSETNX")
            .arg(self.key("findings"))
            .arg(link_key(&finding.message_link))
            .arg(serde_json::to_string(finding)?)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(inserted == 1)
    }

    async fn finding(&self, message_link: &str) -> Result<Option<NegativeFinding>> {
        self.get_json("findings", &link_key(message_link)).await
    }

    async fn findings(&self) -> Result<Vec<NegativeFinding>> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.key("findings"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut findings = raw
            .iter()
            .map(|r| serde_json::from_str::<NegativeFinding>(r))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        findings.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_key_is_per_consumer() {
        assert_eq!(
            processing_key("chatguard:verdicts", "arbiter-0"),
            "chatguard:verdicts:processing:arbiter-0"
        );
    }

    #[test]
    fn test_redelivery_counts_keyed_by_payload() {
        assert_eq!(redeliveries_key("chatguard:stage:llm"), "chatguard:stage:llm:redeliveries");
        assert_eq!(payload_digest("{\"a\":1}"), payload_digest("{\"a\":1}"));
        assert_ne!(payload_digest("{\"a\":1}"), payload_digest("{\"a\":2}"));
        assert_eq!(payload_digest("x").len(), 64);
    }

    #[test]
    fn test_decode_pending_requires_first_seen() {
        assert!(decode_pending("m1", HashMap::new(), None).unwrap().is_none());

        let verdict = Verdict::new("m1", "llm", chatguard_core::Classification::Clean, "ok");
        let fields = HashMap::from([("llm".to_string(), serde_json::to_string(&verdict).unwrap())]);
        let pending = decode_pending("m1", fields, Some(1_700_000_000_000.0))
            .unwrap()
            .unwrap();

        assert_eq!(pending.verdicts.len(), 1);
        assert_eq!(pending.first_seen.timestamp_millis(), 1_700_000_000_000);
    }
}
