//! ChatGuard Broker
//!
//! Everything the pipeline's workers share lives behind the traits in this
//! crate. Workers never hold mutable state for each other; they coordinate
//! only through:
//! - [`Broker`]: durable, at-least-once topics with blocking pop
//! - [`DedupStore`]: atomic check-and-set on decided messages and reported links
//! - [`VerdictStore`]: the arbiter's per-message verdict table
//! - [`RecordStore`]: persisted messages, decisions, and negative findings
//!
//! Each trait ships with an in-process implementation for tests and
//! single-node runs, and a Redis implementation (feature `redis-backend`).

pub mod dedup;
pub mod queue;
pub mod records;
pub mod verdict_store;

#[cfg(feature = "redis-backend")]
pub mod redis_backend;

pub use dedup::{link_key, DedupStore, MemoryDedupStore};
pub use queue::{publish_with_retry, Broker, Delivery, MemoryBroker, Topics};
pub use records::{MemoryRecordStore, RecordStore};
pub use verdict_store::{MemoryVerdictStore, PendingMessage, VerdictStore};

#[cfg(feature = "redis-backend")]
pub use redis_backend::{RedisBackend, RedisBroker, RedisDedupStore, RedisRecordStore, RedisVerdictStore};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::dedup::DedupStore;
    pub use crate::queue::{Broker, Delivery, Topics};
    pub use crate::records::RecordStore;
    pub use crate::verdict_store::{PendingMessage, VerdictStore};
}
