//! Idempotency guard
//!
//! Two independent keyed sets:
//! - `decided(message_id)`: the first arbiter to set it owns the decision
//! - `reported(message_link)`: the first enforcer to set it notifies moderators
//!
//! Both operations are check-and-set: exactly one concurrent caller gets
//! `true` for a given key.

use async_trait::async_trait;
use chatguard_core::Result;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Dedup store contract
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Claim the decision for a message. `false` means someone else already did.
    async fn try_mark_decided(&self, message_id: &str) -> Result<bool>;

    async fn is_decided(&self, message_id: &str) -> Result<bool>;

    /// Claim the moderator report for a link. `false` means already reported.
    async fn try_mark_reported(&self, message_link: &str) -> Result<bool>;

    async fn is_reported(&self, message_link: &str) -> Result<bool>;
}

/// Stable key for a message link. Links are trimmed before hashing so
/// trailing whitespace from chat clients does not defeat the guard.
pub fn link_key(message_link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_link.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// In-process dedup store
#[derive(Default)]
pub struct MemoryDedupStore {
    decided: Mutex<HashSet<String>>,
    reported: Mutex<HashSet<String>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn try_mark_decided(&self, message_id: &str) -> Result<bool> {
        Ok(self.decided.lock().insert(message_id.to_string()))
    }

    async fn is_decided(&self, message_id: &str) -> Result<bool> {
        Ok(self.decided.lock().contains(message_id))
    }

    async fn try_mark_reported(&self, message_link: &str) -> Result<bool> {
        Ok(self.reported.lock().insert(link_key(message_link)))
    }

    async fn is_reported(&self, message_link: &str) -> Result<bool> {
        Ok(self.reported.lock().contains(&link_key(message_link)))
    }
}
