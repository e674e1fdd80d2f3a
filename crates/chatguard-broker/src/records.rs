//! Persistence collaborator
//!
//! Upsert-by-key storage for messages, decisions, and negative findings.
//! Findings carry a uniqueness constraint on the message link.

use crate::dedup::link_key;
use async_trait::async_trait;
use chatguard_core::{Decision, Message, NegativeFinding, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Record store contract
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store an ingested message. Messages are immutable: the first write wins.
    async fn put_message(&self, message: &Message) -> Result<()>;

    async fn message(&self, message_id: &str) -> Result<Option<Message>>;

    async fn upsert_decision(&self, decision: &Decision) -> Result<()>;

    async fn decision(&self, message_id: &str) -> Result<Option<Decision>>;

    /// Insert a finding unless one already exists for its link.
    /// Returns `false` on a uniqueness conflict.
    async fn insert_finding(&self, finding: &NegativeFinding) -> Result<bool>;

    /// The finding recorded for a link, if any
    async fn finding(&self, message_link: &str) -> Result<Option<NegativeFinding>>;

    async fn findings(&self) -> Result<Vec<NegativeFinding>>;
}

/// In-process record store
#[derive(Default)]
pub struct MemoryRecordStore {
    messages: RwLock<HashMap<String, Message>>,
    decisions: RwLock<HashMap<String, Decision>>,
    findings: RwLock<HashMap<String, NegativeFinding>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted decisions
    pub fn decision_count(&self) -> usize {
        self.decisions.read().len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        self.messages
            .write()
            .entry(message.message_id.clone())
            .or_insert_with(|| message.clone());
        Ok(())
    }

    async fn message(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self.messages.read().get(message_id).cloned())
    }

    async fn upsert_decision(&self, decision: &Decision) -> Result<()> {
        self.decisions
            .write()
            .insert(decision.message_id.clone(), decision.clone());
        Ok(())
    }

    async fn decision(&self, message_id: &str) -> Result<Option<Decision>> {
        Ok(self.decisions.read().get(message_id).cloned())
    }

    async fn insert_finding(&self, finding: &NegativeFinding) -> Result<bool> {
        let mut findings = self.findings.write();
        let key = link_key(&finding.message_link);
        if findings.contains_key(&key) {
            return Ok(false);
        }
        findings.insert(key, finding.clone());
        Ok(true)
    }

    async fn finding(&self, message_link: &str) -> Result<Option<NegativeFinding>> {
        Ok(self.findings.read().get(&link_key(message_link)).cloned())
    }

    async fn findings(&self) -> Result<Vec<NegativeFinding>> {
        let mut all: Vec<_> = self.findings.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}
