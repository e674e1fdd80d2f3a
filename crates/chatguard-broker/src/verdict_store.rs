//! Arbiter verdict accumulation
//!
//! Verdicts are upserted by `(message_id, stage_name)`. The store also
//! remembers when the first verdict of each pending message arrived, which
//! starts that message's arbitration window.

use async_trait::async_trait;
use chatguard_core::{Result, Verdict, VerdictSet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Verdicts accumulated for one undecided message
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub message_id: String,

    /// When the arbiter saw the first verdict
    pub first_seen: DateTime<Utc>,

    pub verdicts: VerdictSet,
}

/// Verdict store contract
#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Insert or replace a verdict, returning the message's current state.
    /// `now` becomes `first_seen` if this is the message's first verdict.
    async fn upsert(&self, verdict: &Verdict, now: DateTime<Utc>) -> Result<PendingMessage>;

    async fn load(&self, message_id: &str) -> Result<Option<PendingMessage>>;

    /// Pending messages whose first verdict arrived at or before `cutoff`
    async fn pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Forget a message once it has been decided
    async fn clear(&self, message_id: &str) -> Result<()>;
}

/// In-process verdict store
#[derive(Default)]
pub struct MemoryVerdictStore {
    pending: Mutex<HashMap<String, PendingMessage>>,
}

impl MemoryVerdictStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerdictStore for MemoryVerdictStore {
    async fn upsert(&self, verdict: &Verdict, now: DateTime<Utc>) -> Result<PendingMessage> {
        let mut pending = self.pending.lock();
        let entry = pending
            .entry(verdict.message_id.clone())
            .or_insert_with(|| PendingMessage {
                message_id: verdict.message_id.clone(),
                first_seen: now,
                verdicts: VerdictSet::new(),
            });
        entry.verdicts.upsert(verdict.clone());
        Ok(entry.clone())
    }

    async fn load(&self, message_id: &str) -> Result<Option<PendingMessage>> {
        Ok(self.pending.lock().get(message_id).cloned())
    }

    async fn pending_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .pending
            .lock()
            .values()
            .filter(|p| p.first_seen <= cutoff)
            .map(|p| (p.first_seen, p.message_id.clone()))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn clear(&self, message_id: &str) -> Result<()> {
        self.pending.lock().remove(message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatguard_core::Classification;
    use chrono::Duration;

    #[tokio::test]
    async fn test_first_seen_is_kept_across_upserts() {
        let store = MemoryVerdictStore::new();
        let t0 = Utc::now();

        let first = Verdict::new("m1", "heuristic", Classification::Clean, "ok");
        let second = Verdict::new("m1", "llm", Classification::Clean, "ok");

        store.upsert(&first, t0).await.unwrap();
        let state = store.upsert(&second, t0 + Duration::seconds(5)).await.unwrap();

        assert_eq!(state.first_seen, t0);
        assert_eq!(state.verdicts.len(), 2);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_duplicate() {
        let store = MemoryVerdictStore::new();
        let verdict = Verdict::new("m1", "llm", Classification::Violation, "ads").with_confidence(0.7);

        for _ in 0..5 {
            store.upsert(&verdict, Utc::now()).await.unwrap();
        }

        let state = store.load("m1").await.unwrap().unwrap();
        assert_eq!(state.verdicts.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_since_and_clear() {
        let store = MemoryVerdictStore::new();
        let t0 = Utc::now();

        store
            .upsert(&Verdict::new("old", "s", Classification::Uncertain, "x"), t0)
            .await
            .unwrap();
        store
            .upsert(
                &Verdict::new("new", "s", Classification::Uncertain, "x"),
                t0 + Duration::seconds(60),
            )
            .await
            .unwrap();

        let due = store.pending_since(t0 + Duration::seconds(30)).await.unwrap();
        assert_eq!(due, vec!["old".to_string()]);

        store.clear("old").await.unwrap();
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.pending_since(t0 + Duration::seconds(30)).await.unwrap().is_empty());
    }
}
