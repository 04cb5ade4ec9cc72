//! Durable, append-only event log keyed by session id and sequence number.
//!
//! This is the leaf "Event History Store": range scan and TTL only, no
//! buffering or retry policy. The buffered writer in front of it lives in
//! `alex-core::history`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One durably-stored event, already assigned its final `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub seq: u64,
    pub session_id: String,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl StoredEvent {
    /// Serialize to bytes for blob storage (`SQLite`, etc).
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Durable append-only log for one session's event stream.
///
/// Implementations MUST preserve `seq` ordering within a session and MUST be
/// safe to call concurrently for distinct sessions.
#[async_trait]
pub trait EventHistoryStore: Send + Sync {
    /// Append a batch of events for `session_id`, in order. Either all events
    /// in the batch are durably recorded or none are.
    async fn append_batch(&self, session_id: &str, events: Vec<StoredEvent>) -> anyhow::Result<()>;

    /// Replay events for `session_id` with `seq > after_seq`, in order.
    async fn replay(&self, session_id: &str, after_seq: u64) -> anyhow::Result<Vec<StoredEvent>>;

    /// Whether any events have ever been recorded for `session_id`.
    async fn has_session_events(&self, session_id: &str) -> anyhow::Result<bool>;

    /// Delete all events for `session_id`. Returns the number deleted.
    async fn delete_session(&self, session_id: &str) -> anyhow::Result<u64>;

    /// Remove events older than `ttl` relative to now. Returns the number
    /// pruned. Used by the configured `history` TTL sweep.
    async fn prune_expired(&self, ttl: chrono::Duration) -> anyhow::Result<u64>;
}

/// In-memory `EventHistoryStore`, used for tests and for deployments that do
/// not require durability across restarts.
#[derive(Debug, Default)]
pub struct InMemoryEventHistoryStore {
    sessions: RwLock<HashMap<String, Vec<StoredEvent>>>,
}

impl InMemoryEventHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventHistoryStore for InMemoryEventHistoryStore {
    async fn append_batch(&self, session_id: &str, events: Vec<StoredEvent>) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write();
        sessions.entry(session_id.to_string()).or_default().extend(events);
        Ok(())
    }

    async fn replay(&self, session_id: &str, after_seq: u64) -> anyhow::Result<Vec<StoredEvent>> {
        let sessions = self.sessions.read();
        Ok(sessions
            .get(session_id)
            .map(|events| events.iter().filter(|e| e.seq > after_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn has_session_events(&self, session_id: &str) -> anyhow::Result<bool> {
        let sessions = self.sessions.read();
        Ok(sessions.get(session_id).is_some_and(|e| !e.is_empty()))
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<u64> {
        let mut sessions = self.sessions.write();
        Ok(sessions.remove(session_id).map_or(0, |e| e.len() as u64))
    }

    async fn prune_expired(&self, ttl: chrono::Duration) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - ttl;
        let mut sessions = self.sessions.write();
        let mut pruned = 0u64;
        sessions.retain(|_, events| {
            let before = events.len();
            events.retain(|e| e.timestamp >= cutoff);
            pruned += (before - events.len()) as u64;
            !events.is_empty()
        });
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session: &str, seq: u64) -> StoredEvent {
        StoredEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq,
            session_id: session.to_string(),
            run_id: "r1".to_string(),
            parent_run_id: None,
            event_type: "workflow.node.started".to_string(),
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn replay_preserves_order_and_excludes_seen() {
        let store = InMemoryEventHistoryStore::new();
        store
            .append_batch("s1", vec![event("s1", 0), event("s1", 1), event("s1", 2)])
            .await
            .unwrap();

        let all = store.replay("s1", 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 1);
        assert_eq!(all[1].seq, 2);
    }

    #[tokio::test]
    async fn delete_session_removes_all_events() {
        let store = InMemoryEventHistoryStore::new();
        store.append_batch("s1", vec![event("s1", 0)]).await.unwrap();
        assert!(store.has_session_events("s1").await.unwrap());
        let deleted = store.delete_session("s1").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!store.has_session_events("s1").await.unwrap());
    }
}
