//! The Event Broadcaster: per-session fan-out to live SSE subscribers.
//!
//! N bounded per-subscription `mpsc` channels indexed by `session_id`: a
//! session can outlive any single run, and a subscriber only ever cares
//! about its own session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bounded::BoundedTtlMap;
use crate::events::{event_type, Event};

/// Tunables for the broadcaster, carved out of `AppConfig` at startup.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Per-subscription delivery channel capacity (`BUF_SSE`).
    pub buffer_size: usize,
    /// Bound on `last_seen_seq_by_run` per subscription.
    pub last_seen_cache_size: usize,
    /// Bound on `drops_per_session`/`no_client_by_session` entry count.
    pub drops_per_session_cap: usize,
    /// TTL for `drops_per_session`/`no_client_by_session` entries.
    pub drops_per_session_ttl: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            last_seen_cache_size: 2048,
            drops_per_session_cap: 2048,
            drops_per_session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// A live subscriber's delivery end, handed to the SSE handler.
///
/// Two channels: `receiver` carries the bounded, drop-eligible data stream;
/// `priority_receiver` is unbounded and carries the events that must never
/// be dropped — terminal events and `stream.dropped` notices themselves —
/// so a saturated data channel can never swallow either.
pub struct SubscriptionHandle {
    pub subscriber_id: String,
    pub receiver: mpsc::Receiver<Event>,
    pub priority_receiver: mpsc::UnboundedReceiver<Event>,
}

struct SubscriptionState {
    session_id: String,
    sender: mpsc::Sender<Event>,
    priority_sender: mpsc::UnboundedSender<Event>,
    last_seen_seq_by_run: BoundedTtlMap<String, u64>,
}

/// Counters surfaced for diagnostics and for the `GET /healthz` projection.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcasterStats {
    pub active_subscriptions: usize,
    pub dropped_total: u64,
}

/// Fan-out bus: publishers call `publish`, SSE connections call `subscribe`.
pub struct EventBroadcaster {
    config: BroadcasterConfig,
    subscriptions: RwLock<HashMap<String, SubscriptionState>>,
    session_index: RwLock<HashMap<String, HashSet<String>>>,
    // Keyed by session_id, not run_id: the Event History Store's
    // `(session_id, seq)` uniqueness constraint requires one monotonic
    // counter per session, shared across every run in that session. This
    // a run's own seq values are still strictly increasing, since they're
    // a subsequence of the session's strictly increasing sequence.
    session_seq_counters: RwLock<BoundedTtlMap<String, AtomicU64>>,
    recent_signatures: RwLock<BoundedTtlMap<String, ()>>,
    drops_per_session: RwLock<BoundedTtlMap<String, u64>>,
    no_client_by_session: RwLock<BoundedTtlMap<String, u64>>,
    drop_notify_coalesce: RwLock<BoundedTtlMap<String, Instant>>,
    dropped_total: AtomicU64,
}

const DEDUP_SIGNATURE_TTL: Duration = Duration::from_secs(60);
const DROP_NOTIFY_COALESCE_WINDOW: Duration = Duration::from_secs(1);

impl EventBroadcaster {
    #[must_use]
    pub fn new(config: BroadcasterConfig) -> Self {
        let drops_cap = config.drops_per_session_cap;
        let drops_ttl = config.drops_per_session_ttl;
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            session_index: RwLock::new(HashMap::new()),
            session_seq_counters: RwLock::new(BoundedTtlMap::new(drops_cap, drops_ttl)),
            recent_signatures: RwLock::new(BoundedTtlMap::new(4096, DEDUP_SIGNATURE_TTL)),
            drops_per_session: RwLock::new(BoundedTtlMap::new(drops_cap, drops_ttl)),
            no_client_by_session: RwLock::new(BoundedTtlMap::new(drops_cap, drops_ttl)),
            drop_notify_coalesce: RwLock::new(BoundedTtlMap::new(drops_cap, drops_ttl)),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Create a delivery channel for `session_id`. The sentinel
    /// [`crate::events::GLOBAL_SESSION_SENTINEL`] subscribes to every session.
    pub fn subscribe(&self, session_id: &str) -> SubscriptionHandle {
        let subscriber_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(self.config.buffer_size.max(1));
        let (priority_sender, priority_receiver) = mpsc::unbounded_channel();

        self.subscriptions.write().insert(
            subscriber_id.clone(),
            SubscriptionState {
                session_id: session_id.to_string(),
                sender,
                priority_sender,
                last_seen_seq_by_run: BoundedTtlMap::new(
                    self.config.last_seen_cache_size,
                    Duration::from_secs(24 * 60 * 60),
                ),
            },
        );
        self.session_index
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(subscriber_id.clone());

        debug!(subscriber_id = %subscriber_id, session_id = %session_id, "subscription created");
        SubscriptionHandle { subscriber_id, receiver, priority_receiver }
    }

    /// Drain (by dropping the sender, which closes the channel) and remove a
    /// subscription.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        let Some(state) = self.subscriptions.write().remove(subscriber_id) else {
            return;
        };
        if let Some(ids) = self.session_index.write().get_mut(&state.session_id) {
            ids.remove(subscriber_id);
        }
        debug!(subscriber_id = %subscriber_id, "subscription removed");
    }

    /// Seed a subscription's replay cursor so live delivery doesn't
    /// re-deliver events the caller already obtained from history.
    pub fn mark_seen(&self, subscriber_id: &str, run_id: &str, seq: u64) {
        if let Some(state) = self.subscriptions.write().get_mut(subscriber_id) {
            let entry = state.last_seen_seq_by_run.get_or_insert_with(run_id.to_string(), || 0);
            *entry = (*entry).max(seq);
        }
    }

    /// Allocate the next `seq` for `session_id`, starting at 1. `seq == 0` is
    /// reserved as the "unassigned" sentinel (see `publish`) and as the
    /// default `after_seq` cursor for a client with no `Last-Event-ID`, so
    /// the counter must never hand out 0 or the session's first event would
    /// be indistinguishable from "already replayed".
    fn next_seq(&self, session_id: &str) -> u64 {
        let counters = self.session_seq_counters.read();
        if let Some(counter) = counters.get(&session_id.to_string()) {
            return counter.fetch_add(1, Ordering::SeqCst);
        }
        drop(counters);
        let mut counters = self.session_seq_counters.write();
        counters.get_or_insert_with(session_id.to_string(), || AtomicU64::new(1)).fetch_add(1, Ordering::SeqCst)
    }

    /// Publish one event. Non-blocking end to end.
    pub fn publish(&self, mut event: Event) {
        if !event.has_valid_session() {
            warn!(event_id = %event.event_id, "dropping event with no session_id");
            self.bump(&self.no_client_by_session, "__missing_session__");
            return;
        }

        if event.seq == 0 {
            event.seq = self.next_seq(&event.session_id);
        }

        let signature = event.dedup_signature();
        {
            let mut recent = self.recent_signatures.write();
            if recent.contains(&signature) {
                debug!(event_id = %event.event_id, "dropping duplicate publish");
                return;
            }
            recent.insert(signature, ());
        }

        let target_ids: Vec<String> = {
            let index = self.session_index.read();
            let mut ids: HashSet<String> = index.get(&event.session_id).cloned().unwrap_or_default();
            if let Some(global) = index.get(crate::events::GLOBAL_SESSION_SENTINEL) {
                ids.extend(global.iter().cloned());
            }
            ids.into_iter().collect()
        };

        if target_ids.is_empty() {
            self.bump(&self.no_client_by_session, &event.session_id);
            return;
        }

        let mut subscriptions = self.subscriptions.write();
        for subscriber_id in &target_ids {
            let Some(state) = subscriptions.get_mut(subscriber_id) else { continue };
            if event.is_terminal() {
                // Terminal events bypass the bounded data channel entirely:
                // every subscriber must receive every terminal event, drop
                // budget applies to non-terminal events only.
                let _ = state.priority_sender.send(event.clone());
                continue;
            }
            match state.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.record_drop(subscriber_id, &event.session_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Cleaned up lazily by the SSE handler's disconnect path.
                }
            }
        }
        drop(subscriptions);
    }

    fn record_drop(&self, subscriber_id: &str, session_id: &str) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
        self.bump(&self.drops_per_session, session_id);

        let should_notify = {
            let mut coalesce = self.drop_notify_coalesce.write();
            let now = Instant::now();
            match coalesce.get(&subscriber_id.to_string()) {
                Some(last) if now.duration_since(*last) < DROP_NOTIFY_COALESCE_WINDOW => false,
                _ => {
                    coalesce.insert(subscriber_id.to_string(), now);
                    true
                }
            }
        };

        if should_notify {
            let notice = Event {
                event_id: uuid::Uuid::new_v4().to_string(),
                seq: 0,
                session_id: session_id.to_string(),
                run_id: String::new(),
                parent_run_id: None,
                event_type: event_type::STREAM_DROPPED.into(),
                timestamp: chrono::Utc::now(),
                payload: serde_json::json!({ "reason": "subscriber_channel_full" }),
            };
            // Delivered out-of-band on the priority channel: the data
            // channel is, by construction, the thing that's full right now.
            if let Some(state) = self.subscriptions.write().get_mut(subscriber_id) {
                let _ = state.priority_sender.send(notice);
            }
        }
    }

    fn bump(&self, map: &RwLock<BoundedTtlMap<String, u64>>, key: &str) {
        let mut map = map.write();
        let counter = map.get_or_insert_with(key.to_string(), || 0);
        *counter += 1;
    }

    #[must_use]
    pub fn drops_for_session(&self, session_id: &str) -> u64 {
        self.drops_per_session.read().get(&session_id.to_string()).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            active_subscriptions: self.subscriptions.read().len(),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
        }
    }

    /// Periodic sweep of every bounded map. Call from a
    /// `tokio::time::interval` loop, e.g. once a minute.
    pub fn prune(&self) {
        let pruned_sig = self.recent_signatures.write().prune();
        let pruned_drops = self.drops_per_session.write().prune();
        let pruned_no_client = self.no_client_by_session.write().prune();
        let pruned_coalesce = self.drop_notify_coalesce.write().prune();
        let pruned_seq = self.session_seq_counters.write().prune();
        if pruned_sig + pruned_drops + pruned_no_client + pruned_coalesce + pruned_seq > 0 {
            debug!(
                pruned_sig, pruned_drops, pruned_no_client, pruned_coalesce, pruned_seq,
                "broadcaster bounded-map sweep"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session_id: &str, run_id: &str, event_type: &str) -> Event {
        Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            session_id: session_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            event_type: event_type.into(),
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn events_without_session_id_are_dropped() {
        let bus = EventBroadcaster::new(BroadcasterConfig::default());
        let mut handle = bus.subscribe("s1");
        bus.publish(event("", "r1", event_type::NODE_STARTED));
        assert!(handle.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_preserves_per_run_order() {
        let bus = EventBroadcaster::new(BroadcasterConfig::default());
        let mut a = bus.subscribe("s1");
        let mut b = bus.subscribe("s1");

        for i in 0..5 {
            bus.publish(event("s1", "r1", &format!("workflow.node.output.delta.{i}")));
        }

        for i in 1..=5 {
            let got_a = a.receiver.recv().await.unwrap();
            let got_b = b.receiver.recv().await.unwrap();
            assert_eq!(got_a.seq, i);
            assert_eq!(got_b.seq, i);
        }
    }

    #[tokio::test]
    async fn full_channel_drops_and_notifies_once_per_window() {
        let bus = EventBroadcaster::new(BroadcasterConfig { buffer_size: 1, ..BroadcasterConfig::default() });
        let mut handle = bus.subscribe("s1");

        for i in 0..10 {
            bus.publish(event("s1", "r1", &format!("workflow.node.output.delta.{i}")));
        }

        let mut saw_drop_notice = false;
        while let Ok(e) = handle.priority_receiver.try_recv() {
            if e.event_type == event_type::STREAM_DROPPED {
                saw_drop_notice = true;
            }
        }
        assert!(saw_drop_notice, "drop notice is delivered out-of-band even though the data channel is saturated");
        assert!(bus.drops_for_session("s1") > 0);
    }

    #[tokio::test]
    async fn terminal_event_is_delivered_despite_saturated_data_channel() {
        let bus = EventBroadcaster::new(BroadcasterConfig { buffer_size: 1, ..BroadcasterConfig::default() });
        let mut handle = bus.subscribe("s1");

        for i in 0..10 {
            bus.publish(event("s1", "r1", &format!("workflow.node.output.delta.{i}")));
        }
        bus.publish(event("s1", "r1", event_type::RESULT_FINAL));

        let terminal = handle.priority_receiver.try_recv().expect("terminal event must bypass the full data channel");
        assert_eq!(terminal.event_type, event_type::RESULT_FINAL);
    }

    #[tokio::test]
    async fn duplicate_publish_of_same_event_id_is_deduped() {
        let bus = EventBroadcaster::new(BroadcasterConfig::default());
        let mut handle = bus.subscribe("s1");
        let mut e = event("s1", "r1", event_type::NODE_STARTED);
        e.event_id = "fixed-id".into();
        e.seq = 7;

        bus.publish(e.clone());
        bus.publish(e);

        assert!(handle.receiver.recv().await.is_some());
        assert!(handle.receiver.try_recv().is_err());
    }

    #[test]
    fn prune_does_not_panic_when_empty() {
        let bus = EventBroadcaster::new(BroadcasterConfig::default());
        bus.prune();
    }
}
