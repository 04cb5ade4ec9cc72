//! The Async Event History Store: a buffered, retrying writer in front of
//! the durable `EventHistoryStore` leaf trait.
//!
//! Batches, retries with backoff, and lets `flush` block until a session's
//! enqueued events are durably persisted, so a caller can wait for
//! durability without coupling the hot path to storage latency.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alex_durable::{EventHistoryStore, StoredEvent};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::events::Event;

/// Tunables carved out of `AppConfig` at startup.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Ring buffer capacity (`BUF_HIST`).
    pub buffer_size: usize,
    /// Max batch size per flush (`B_max`).
    pub batch_max: usize,
    /// Flush timer period (`T_flush`).
    pub flush_interval: Duration,
    /// Bounded wait applied to `append` when the buffer is full.
    pub append_wait: Duration,
    /// Retry backoff floor.
    pub retry_min: Duration,
    /// Retry backoff ceiling.
    pub retry_max: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            batch_max: 256,
            flush_interval: Duration::from_millis(500),
            append_wait: Duration::from_millis(50),
            retry_min: Duration::from_millis(250),
            retry_max: Duration::from_secs(5),
        }
    }
}

/// Outcome of `append`: whether the event was accepted into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    /// The buffer stayed full for the whole bounded wait; callers should
    /// coalesce this into a diagnostic event rather than retry tightly.
    QueueFull,
}

struct Buffered {
    event: StoredEvent,
    session_id: String,
}

struct SessionProgress {
    enqueued: u64,
    persisted: u64,
}

struct Shared {
    buffer: Mutex<VecDeque<Buffered>>,
    not_full: Notify,
    not_empty: Notify,
    progress: Mutex<HashMap<String, SessionProgress>>,
    flush_done: Notify,
    consecutive_failures: AtomicU64,
}

/// Buffered, batching, retrying writer in front of a durable
/// [`EventHistoryStore`].
pub struct AsyncEventHistoryStore {
    store: Arc<dyn EventHistoryStore>,
    config: HistoryConfig,
    shared: Arc<Shared>,
}

impl AsyncEventHistoryStore {
    #[must_use]
    pub fn new(store: Arc<dyn EventHistoryStore>, config: HistoryConfig) -> Self {
        Self {
            store,
            config,
            shared: Arc::new(Shared {
                buffer: Mutex::new(VecDeque::new()),
                not_full: Notify::new(),
                not_empty: Notify::new(),
                progress: Mutex::new(HashMap::new()),
                flush_done: Notify::new(),
                consecutive_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Best-effort enqueue. Blocks up to `append_wait` when the buffer is
    /// full, then either accepts or reports `QueueFull`.
    pub async fn append(&self, event: Event) -> AppendOutcome {
        let session_id = event.session_id.clone();
        let stored = to_stored(event);

        loop {
            {
                let mut buffer = self.shared.buffer.lock();
                if buffer.len() < self.config.buffer_size {
                    let mut progress = self.shared.progress.lock();
                    let entry = progress
                        .entry(session_id.clone())
                        .or_insert(SessionProgress { enqueued: 0, persisted: 0 });
                    entry.enqueued += 1;
                    drop(progress);

                    buffer.push_back(Buffered { event: stored, session_id });
                    drop(buffer);
                    self.shared.not_empty.notify_one();
                    return AppendOutcome::Accepted;
                }
            }

            if tokio::time::timeout(self.config.append_wait, self.shared.not_full.notified())
                .await
                .is_err()
            {
                warn!("history buffer full after bounded wait, reporting queue_full");
                return AppendOutcome::QueueFull;
            }
        }
    }

    /// Synchronous: blocks until every event enqueued for `session_id` up to
    /// this call has been durably persisted, or until `timeout` elapses.
    pub async fn flush(&self, session_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let target = {
            let progress = self.shared.progress.lock();
            progress.get(session_id).map_or(0, |p| p.enqueued)
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let progress = self.shared.progress.lock();
                let persisted = progress.get(session_id).map_or(0, |p| p.persisted);
                if persisted >= target {
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("flush({session_id}) timed out waiting for durable persistence");
            }
            let _ = tokio::time::timeout(remaining, self.shared.flush_done.notified()).await;
        }
    }

    pub async fn has_session_events(&self, session_id: &str) -> anyhow::Result<bool> {
        self.store.has_session_events(session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> anyhow::Result<u64> {
        self.store.delete_session(session_id).await
    }

    pub async fn replay(&self, session_id: &str, after_seq: u64) -> anyhow::Result<Vec<StoredEvent>> {
        self.store.replay(session_id, after_seq).await
    }

    /// Delegate to the durable store's TTL sweep. Call from a periodic task.
    pub async fn prune_expired(&self, ttl: chrono::Duration) -> anyhow::Result<u64> {
        self.store.prune_expired(ttl).await
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Drive the background flusher. Runs until `shutdown` fires, at which
    /// point it drains the buffer with the retry policy up to
    /// `shutdown_deadline` before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>, shutdown_deadline: Duration) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.flush_interval) => {}
                () = self.shared.not_empty.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.drain_once().await;
        }

        let deadline = tokio::time::Instant::now() + shutdown_deadline;
        while !self.shared.buffer.lock().is_empty() && tokio::time::Instant::now() < deadline {
            self.drain_once().await;
        }
        let remaining = self.shared.buffer.lock().len();
        if remaining > 0 {
            error!(remaining, "shutdown deadline reached with events still unflushed");
        }
    }

    /// Drain up to `batch_max` events (oldest-first), grouped into one
    /// `append_batch` call per session. Each session is retried
    /// independently: a failure for one session re-enqueues only that
    /// session's events at the head of the buffer, so a session that
    /// already persisted this round is never re-appended (and never
    /// duplicated) just because a later session in the same drain failed.
    async fn drain_once(&self) {
        let batch: Vec<Buffered> = {
            let mut buffer = self.shared.buffer.lock();
            let take = buffer.len().min(self.config.batch_max);
            buffer.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let mut grouped: HashMap<String, Vec<StoredEvent>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for item in batch {
            if !grouped.contains_key(&item.session_id) {
                order.push(item.session_id.clone());
            }
            grouped.entry(item.session_id.clone()).or_default().push(item.event);
        }

        let mut any_failed = false;
        let mut requeue: Vec<Buffered> = Vec::new();
        let mut persisted_counts: HashMap<String, u64> = HashMap::new();

        for session_id in &order {
            let events = grouped.remove(session_id).unwrap_or_default();
            match self.store.append_batch(session_id, events.clone()).await {
                Ok(()) => {
                    persisted_counts.insert(session_id.clone(), events.len() as u64);
                }
                Err(err) => {
                    error!(session_id = %session_id, error = %err, "append_batch failed, retaining this session's batch for retry");
                    any_failed = true;
                    requeue.extend(events.into_iter().map(|event| Buffered { session_id: session_id.clone(), event }));
                }
            }
        }

        if !requeue.is_empty() {
            let mut buffer = self.shared.buffer.lock();
            for item in requeue.into_iter().rev() {
                buffer.push_front(item);
            }
        }

        if any_failed {
            let attempt = self.shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            let backoff = self.backoff_for(attempt);
            warn!(attempt, backoff_ms = backoff.as_millis(), "history flush backing off");
            tokio::time::sleep(backoff).await;
        } else {
            self.shared.consecutive_failures.store(0, Ordering::Relaxed);
        }

        if !persisted_counts.is_empty() {
            let mut progress = self.shared.progress.lock();
            for (session_id, count) in &persisted_counts {
                progress.entry(session_id.clone()).or_insert(SessionProgress { enqueued: 0, persisted: 0 }).persisted += count;
            }
            drop(progress);
            self.shared.not_full.notify_waiters();
            self.shared.flush_done.notify_waiters();
            info!(sessions = persisted_counts.len(), "history batch flushed");
        }
    }

    fn backoff_for(&self, attempt: u64) -> Duration {
        let min = self.config.retry_min.as_millis() as u64;
        let max = self.config.retry_max.as_millis() as u64;
        let exp = min.saturating_mul(1u64 << attempt.min(16)).min(max);
        let jitter = rand::random::<u64>() % (exp / 2 + 1);
        Duration::from_millis((exp / 2 + jitter).max(min))
    }
}

fn to_stored(event: Event) -> StoredEvent {
    StoredEvent {
        event_id: event.event_id,
        seq: event.seq,
        session_id: event.session_id,
        run_id: event.run_id,
        parent_run_id: event.parent_run_id,
        event_type: event.event_type,
        timestamp: event.timestamp,
        payload: event.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alex_durable::InMemoryEventHistoryStore;
    use std::sync::atomic::AtomicUsize;

    fn event(session_id: &str, run_id: &str, seq: u64) -> Event {
        Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq,
            session_id: session_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            event_type: "workflow.node.output.delta".into(),
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn flush_waits_for_durable_persistence_then_returns() {
        let store = Arc::new(InMemoryEventHistoryStore::new());
        let history = Arc::new(AsyncEventHistoryStore::new(Arc::clone(&store), HistoryConfig {
            flush_interval: Duration::from_millis(10),
            ..HistoryConfig::default()
        }));

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&history).run(rx, Duration::from_secs(1)));

        for i in 1..=5 {
            history.append(event("s1", "r1", i)).await;
        }
        history.flush("s1", Duration::from_secs(2)).await.unwrap();

        assert!(store.has_session_events("s1").await.unwrap());
        let replayed = store.replay("s1", 0).await.unwrap();
        assert_eq!(replayed.len(), 5);

        runner.abort();
    }

    struct FlakyStore {
        inner: InMemoryEventHistoryStore,
        remaining_failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHistoryStore for FlakyStore {
        async fn append_batch(&self, session_id: &str, events: Vec<StoredEvent>) -> anyhow::Result<()> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated transient failure");
            }
            self.inner.append_batch(session_id, events).await
        }
        async fn replay(&self, session_id: &str, after_seq: u64) -> anyhow::Result<Vec<StoredEvent>> {
            self.inner.replay(session_id, after_seq).await
        }
        async fn has_session_events(&self, session_id: &str) -> anyhow::Result<bool> {
            self.inner.has_session_events(session_id).await
        }
        async fn delete_session(&self, session_id: &str) -> anyhow::Result<u64> {
            self.inner.delete_session(session_id).await
        }
        async fn prune_expired(&self, ttl: chrono::Duration) -> anyhow::Result<u64> {
            self.inner.prune_expired(ttl).await
        }
    }

    #[tokio::test]
    async fn retries_failed_batch_without_losing_or_duplicating_events() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryEventHistoryStore::new(),
            remaining_failures: AtomicUsize::new(3),
        });
        let history = Arc::new(AsyncEventHistoryStore::new(Arc::clone(&store), HistoryConfig {
            flush_interval: Duration::from_millis(5),
            retry_min: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            ..HistoryConfig::default()
        }));

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&history).run(rx, Duration::from_secs(1)));

        for i in 1..=4 {
            history.append(event("s1", "r1", i)).await;
        }
        history.flush("s1", Duration::from_secs(5)).await.unwrap();

        let replayed = store.inner.replay("s1", 0).await.unwrap();
        assert_eq!(replayed.len(), 4);
        for (i, e) in replayed.iter().enumerate() {
            assert_eq!(e.seq, (i + 1) as u64);
        }

        runner.abort();
    }
}
