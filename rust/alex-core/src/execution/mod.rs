//! The Task Execution Service: admission, lease-based ownership, worker
//! dispatch, cancellation, and resume-on-restart.
//!
//! One worker task is spawned per run; ownership of a run is established
//! by an atomic claim against the durable store, so at most one instance
//! ever executes a given run concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alex_durable::{ClaimOutcome, TaskRecord, TaskRecordStore, TaskResult, TaskStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcaster::EventBroadcaster;
use crate::error::AppError;
use crate::events::{event_type, Event};
use crate::history::AsyncEventHistoryStore;
use crate::logging::OpTimer;
use crate::{log_init_warning, log_success};

/// Tunables carved out of `AppConfig` at startup.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub global_max_in_flight: usize,
    pub pending_queue_capacity: usize,
    pub lease_duration: chrono::Duration,
    pub lease_renew_interval: Duration,
    pub execute_max_runtime: Duration,
    pub idle_watchdog: Duration,
    /// Bounded wait for the in-flight admission upgrade.
    pub in_flight_acquire_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            global_max_in_flight: 64,
            pending_queue_capacity: 512,
            lease_duration: chrono::Duration::seconds(30),
            lease_renew_interval: Duration::from_secs(8),
            execute_max_runtime: Duration::from_secs(10 * 60),
            idle_watchdog: Duration::from_secs(60),
            in_flight_acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// A newly submitted or resumed task's public projection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitResponse {
    pub run_id: String,
    pub session_id: String,
    pub status: TaskStatus,
}

/// A request to submit a new task.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub session_id: String,
    pub parent_run_id: Option<String>,
    pub request: serde_json::Value,
    pub idempotency_key: Option<String>,
}

/// Everything an injected `ReactEngine` needs to execute one run and emit
/// events tagged with the correct routing metadata. Deliberately not derived
/// from the caller's HTTP request context: it outlives any single client
/// connection.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub session_id: String,
    pub parent_run_id: Option<String>,
    pub request: serde_json::Value,
    pub max_runtime: Duration,
    pub idle_watchdog: Duration,
    pub cancellation: CancellationToken,
    broadcaster: Arc<EventBroadcaster>,
    history: Arc<AsyncEventHistoryStore>,
    last_activity: Arc<AtomicI64>,
}

impl ExecutionContext {
    /// Emit one workflow event tagged with this run's routing metadata.
    /// Fans out through the Broadcaster (non-blocking) and enqueues to the
    /// Async History Store.
    pub async fn emit(&self, event_type: impl Into<String>, payload: serde_json::Value) {
        let event = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            session_id: self.session_id.clone(),
            run_id: self.run_id.clone(),
            parent_run_id: self.parent_run_id.clone(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now(),
            payload,
        };
        self.last_activity.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.broadcaster.publish(event.clone());
        self.history.append(event).await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// The injected ReAct reasoning loop. Out of scope here; this trait is the
/// seam it plugs into.
#[async_trait]
pub trait ReactEngine: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> Result<String, AppError>;
}

/// Bounded admission: `global_in_flight` and `pending_queue`.
struct AdmissionTokens {
    global_in_flight: Arc<tokio::sync::Semaphore>,
    pending_queue: Arc<tokio::sync::Semaphore>,
}

impl AdmissionTokens {
    fn new(global_max_in_flight: usize, pending_queue_capacity: usize) -> Self {
        Self {
            global_in_flight: Arc::new(tokio::sync::Semaphore::new(global_max_in_flight)),
            pending_queue: Arc::new(tokio::sync::Semaphore::new(pending_queue_capacity)),
        }
    }
}

/// Orchestrates admission, worker spawn, lease heartbeat, cancellation, and
/// resume-on-restart.
pub struct TaskExecutionService {
    instance_id: String,
    store: Arc<dyn TaskRecordStore>,
    broadcaster: Arc<EventBroadcaster>,
    history: Arc<AsyncEventHistoryStore>,
    engine: Arc<dyn ReactEngine>,
    admission: AdmissionTokens,
    config: ExecutionConfig,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskExecutionService {
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskRecordStore>,
        broadcaster: Arc<EventBroadcaster>,
        history: Arc<AsyncEventHistoryStore>,
        engine: Arc<dyn ReactEngine>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            admission: AdmissionTokens::new(config.global_max_in_flight, config.pending_queue_capacity),
            store,
            broadcaster,
            history,
            engine,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn broadcaster(&self) -> Arc<EventBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// `submit(request) -> {run_id, session_id, status}`.
    pub async fn submit(self: &Arc<Self>, req: SubmitRequest) -> Result<SubmitResponse, AppError> {
        let timer = OpTimer::new("execution", "submit");

        if req.session_id.trim().is_empty() {
            return Err(AppError::Validation("session_id must not be empty".into()));
        }

        if let Some(key) = &req.idempotency_key {
            if let Ok(Some(prior)) = self.store.find_by_idempotency_key(key).await {
                info!(run_id = %prior.run_id, "submit deduplicated via idempotency key");
                timer.finish();
                return Ok(SubmitResponse {
                    run_id: prior.run_id,
                    session_id: prior.session_id,
                    status: prior.status,
                });
            }
        }

        let Ok(pending_permit) = Arc::clone(&self.admission.pending_queue).try_acquire_owned() else {
            timer.finish();
            return Err(AppError::Overloaded {
                message: "pending queue is full".into(),
                retry_after_ms: 250,
            });
        };

        let record = TaskRecord::new(
            uuid::Uuid::new_v4().to_string(),
            req.session_id.clone(),
            req.parent_run_id.clone(),
            req.request,
            req.idempotency_key,
        );
        let run_id = record.run_id.clone();
        let session_id = record.session_id.clone();

        self.store.insert(record).await.map_err(|e| AppError::TransientIo(e.to_string()))?;

        self.broadcaster.publish(Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            parent_run_id: req.parent_run_id.clone(),
            event_type: event_type::TASK_CREATED.into(),
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({ "run_id": run_id }),
        });

        let this = Arc::clone(self);
        let dispatch_run_id = run_id.clone();
        tokio::spawn(async move {
            this.execute_async(&dispatch_run_id, Some(pending_permit)).await;
        });

        timer.finish();
        Ok(SubmitResponse { run_id, session_id, status: TaskStatus::Pending })
    }

    /// The worker path: claim, upgrade admission, spawn heartbeat, invoke
    /// the engine, record the terminal outcome.
    pub async fn execute_async(
        self: &Arc<Self>,
        run_id: &str,
        pending_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        let claim = self.store.claim(run_id, &self.instance_id, self.config.lease_duration).await;
        let (outcome, record) = match claim {
            Ok(result) => result,
            Err(err) => {
                warn!(run_id, error = %err, "claim attempt failed");
                return;
            }
        };
        if outcome != ClaimOutcome::Claimed {
            return;
        }
        let Some(record) = record else { return };

        let Ok(in_flight_permit) = tokio::time::timeout(
            self.config.in_flight_acquire_timeout,
            Arc::clone(&self.admission.global_in_flight).acquire_owned(),
        )
        .await
        else {
            warn!(run_id, "timed out acquiring in-flight admission slot; leaving lease to expire");
            return;
        };
        let Ok(in_flight_permit) = in_flight_permit else { return };
        drop(pending_permit);

        let cancellation = CancellationToken::new();
        self.running.lock().insert(run_id.to_string(), cancellation.clone());

        let ctx = ExecutionContext {
            run_id: run_id.to_string(),
            session_id: record.session_id.clone(),
            parent_run_id: record.parent_run_id.clone(),
            request: record.request.clone(),
            max_runtime: self.config.execute_max_runtime,
            idle_watchdog: self.config.idle_watchdog,
            cancellation: cancellation.clone(),
            broadcaster: Arc::clone(&self.broadcaster),
            history: Arc::clone(&self.history),
            last_activity: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis())),
        };

        ctx.emit(
            event_type::NODE_STARTED,
            serde_json::json!({
                "phase": "prepare",
                "session_id": ctx.session_id,
                "run_id": ctx.run_id,
                "parent_run_id": ctx.parent_run_id,
            }),
        )
        .await;

        let this = Arc::clone(self);
        let heartbeat_run_id = run_id.to_string();
        let heartbeat_cancel = cancellation.clone();
        let heartbeat = tokio::spawn(async move {
            this.renew_lease_loop(&heartbeat_run_id, heartbeat_cancel).await;
        });

        let watchdog_cancel = cancellation.clone();
        let watchdog_activity = Arc::clone(&ctx.last_activity);
        let idle_watchdog = ctx.idle_watchdog;
        let watchdog = tokio::spawn(async move {
            idle_watchdog_loop(watchdog_activity, idle_watchdog, watchdog_cancel).await;
        });

        let engine_result = tokio::select! {
            result = self.engine.run(ctx.clone()) => result,
            () = cancellation.cancelled() => Err(AppError::Cancelled),
            () = tokio::time::sleep(self.config.execute_max_runtime) => Err(AppError::Timeout("execute_max_runtime exceeded".into())),
        };

        heartbeat.abort();
        watchdog.abort();
        self.running.lock().remove(run_id);

        let (status, result) = match engine_result {
            Ok(content) => {
                ctx.emit(event_type::RESULT_FINAL, serde_json::json!({ "final_answer": content })).await;
                (TaskStatus::Succeeded, TaskResult { content: Some(content), error_kind: None, error_message: None })
            }
            Err(AppError::Cancelled) => {
                ctx.emit(event_type::RESULT_CANCELLED, serde_json::json!({})).await;
                (
                    TaskStatus::Cancelled,
                    TaskResult {
                        content: None,
                        error_kind: Some(AppError::Cancelled.kind().to_string()),
                        error_message: Some("cancelled".into()),
                    },
                )
            }
            Err(err) => {
                ctx.emit(
                    event_type::DIAGNOSTIC_ERROR,
                    serde_json::json!({ "kind": err.kind(), "message": err.to_string() }),
                )
                .await;
                (
                    TaskStatus::Failed,
                    TaskResult {
                        content: None,
                        error_kind: Some(err.kind().to_string()),
                        error_message: Some(err.to_string()),
                    },
                )
            }
        };

        match self.store.mark_terminal(run_id, &self.instance_id, status, result).await {
            Ok(true) => log_success!("run {} terminated as {:?}", run_id, status),
            Ok(false) => {
                log_init_warning!("lease lost before terminal write for run {}", run_id);
            }
            Err(err) => warn!(run_id, error = %err, "failed to persist terminal status"),
        }
        drop(in_flight_permit);
    }

    async fn renew_lease_loop(&self, run_id: &str, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.lease_renew_interval);
        loop {
            interval.tick().await;
            match self.store.renew_lease(run_id, &self.instance_id, self.config.lease_duration).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(run_id, "lease renewal failed, lease lost");
                    cancellation.cancel();
                    return;
                }
                Err(err) => {
                    warn!(run_id, error = %err, "transient error renewing lease, will retry");
                }
            }
            if self.store.is_cancellation_requested(run_id).await.unwrap_or(false) {
                cancellation.cancel();
                return;
            }
        }
    }

    /// `cancel(run_id)`: sets the intent in the Task Store and signals the
    /// local execution context if this instance owns it.
    pub async fn cancel(&self, run_id: &str) -> Result<(), AppError> {
        let found = self.store.request_cancellation(run_id).await.map_err(|e| AppError::TransientIo(e.to_string()))?;
        if !found {
            return Err(AppError::NotFound(format!("no such run: {run_id}")));
        }
        if let Some(token) = self.running.lock().get(run_id) {
            token.cancel();
        }
        Ok(())
    }

    pub async fn get(&self, run_id: &str) -> Result<TaskRecord, AppError> {
        self.store
            .get(run_id)
            .await
            .map_err(|e| AppError::TransientIo(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("no such run: {run_id}")))
    }

    /// `resume_pending_on_boot()`: scans for claimable tasks and re-dispatches
    /// exactly the ones this instance atomically claims.
    pub async fn resume_pending_on_boot(self: &Arc<Self>) -> anyhow::Result<usize> {
        let now = chrono::Utc::now();
        let claimable = self.store.list_claimable(now).await?;
        let count = claimable.len();
        info!(count, "resuming claimable tasks on boot");
        for record in claimable {
            let this = Arc::clone(self);
            let run_id = record.run_id;
            tokio::spawn(async move {
                this.execute_async(&run_id, None).await;
            });
        }
        Ok(count)
    }
}

async fn idle_watchdog_loop(last_activity: Arc<AtomicI64>, idle_watchdog: Duration, cancellation: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let last = last_activity.load(Ordering::Relaxed);
        let idle_for = chrono::Utc::now().timestamp_millis() - last;
        if idle_for > idle_watchdog.as_millis() as i64 {
            warn!(idle_for_ms = idle_for, "idle watchdog fired");
            cancellation.cancel();
            return;
        }
    }
}
