//! Process entrypoint: configuration, component wiring, resume-on-restart,
//! background tasks, and HTTP serving.

use std::sync::Arc;

use alex_core::broadcaster::{BroadcasterConfig, EventBroadcaster};
use alex_core::config::AppConfig;
use alex_core::error::AppError;
use alex_core::execution::{ExecutionConfig, ExecutionContext, ReactEngine, TaskExecutionService};
use alex_core::gateway::{ChannelGatewayStateMachine, GatewayConfig, RecordingMessenger};
use alex_core::history::{AsyncEventHistoryStore, HistoryConfig};
use alex_core::scheduler::Scheduler;
use alex_core::{log_banner, log_init_step, log_success, server, AppState};
use alex_durable::{
    EventHistoryStore, InMemoryEventHistoryStore, InMemoryTaskStore, SqliteEventHistoryStore, SqliteTaskStore,
    TaskRecordStore,
};
use async_trait::async_trait;

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Placeholder for the injected ReAct reasoning loop, which is out of
/// scope here (see [`alex_core::execution::ReactEngine`]). A real
/// deployment wires a provider-backed implementation in its place.
struct UnimplementedEngine;

#[async_trait]
impl ReactEngine for UnimplementedEngine {
    async fn run(&self, _ctx: ExecutionContext) -> Result<String, AppError> {
        Err(AppError::ToolFailed("no ReAct engine configured".into()))
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    log_banner!("ALEX execution core", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    config.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    log_init_step!(1, 6, "configuration", "loaded and validated");

    let (task_store, event_log): (Arc<dyn TaskRecordStore>, Arc<dyn EventHistoryStore>) =
        if config.durable.db_path == ":memory:" {
            (Arc::new(InMemoryTaskStore::new()), Arc::new(InMemoryEventHistoryStore::new()))
        } else {
            let tasks = SqliteTaskStore::new(config.durable.db_path.clone()).await?;
            let events = SqliteEventHistoryStore::new(config.durable.db_path.clone()).await?;
            (Arc::new(tasks), Arc::new(events))
        };
    log_init_step!(2, 6, "durable backends", format!("task store + event log ready at {}", config.durable.db_path));

    let broadcaster = Arc::new(EventBroadcaster::new(BroadcasterConfig {
        buffer_size: config.broadcaster.buffer_size,
        last_seen_cache_size: config.broadcaster.last_seen_cache_size,
        drops_per_session_cap: config.broadcaster.drops_per_session_cap,
        drops_per_session_ttl: std::time::Duration::from_secs(config.broadcaster.drops_per_session_ttl_secs),
    }));

    let history = Arc::new(AsyncEventHistoryStore::new(event_log, HistoryConfig {
        buffer_size: config.history.buffer_size,
        batch_max: config.history.batch_max,
        flush_interval: std::time::Duration::from_millis(config.history.flush_interval_ms),
        append_wait: std::time::Duration::from_millis(50),
        retry_min: std::time::Duration::from_millis(config.history.retry_min_ms),
        retry_max: std::time::Duration::from_millis(config.history.retry_max_ms),
    }));
    log_init_step!(3, 6, "event fan-out", "broadcaster + history writer constructed");

    let execution = Arc::new(TaskExecutionService::new(
        task_store,
        Arc::clone(&broadcaster),
        Arc::clone(&history),
        Arc::new(UnimplementedEngine),
        ExecutionConfig {
            global_max_in_flight: config.execution.global_max_in_flight,
            pending_queue_capacity: config.execution.pending_queue_capacity,
            lease_duration: config.lease_duration(),
            lease_renew_interval: config.lease_renew_interval(),
            execute_max_runtime: config.execute_max_runtime(),
            idle_watchdog: config.idle_watchdog(),
            in_flight_acquire_timeout: std::time::Duration::from_secs(5),
        },
    ));

    let resumed = execution.resume_pending_on_boot().await?;
    log_init_step!(4, 6, "task execution service", format!("resumed {resumed} claimable task(s)"));

    let gateway = Arc::new(ChannelGatewayStateMachine::new(
        Arc::clone(&execution),
        Arc::new(RecordingMessenger::new()),
        GatewayConfig {
            chat_slot_ttl: std::time::Duration::from_secs(config.gateway.chat_slot_ttl_secs),
            chat_dedup_ttl: std::time::Duration::from_secs(config.gateway.chat_dedup_ttl_secs),
            pending_input_capacity: config.gateway.pending_input_capacity,
            command_global_cap: config.gateway.command_global_cap,
        },
    ));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&gateway)));
    log_init_step!(5, 6, "channel gateway + scheduler", "constructed");
    tracing::warn!(
        "cross-instance event delivery is not implemented: the broadcaster's subscriber \
         registry is per-process, so an SSE client connected to a different instance than \
         the one running its task will not see live events. Deploy session-sticky routing \
         in front of this service, or run a single instance."
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&history).run(shutdown_rx, std::time::Duration::from_secs(10)));

    let broadcaster_sweep = Arc::clone(&broadcaster);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            broadcaster_sweep.prune();
        }
    });

    let history_prune = Arc::clone(&history);
    let history_prune_ttl = chrono::Duration::seconds(config.durable.history_prune_ttl_secs as i64);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            if let Err(err) = history_prune.prune_expired(history_prune_ttl).await {
                tracing::warn!(error = %err, "history TTL prune failed");
            }
        }
    });

    let gateway_sweep = Arc::clone(&gateway);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            gateway_sweep.prune();
        }
    });

    let scheduler_tick = Arc::clone(&scheduler);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            scheduler_tick.tick(chrono::Utc::now()).await;
        }
    });

    let state = AppState { execution, broadcaster, history, gateway, config: Arc::new(config.clone()) };
    let app = server::create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    log_success!("listening on {}", config.server.bind_addr);
    axum::serve(listener, app).await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
