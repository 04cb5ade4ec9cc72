//! HTTP surface: task submission/status/cancellation, SSE event streaming,
//! and health/readiness probes.

pub mod events;
pub mod health;
pub mod tasks;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().merge(health::router()).merge(tasks::router()).merge(events::router())
}
