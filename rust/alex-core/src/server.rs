//! Axum app assembly: router plus tracing, compression, and timeout layers.

use std::time::Duration;

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the full HTTP application from already-constructed [`AppState`].
///
/// `http_response_byte_cap` is not enforced here: it bounds external HTTP
/// reads performed by tools (see [`crate::error::AppError::PayloadTooLarge`]),
/// a client-side concern that belongs to the (out of scope) `ReactEngine`
/// implementation, not this server's own inbound request handling.
#[must_use]
pub fn create_app(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.execution.execute_max_runtime_secs.max(30));

    crate::api::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(timeout))
}
