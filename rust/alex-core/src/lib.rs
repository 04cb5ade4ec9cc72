//! Execution, event fan-out, durable history, and channel gateway core for
//! the ALEX agent server.
//!
//! The four components named in the module list below compose into one
//! HTTP service (see [`server`]): a task arrives either over HTTP
//! ([`api::tasks`]) or through [`gateway`], [`execution`] admits and runs
//! it behind a lease, and every event it emits fans out live through
//! [`broadcaster`] while durably persisting through [`history`].

pub mod api;
pub mod bounded;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod gateway;
pub mod history;
pub mod logging;
pub mod scheduler;
pub mod server;

use std::sync::Arc;

use config::AppConfig;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub execution: Arc<execution::TaskExecutionService>,
    pub broadcaster: Arc<broadcaster::EventBroadcaster>,
    pub history: Arc<history::AsyncEventHistoryStore>,
    pub gateway: Arc<gateway::ChannelGatewayStateMachine>,
    pub config: Arc<AppConfig>,
}
