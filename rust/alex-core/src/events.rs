//! The wire event shape shared by the Broadcaster, the history store, and SSE.
//!
//! A stable string `event_type` tag plus an opaque, type-specific JSON
//! payload, so new event types never require a wire-format migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel `session_id` for the rare global (non-session-scoped) event.
pub const GLOBAL_SESSION_SENTINEL: &str = "__global__";

/// One emitted workflow event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub seq: u64,
    pub session_id: String,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// `group_key` per the data model: `parent_run_id` for subagent events,
    /// else `run_id`.
    #[must_use]
    pub fn group_key(&self) -> &str {
        match &self.parent_run_id {
            Some(parent) if parent != &self.run_id => parent,
            _ => &self.run_id,
        }
    }

    /// Whether this event is a terminal event for its run
    /// (`workflow.result.*`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.event_type.starts_with("workflow.result.")
    }

    /// (E1): events without a session id are dropped before fan-out, except
    /// the designated global sentinel.
    #[must_use]
    pub fn has_valid_session(&self) -> bool {
        !self.session_id.is_empty()
    }

    /// Cheap per-event signature used to dedupe accidental double-publishes.
    /// Deliberately not a full-payload hash — just `event_id` + payload size
    /// + type, which catches retried publishes of the same event without
    /// the cost of hashing arbitrary payloads.
    #[must_use]
    pub fn dedup_signature(&self) -> String {
        let payload_len = serde_json::to_string(&self.payload).map(|s| s.len()).unwrap_or(0);
        format!("{}:{payload_len}:{}", self.event_id, self.event_type)
    }
}

/// Well-known event type tags.
pub mod event_type {
    pub const TASK_CREATED: &str = "task.created";
    pub const NODE_STARTED: &str = "workflow.node.started";
    pub const TOOL_STARTED: &str = "workflow.tool.started";
    pub const TOOL_COMPLETED: &str = "workflow.tool.completed";
    pub const NODE_OUTPUT_DELTA: &str = "workflow.node.output.delta";
    pub const RESULT_FINAL: &str = "workflow.result.final";
    pub const RESULT_CANCELLED: &str = "workflow.result.cancelled";
    pub const DIAGNOSTIC_ERROR: &str = "workflow.diagnostic.error";
    pub const REPLAN_REQUESTED: &str = "workflow.replan.requested";
    pub const STREAM_DROPPED: &str = "stream.dropped";
    pub const CONNECTED: &str = "connected";
}
