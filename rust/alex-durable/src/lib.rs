//! Durable persistence backends for ALEX.
//!
//! This crate holds the two leaf stores of the execution-and-event core: the
//! **Task Store** (durable `run_id` -> task record mapping with atomic
//! claim/lease semantics) and the **Event History Store** (an append-only,
//! per-session event log with range scan).
//!
//! Neither store knows about HTTP, SSE, or fan-out; the buffering,
//! backpressure, and broadcast concerns built on top of these traits live in
//! `alex-core`.

pub mod event_log;
pub mod task_store;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite_event_log;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite_task_store;

pub use event_log::{EventHistoryStore, InMemoryEventHistoryStore, StoredEvent};
pub use task_store::{
    ClaimOutcome, InMemoryTaskStore, TaskRecord, TaskRecordStore, TaskResult, TaskStatus,
};

#[cfg(feature = "sqlite-backend")]
pub use sqlite_event_log::SqliteEventHistoryStore;
#[cfg(feature = "sqlite-backend")]
pub use sqlite_task_store::SqliteTaskStore;
