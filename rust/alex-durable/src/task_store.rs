//! Durable `run_id -> task record` mapping with atomic claim/lease semantics.
//!
//! This is the leaf "Task Store". It owns the lease protocol's correctness:
//! claim, heartbeat renewal, takeover, and terminal transition all go through
//! a single atomic operation per call, so that two instances can never both
//! believe they own the same run.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Status of a task record. Matches the DAG in the data model: the only
/// back-edge is `Running -> Pending`, taken on lease-expiry takeover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final outcome of a run, recorded once status becomes terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Final-answer string, present on `Succeeded`.
    pub content: Option<String>,
    /// Error kind (see the error taxonomy), present on `Failed`/`Cancelled`.
    pub error_kind: Option<String>,
    /// Human-readable error message, present alongside `error_kind`.
    pub error_message: Option<String>,
}

/// A durable task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub run_id: String,
    pub session_id: String,
    pub parent_run_id: Option<String>,
    pub status: TaskStatus,
    pub owner_id: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque request payload: task text, attachments, LLM selection.
    pub request: serde_json::Value,
    pub result: Option<TaskResult>,
    pub attempt_count: u32,
    pub idempotency_key: Option<String>,
    /// Set by `cancel(run_id)` when the caller is not the owning instance;
    /// the owning instance observes this flag and cancels locally.
    pub cancellation_requested: bool,
}

impl TaskRecord {
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        parent_run_id: Option<String>,
        request: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            parent_run_id,
            status: TaskStatus::Pending,
            owner_id: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            request,
            result: None,
            attempt_count: 0,
            idempotency_key,
            cancellation_requested: false,
        }
    }

    /// Claim predicate from the lease protocol: `status in {pending,
    /// running} AND (owner_id is null OR lease_until <= now)`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Running)
            && self.owner_id.as_ref().is_none_or(|_| self.lease_until.is_none_or(|l| l <= now))
    }
}

/// Result of attempting a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the run.
    Claimed,
    /// Another owner holds a live lease; the caller skipped it.
    NotEligible,
    /// No record exists with this `run_id`.
    NotFound,
}

/// Durable store of task records with atomic claim/lease operations.
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    async fn insert(&self, record: TaskRecord) -> anyhow::Result<()>;

    async fn get(&self, run_id: &str) -> anyhow::Result<Option<TaskRecord>>;

    async fn find_by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<TaskRecord>>;

    /// Atomically claim a run for `owner_id` if the claim predicate holds.
    /// On success, sets `owner_id`, `lease_until = now + lease_duration`,
    /// `status = running`, increments `attempt_count`, and returns the
    /// updated record.
    async fn claim(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_duration: chrono::Duration,
    ) -> anyhow::Result<(ClaimOutcome, Option<TaskRecord>)>;

    /// Scan for every claimable record (used by `resume_pending_on_boot`).
    async fn list_claimable(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<TaskRecord>>;

    /// Extend `lease_until` for a record this instance still owns. Returns
    /// `false` (without error) if the lease was lost (stolen or expired).
    async fn renew_lease(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_duration: chrono::Duration,
    ) -> anyhow::Result<bool>;

    /// Transition to a terminal status while still holding the lease;
    /// clears `owner_id` and sets `completed_at` in the same update. Returns
    /// `false` if the caller no longer holds the lease.
    async fn mark_terminal(
        &self,
        run_id: &str,
        owner_id: &str,
        status: TaskStatus,
        result: TaskResult,
    ) -> anyhow::Result<bool>;

    /// Record a cancellation intent, deliverable to whichever instance
    /// currently owns the run.
    async fn request_cancellation(&self, run_id: &str) -> anyhow::Result<bool>;

    async fn is_cancellation_requested(&self, run_id: &str) -> anyhow::Result<bool>;
}

/// In-memory `TaskRecordStore`, used for tests and single-instance
/// deployments without a durable backend configured.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRecordStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> anyhow::Result<()> {
        let mut records = self.records.write();
        records.insert(record.run_id.clone(), record);
        Ok(())
    }

    async fn get(&self, run_id: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.records.read().get(run_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn claim(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_duration: chrono::Duration,
    ) -> anyhow::Result<(ClaimOutcome, Option<TaskRecord>)> {
        let now = Utc::now();
        let mut records = self.records.write();
        let Some(record) = records.get_mut(run_id) else {
            return Ok((ClaimOutcome::NotFound, None));
        };
        if !record.is_claimable(now) {
            return Ok((ClaimOutcome::NotEligible, None));
        }
        record.owner_id = Some(owner_id.to_string());
        record.lease_until = Some(now + lease_duration);
        record.status = TaskStatus::Running;
        record.attempt_count += 1;
        record.updated_at = now;
        Ok((ClaimOutcome::Claimed, Some(record.clone())))
    }

    async fn list_claimable(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.is_claimable(now))
            .cloned()
            .collect())
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_duration: chrono::Duration,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut records = self.records.write();
        let Some(record) = records.get_mut(run_id) else {
            return Ok(false);
        };
        if record.owner_id.as_deref() != Some(owner_id) || record.status != TaskStatus::Running {
            return Ok(false);
        }
        record.lease_until = Some(now + lease_duration);
        record.updated_at = now;
        Ok(true)
    }

    async fn mark_terminal(
        &self,
        run_id: &str,
        owner_id: &str,
        status: TaskStatus,
        result: TaskResult,
    ) -> anyhow::Result<bool> {
        anyhow::ensure!(status.is_terminal(), "mark_terminal requires a terminal status");
        let now = Utc::now();
        let mut records = self.records.write();
        let Some(record) = records.get_mut(run_id) else {
            return Ok(false);
        };
        if record.owner_id.as_deref() != Some(owner_id) {
            return Ok(false);
        }
        record.status = status;
        record.result = Some(result);
        record.owner_id = None;
        record.lease_until = None;
        record.completed_at = Some(now);
        record.updated_at = now;
        Ok(true)
    }

    async fn request_cancellation(&self, run_id: &str) -> anyhow::Result<bool> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(run_id) else {
            return Ok(false);
        };
        record.cancellation_requested = true;
        Ok(true)
    }

    async fn is_cancellation_requested(&self, run_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .records
            .read()
            .get(run_id)
            .is_some_and(|r| r.cancellation_requested))
    }
}
