//! `SQLite`-backed `TaskRecordStore`.
//!
//! The claim/lease protocol is expressed as a single conditional `UPDATE`
//! whose `WHERE` clause mirrors [`TaskRecord::is_claimable`] exactly, wrapped
//! in `BEGIN IMMEDIATE` so two instances racing for the same `run_id` cannot
//! both observe a zero-row update as a win. This follows the same
//! spawn-blocking-plus-retry shape the event log uses.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::task_store::{ClaimOutcome, TaskRecord, TaskRecordStore, TaskResult, TaskStatus};

const MAX_CONTENTION_RETRIES: u32 = 5;

/// `SQLite`-backed task store, one row per `run_id`.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    db_path: PathBuf,
}

impl SqliteTaskStore {
    pub async fn new<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let mut db_path = path.into();
        if db_path.to_str() == Some(":memory:") {
            db_path = PathBuf::from("file::memory:?cache=shared");
        }

        let store = Self { db_path };
        store.migrate_schema().await?;
        Ok(store)
    }

    async fn migrate_schema(&self) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = Connection::open(&db_path).context("failed to open database for migration")?;
            conn.pragma_update(None, "journal_mode", "WAL").context("failed to enable WAL mode")?;
            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS task_records (
                    run_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    parent_run_id TEXT,
                    status TEXT NOT NULL,
                    owner_id TEXT,
                    lease_until INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    request BLOB NOT NULL,
                    result BLOB,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    idempotency_key TEXT,
                    cancellation_requested INTEGER NOT NULL DEFAULT 0
                )
                ",
                [],
            )
            .context("failed to create task_records table")?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_task_records_idem ON task_records(idempotency_key)",
                [],
            )
            .context("failed to create idempotency index")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")??;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let request_bytes: Vec<u8> = row.get("request")?;
    let result_bytes: Option<Vec<u8>> = row.get("result")?;
    let status_str: String = row.get("status")?;

    Ok(TaskRecord {
        run_id: row.get("run_id")?,
        session_id: row.get("session_id")?,
        parent_run_id: row.get("parent_run_id")?,
        status: parse_status(&status_str),
        owner_id: row.get("owner_id")?,
        lease_until: row.get::<_, Option<i64>>("lease_until")?.map(from_epoch),
        created_at: from_epoch(row.get("created_at")?),
        updated_at: from_epoch(row.get("updated_at")?),
        completed_at: row.get::<_, Option<i64>>("completed_at")?.map(from_epoch),
        request: serde_json::from_slice(&request_bytes).unwrap_or(serde_json::Value::Null),
        result: result_bytes.and_then(|b| serde_json::from_slice::<TaskResult>(&b).ok()),
        attempt_count: row.get::<_, i64>("attempt_count")? as u32,
        idempotency_key: row.get("idempotency_key")?,
        cancellation_requested: row.get::<_, i64>("cancellation_requested")? != 0,
    })
}

fn parse_status(s: &str) -> TaskStatus {
    match s {
        "running" => TaskStatus::Running,
        "succeeded" => TaskStatus::Succeeded,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_epoch(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Sleep a short, randomized backoff before retrying a contended write.
async fn backoff_jitter(attempt: u32) {
    let base_ms = 5u64 * (1 << attempt.min(4));
    let jitter_ms = rand::thread_rng().gen_range(0..base_ms.max(1));
    tokio::time::sleep(StdDuration::from_millis(base_ms + jitter_ms)).await;
}

#[async_trait]
impl TaskRecordStore for SqliteTaskStore {
    async fn insert(&self, record: TaskRecord) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let request_bytes = serde_json::to_vec(&record.request)?;
            conn.execute(
                r"
                INSERT INTO task_records (
                    run_id, session_id, parent_run_id, status, owner_id, lease_until,
                    created_at, updated_at, completed_at, request, result, attempt_count,
                    idempotency_key, cancellation_requested
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ",
                params![
                    record.run_id,
                    record.session_id,
                    record.parent_run_id,
                    status_str(record.status),
                    record.owner_id,
                    record.lease_until.map(to_epoch),
                    to_epoch(record.created_at),
                    to_epoch(record.updated_at),
                    record.completed_at.map(to_epoch),
                    request_bytes,
                    None::<Vec<u8>>,
                    i64::from(record.attempt_count),
                    record.idempotency_key,
                    i64::from(record.cancellation_requested),
                ],
            )
            .context("failed to insert task record")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")??;
        Ok(())
    }

    async fn get(&self, run_id: &str) -> anyhow::Result<Option<TaskRecord>> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<Option<TaskRecord>> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            conn.query_row("SELECT * FROM task_records WHERE run_id = ?1", params![run_id], row_to_record)
                .optional()
                .context("failed to query task record")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn find_by_idempotency_key(&self, key: &str) -> anyhow::Result<Option<TaskRecord>> {
        let key = key.to_string();
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<Option<TaskRecord>> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            conn.query_row(
                "SELECT * FROM task_records WHERE idempotency_key = ?1 LIMIT 1",
                params![key],
                row_to_record,
            )
            .optional()
            .context("failed to query by idempotency key")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn claim(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_duration: chrono::Duration,
    ) -> anyhow::Result<(ClaimOutcome, Option<TaskRecord>)> {
        let run_id = run_id.to_string();
        let owner_id = owner_id.to_string();
        let db_path = self.db_path.clone();

        for attempt in 0..MAX_CONTENTION_RETRIES {
            let run_id = run_id.clone();
            let owner_id = owner_id.clone();
            let db_path = db_path.clone();

            let outcome = task::spawn_blocking(move || -> rusqlite::Result<(ClaimOutcome, Option<TaskRecord>)> {
                let mut conn = Connection::open(&db_path)?;
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

                let existing = tx
                    .query_row("SELECT * FROM task_records WHERE run_id = ?1", params![run_id], row_to_record)
                    .optional()?;

                let Some(existing) = existing else {
                    return Ok((ClaimOutcome::NotFound, None));
                };

                let now = Utc::now();
                if !existing.is_claimable(now) {
                    return Ok((ClaimOutcome::NotEligible, None));
                }

                let new_lease = now + lease_duration;
                let updated = tx.execute(
                    r"
                    UPDATE task_records
                    SET owner_id = ?1, lease_until = ?2, status = 'running',
                        attempt_count = attempt_count + 1, updated_at = ?3
                    WHERE run_id = ?4
                      AND status IN ('pending', 'running')
                      AND (owner_id IS NULL OR lease_until <= ?3)
                    ",
                    params![owner_id, to_epoch(new_lease), to_epoch(now), run_id],
                )?;

                if updated == 0 {
                    return Ok((ClaimOutcome::NotEligible, None));
                }

                let record = tx
                    .query_row("SELECT * FROM task_records WHERE run_id = ?1", params![run_id], row_to_record)?;
                tx.commit()?;
                Ok((ClaimOutcome::Claimed, Some(record)))
            })
            .await
            .context("failed to spawn blocking task")?;

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if is_contention_error(&e) && attempt + 1 < MAX_CONTENTION_RETRIES => {
                    backoff_jitter(attempt).await;
                }
                Err(e) => return Err(e).context("failed to claim task record"),
            }
        }

        anyhow::bail!("exhausted retries claiming run {run_id} due to sustained contention")
    }

    async fn list_claimable(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<TaskRecord>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<Vec<TaskRecord>> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let mut stmt = conn
                .prepare(
                    r"
                    SELECT * FROM task_records
                    WHERE status IN ('pending', 'running')
                      AND (owner_id IS NULL OR lease_until <= ?1)
                    ",
                )
                .context("failed to prepare claimable query")?;
            let rows = stmt
                .query_map(params![to_epoch(now)], row_to_record)
                .context("failed to execute claimable query")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read claimable rows")
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        owner_id: &str,
        lease_duration: chrono::Duration,
    ) -> anyhow::Result<bool> {
        let run_id = run_id.to_string();
        let owner_id = owner_id.to_string();
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let now = Utc::now();
            let updated = conn
                .execute(
                    r"
                    UPDATE task_records
                    SET lease_until = ?1, updated_at = ?2
                    WHERE run_id = ?3 AND owner_id = ?4 AND status = 'running'
                    ",
                    params![to_epoch(now + lease_duration), to_epoch(now), run_id, owner_id],
                )
                .context("failed to renew lease")?;
            Ok(updated > 0)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn mark_terminal(
        &self,
        run_id: &str,
        owner_id: &str,
        status: TaskStatus,
        result: TaskResult,
    ) -> anyhow::Result<bool> {
        anyhow::ensure!(status.is_terminal(), "mark_terminal requires a terminal status");
        let run_id = run_id.to_string();
        let owner_id = owner_id.to_string();
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let now = Utc::now();
            let result_bytes = serde_json::to_vec(&result)?;
            let updated = conn
                .execute(
                    r"
                    UPDATE task_records
                    SET status = ?1, result = ?2, owner_id = NULL, lease_until = NULL,
                        completed_at = ?3, updated_at = ?3
                    WHERE run_id = ?4 AND owner_id = ?5
                    ",
                    params![status_str(status), result_bytes, to_epoch(now), run_id, owner_id],
                )
                .context("failed to mark task terminal")?;
            Ok(updated > 0)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn request_cancellation(&self, run_id: &str) -> anyhow::Result<bool> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let updated = conn
                .execute(
                    "UPDATE task_records SET cancellation_requested = 1 WHERE run_id = ?1",
                    params![run_id],
                )
                .context("failed to request cancellation")?;
            Ok(updated > 0)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn is_cancellation_requested(&self, run_id: &str) -> anyhow::Result<bool> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let flag: Option<i64> = conn
                .query_row(
                    "SELECT cancellation_requested FROM task_records WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to query cancellation flag")?;
            Ok(flag.unwrap_or(0) != 0)
        })
        .await
        .context("failed to spawn blocking task")?
    }
}

fn is_contention_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(run_id: &str) -> TaskRecord {
        TaskRecord::new(run_id, "session-1", None, serde_json::json!({"query": "hi"}), None)
    }

    #[tokio::test]
    async fn claim_succeeds_once_then_blocks_second_owner() {
        let store = SqliteTaskStore::new(":memory:").await.unwrap();
        store.insert(new_record("r1")).await.unwrap();

        let (outcome_a, rec_a) = store.claim("r1", "instance-a", chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(outcome_a, ClaimOutcome::Claimed);
        assert_eq!(rec_a.unwrap().attempt_count, 1);

        let (outcome_b, rec_b) = store.claim("r1", "instance-b", chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(outcome_b, ClaimOutcome::NotEligible);
        assert!(rec_b.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_by_another_instance() {
        let store = SqliteTaskStore::new(":memory:").await.unwrap();
        store.insert(new_record("r1")).await.unwrap();
        store.claim("r1", "instance-a", chrono::Duration::seconds(-1)).await.unwrap();

        let (outcome, record) = store.claim("r1", "instance-b", chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
        assert_eq!(record.unwrap().owner_id.as_deref(), Some("instance-b"));
    }

    #[tokio::test]
    async fn mark_terminal_requires_current_owner() {
        let store = SqliteTaskStore::new(":memory:").await.unwrap();
        store.insert(new_record("r1")).await.unwrap();
        store.claim("r1", "instance-a", chrono::Duration::seconds(30)).await.unwrap();

        let result = TaskResult { content: Some("done".to_string()), error_kind: None, error_message: None };
        let ok = store
            .mark_terminal("r1", "instance-b", TaskStatus::Succeeded, result.clone())
            .await
            .unwrap();
        assert!(!ok);

        let ok = store.mark_terminal("r1", "instance-a", TaskStatus::Succeeded, result).await.unwrap();
        assert!(ok);

        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert!(record.owner_id.is_none());
    }

    #[tokio::test]
    async fn list_claimable_excludes_live_leases() {
        let store = SqliteTaskStore::new(":memory:").await.unwrap();
        store.insert(new_record("r1")).await.unwrap();
        store.insert(new_record("r2")).await.unwrap();
        store.claim("r1", "instance-a", chrono::Duration::seconds(30)).await.unwrap();

        let claimable = store.list_claimable(Utc::now()).await.unwrap();
        assert_eq!(claimable.len(), 1);
        assert_eq!(claimable[0].run_id, "r2");
    }
}
