//! `SQLite`-backed `EventHistoryStore`.
//!
//! `BEGIN IMMEDIATE` serializes concurrent writers, WAL mode keeps readers
//! unblocked, and blocking work is pushed onto `spawn_blocking` so the async
//! runtime never stalls on file IO.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::task;

use crate::event_log::{EventHistoryStore, StoredEvent};

/// `SQLite`-backed event history store, keyed by `(session_id, seq)`.
#[derive(Debug, Clone)]
pub struct SqliteEventHistoryStore {
    db_path: PathBuf,
}

impl SqliteEventHistoryStore {
    /// Open (and migrate) a database file. Use `:memory:` for an in-memory,
    /// shared-cache database suitable for tests.
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
                CREATE TABLE IF NOT EXISTS session_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    event_data BLOB NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE(session_id, seq)
                )
                ",
                [],
            )
            .context("failed to create session_events table")?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_session_events_session ON session_events(session_id, seq)",
                [],
            )
            .context("failed to create session index")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")??;
        Ok(())
    }
}

#[async_trait]
impl EventHistoryStore for SqliteEventHistoryStore {
    async fn append_batch(&self, session_id: &str, events: Vec<StoredEvent>) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let session_id = session_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut conn = Connection::open(&db_path).context("failed to open database")?;
            conn.pragma_update(None, "journal_mode", "WAL").ok();

            let tx = conn.transaction().context("failed to begin transaction")?;
            for event in &events {
                let data = event.to_bytes()?;
                let now = chrono::Utc::now().timestamp();
                tx.execute(
                    r"
                    INSERT INTO session_events (session_id, seq, event_data, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![&session_id, event.seq as i64, &data, now],
                )
                .context("failed to insert event")?;
            }
            tx.commit().context("failed to commit batch")?;
            Ok(())
        })
        .await
        .context("failed to spawn blocking task")??;
        Ok(())
    }

    async fn replay(&self, session_id: &str, after_seq: u64) -> anyhow::Result<Vec<StoredEvent>> {
        let session_id = session_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> anyhow::Result<Vec<StoredEvent>> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let mut stmt = conn
                .prepare(
                    r"
                    SELECT event_data FROM session_events
                    WHERE session_id = ?1 AND seq > ?2
                    ORDER BY seq ASC
                    ",
                )
                .context("failed to prepare replay query")?;

            let rows = stmt
                .query_map(params![&session_id, after_seq as i64], |row| {
                    let data: Vec<u8> = row.get(0)?;
                    Ok(data)
                })
                .context("failed to execute replay query")?;

            let mut events = Vec::new();
            for row in rows {
                let data = row.context("failed to read row")?;
                events.push(StoredEvent::from_bytes(&data).context("failed to deserialize event")?);
            }
            Ok(events)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn has_session_events(&self, session_id: &str) -> anyhow::Result<bool> {
        let session_id = session_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM session_events WHERE session_id = ?1",
                    params![&session_id],
                    |row| row.get(0),
                )
                .context("failed to check session existence")?;
            Ok(count > 0)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<u64> {
        let session_id = session_id.to_string();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> anyhow::Result<u64> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let count = conn
                .execute("DELETE FROM session_events WHERE session_id = ?1", params![&session_id])
                .context("failed to delete session events")?;
            Ok(count as u64)
        })
        .await
        .context("failed to spawn blocking task")?
    }

    async fn prune_expired(&self, ttl: chrono::Duration) -> anyhow::Result<u64> {
        let cutoff = (chrono::Utc::now() - ttl).timestamp();
        let db_path = self.db_path.clone();

        task::spawn_blocking(move || -> anyhow::Result<u64> {
            let conn = Connection::open(&db_path).context("failed to open database")?;
            let count = conn
                .execute("DELETE FROM session_events WHERE created_at < ?1", params![cutoff])
                .context("failed to prune expired events")?;
            Ok(count as u64)
        })
        .await
        .context("failed to spawn blocking task")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session: &str, seq: u64) -> StoredEvent {
        StoredEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq,
            session_id: session.to_string(),
            run_id: "r1".to_string(),
            parent_run_id: None,
            event_type: "workflow.node.started".to_string(),
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({"k": "v"}),
        }
    }

    #[tokio::test]
    async fn append_then_replay_round_trips_in_order() {
        let store = SqliteEventHistoryStore::new(":memory:").await.unwrap();
        store
            .append_batch("s1", vec![event("s1", 0), event("s1", 1), event("s1", 2)])
            .await
            .unwrap();

        let replayed = store.replay("s1", 0).await.unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].seq, 0);
        assert_eq!(replayed[2].seq, 2);

        let tail = store.replay("s1", 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 2);
    }

    #[tokio::test]
    async fn delete_session_removes_events() {
        let store = SqliteEventHistoryStore::new(":memory:").await.unwrap();
        store.append_batch("s1", vec![event("s1", 0)]).await.unwrap();
        assert!(store.has_session_events("s1").await.unwrap());
        assert_eq!(store.delete_session("s1").await.unwrap(), 1);
        assert!(!store.has_session_events("s1").await.unwrap());
    }
}
