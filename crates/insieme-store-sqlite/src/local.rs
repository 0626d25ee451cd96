//! SQLite client-local-store driver: draft queue, committed mirror, cursor.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use insieme_store_core::{verify_mirror_consistency, LocalStore, NewDraft, StoreError};
use insieme_types::wire::{SubmitResult, SubmitStatus};
use insieme_types::{CommittedEvent, Draft, EventBody};

use crate::{db_err, json_err, parse_timestamp, row_to_event};

const CURSOR_KEY: &str = "cursor_committed_id";

/// A persistent client local store backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
}

impl SqliteLocalStore {
    /// Opens or creates the database at `path` and runs migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Opens an in-memory database (testing and ephemeral use).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Creates a store from an existing pool and runs migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_drafts (
                draft_clock INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                client_id TEXT NOT NULL,
                partitions TEXT NOT NULL,
                event TEXT NOT NULL,
                created_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS committed_events (
                committed_id INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                client_id TEXT NOT NULL,
                partitions TEXT NOT NULL,
                event TEXT NOT NULL,
                status_updated_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS app_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Snapshot of the committed mirror in `committed_id` order.
    pub async fn committed_events(&self) -> Result<Vec<CommittedEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT committed_id, id, client_id, partitions, event, status_updated_at \
             FROM committed_events ORDER BY committed_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_event).collect()
    }

    /// Number of pending drafts.
    pub async fn draft_count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM local_drafts")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_draft(
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> Result<Option<Draft>, StoreError> {
        let row = sqlx::query(
            "SELECT draft_clock, id, client_id, partitions, event, created_at \
             FROM local_drafts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let draft_clock: i64 = row.get("draft_clock");
                let partitions: String = row.get("partitions");
                let event: String = row.get("event");
                let created_at: String = row.get("created_at");
                Ok(Some(Draft {
                    draft_clock: draft_clock as u64,
                    id: row.get("id"),
                    client_id: row.get("client_id"),
                    partitions: serde_json::from_str(&partitions).map_err(json_err)?,
                    event: serde_json::from_str::<EventBody>(&event).map_err(json_err)?,
                    created_at: parse_timestamp(&created_at)?,
                }))
            }
        }
    }

    /// Idempotent mirror insert inside an open transaction. Any existing row
    /// under either key must agree on the `(committed_id, id)` pairing.
    async fn mirror_insert(
        tx: &mut Transaction<'_, Sqlite>,
        incoming: &CommittedEvent,
    ) -> Result<(), StoreError> {
        let existing = sqlx::query(
            "SELECT committed_id, id, client_id, partitions, event, status_updated_at \
             FROM committed_events WHERE committed_id = ? OR id = ?",
        )
        .bind(incoming.committed_id as i64)
        .bind(&incoming.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        if let Some(row) = existing {
            let existing = row_to_event(&row)?;
            return verify_mirror_consistency(&existing, incoming);
        }

        sqlx::query(
            r#"
            INSERT INTO committed_events
            (committed_id, id, client_id, partitions, event, status_updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(incoming.committed_id as i64)
        .bind(&incoming.id)
        .bind(&incoming.client_id)
        .bind(serde_json::to_string(&incoming.partitions).map_err(json_err)?)
        .bind(serde_json::to_string(&incoming.event).map_err(json_err)?)
        .bind(incoming.status_updated_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_draft(
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM local_drafts WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn read_cursor(tx: &mut Transaction<'_, Sqlite>) -> Result<u64, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM app_state WHERE key = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn write_cursor(tx: &mut Transaction<'_, Sqlite>, cursor: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO app_state (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(CURSOR_KEY)
        .bind(cursor.to_string())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn load_cursor(&self) -> Result<u64, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM app_state WHERE key = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn insert_draft(&self, draft: NewDraft) -> Result<Draft, StoreError> {
        let partitions = serde_json::to_string(&draft.partitions).map_err(json_err)?;
        let event = serde_json::to_string(&draft.event).map_err(json_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO local_drafts (id, client_id, partitions, event, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&draft.id)
        .bind(&draft.client_id)
        .bind(&partitions)
        .bind(&event)
        .bind(draft.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => Ok(Draft {
                draft_clock: done.last_insert_rowid() as u64,
                id: draft.id,
                client_id: draft.client_id,
                partitions: draft.partitions,
                event: draft.event,
                created_at: draft.created_at,
            }),
            Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => {
                Err(StoreError::DuplicateDraft { id: draft.id })
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn load_drafts_ordered(&self) -> Result<Vec<Draft>, StoreError> {
        let rows = sqlx::query(
            "SELECT draft_clock, id, client_id, partitions, event, created_at \
             FROM local_drafts ORDER BY draft_clock ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let draft_clock: i64 = row.get("draft_clock");
                let partitions: String = row.get("partitions");
                let event: String = row.get("event");
                let created_at: String = row.get("created_at");
                Ok(Draft {
                    draft_clock: draft_clock as u64,
                    id: row.get("id"),
                    client_id: row.get("client_id"),
                    partitions: serde_json::from_str(&partitions).map_err(json_err)?,
                    event: serde_json::from_str::<EventBody>(&event).map_err(json_err)?,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    async fn apply_submit_result(
        &self,
        result: &SubmitResult,
        fallback_client_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if result.status == SubmitStatus::Committed {
            let committed_id = result.committed_id.ok_or_else(|| {
                StoreError::InvariantViolation("committed result without committed_id".into())
            })?;
            if let Some(draft) = Self::fetch_draft(&mut tx, &result.id).await? {
                let client_id = if draft.client_id.is_empty() {
                    fallback_client_id.to_owned()
                } else {
                    draft.client_id.clone()
                };
                let incoming = CommittedEvent {
                    committed_id,
                    id: draft.id.clone(),
                    client_id,
                    partitions: draft.partitions.clone(),
                    event: draft.event.clone(),
                    status_updated_at: result.status_updated_at.unwrap_or_else(Utc::now),
                };
                Self::mirror_insert(&mut tx, &incoming).await?;
            }
        }
        Self::delete_draft(&mut tx, &result.id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn apply_committed_batch(
        &self,
        events: &[CommittedEvent],
        next_cursor: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for event in events {
            Self::mirror_insert(&mut tx, event).await?;
            Self::delete_draft(&mut tx, &event.id).await?;
        }
        if let Some(next) = next_cursor {
            let current = Self::read_cursor(&mut tx).await?;
            if next > current {
                Self::write_cursor(&mut tx, next).await?;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn clear_committed(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM committed_events")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Self::write_cursor(&mut tx, 0).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(id: &str) -> NewDraft {
        NewDraft {
            id: id.into(),
            client_id: "c1".into(),
            partitions: vec!["p1".into()],
            event: EventBody::new("event", json!({"n": id})),
            created_at: Utc::now(),
        }
    }

    fn committed(committed_id: u64, id: &str) -> CommittedEvent {
        CommittedEvent {
            committed_id,
            id: id.into(),
            client_id: "other".into(),
            partitions: vec!["p1".into()],
            event: EventBody::new("event", json!({})),
            status_updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn draft_clock_is_monotonic_and_ordered() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        let a = store.insert_draft(draft("b")).await.unwrap();
        let b = store.insert_draft(draft("a")).await.unwrap();
        assert!(a.draft_clock < b.draft_clock);
        let drafts = store.load_drafts_ordered().await.unwrap();
        assert_eq!(drafts.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn duplicate_draft_id_is_an_error() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        store.insert_draft(draft("a")).await.unwrap();
        let err = store.insert_draft(draft("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDraft { .. }));
    }

    #[tokio::test]
    async fn committed_result_mirrors_draft_and_deletes_it() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        store.insert_draft(draft("e1")).await.unwrap();
        let result = SubmitResult {
            id: "e1".into(),
            status: SubmitStatus::Committed,
            committed_id: Some(5),
            status_updated_at: Some(Utc::now()),
            reason: None,
            errors: None,
        };
        store.apply_submit_result(&result, "c1").await.unwrap();
        assert_eq!(store.draft_count().await.unwrap(), 0);
        let mirror = store.committed_events().await.unwrap();
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror[0].committed_id, 5);
        assert_eq!(mirror[0].client_id, "c1");
    }

    #[tokio::test]
    async fn rejected_result_only_deletes_draft() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        store.insert_draft(draft("e1")).await.unwrap();
        let result = SubmitResult {
            id: "e1".into(),
            status: SubmitStatus::Rejected,
            committed_id: None,
            status_updated_at: None,
            reason: Some(insieme_types::ErrorCode::ValidationFailed),
            errors: None,
        };
        store.apply_submit_result(&result, "c1").await.unwrap();
        assert_eq!(store.draft_count().await.unwrap(), 0);
        assert!(store.committed_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_apply_is_idempotent_and_advances_cursor() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        let events = vec![committed(1, "e1"), committed(2, "e2")];
        store.apply_committed_batch(&events, Some(2)).await.unwrap();
        store.apply_committed_batch(&events, Some(2)).await.unwrap();
        assert_eq!(store.committed_events().await.unwrap().len(), 2);
        assert_eq!(store.load_cursor().await.unwrap(), 2);

        // Cursor is monotonic.
        store.apply_committed_batch(&[], Some(1)).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mirror_conflict_is_an_invariant_violation() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        store.apply_committed_batch(&[committed(1, "e1")], None).await.unwrap();
        let err = store.apply_committed_batch(&[committed(1, "e2")], None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn cursor_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("local.db");
        {
            let store = SqliteLocalStore::open(&db_path).await.unwrap();
            store.apply_committed_batch(&[committed(9, "e9")], Some(9)).await.unwrap();
            store.close().await;
        }
        {
            let store = SqliteLocalStore::open(&db_path).await.unwrap();
            assert_eq!(store.load_cursor().await.unwrap(), 9);
            assert_eq!(store.committed_events().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn clear_committed_resets_mirror_and_cursor_but_keeps_drafts() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        store.insert_draft(draft("d1")).await.unwrap();
        store.apply_committed_batch(&[committed(4, "e4")], Some(4)).await.unwrap();
        store.clear_committed().await.unwrap();
        assert!(store.committed_events().await.unwrap().is_empty());
        assert_eq!(store.load_cursor().await.unwrap(), 0);
        assert_eq!(store.draft_count().await.unwrap(), 1);
    }
}
