//! SQLite committed-log driver.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use insieme_store_core::{CommitOutcome, CommittedStore, NewEvent, StoreError, SyncPage, SyncQuery};
use insieme_types::canonical;

use crate::{db_err, json_err, row_to_event};

const EVENT_COLUMNS: &str = "committed_id, id, client_id, partitions, event, status_updated_at";

/// A persistent committed log backed by SQLite.
///
/// The `committed_id` column is an AUTOINCREMENT primary key: allocation is
/// linearized by the insert transaction and ids are never reused, which is
/// exactly the single logical point of serialization the commit order needs.
#[derive(Debug, Clone)]
pub struct SqliteCommittedStore {
    pool: SqlitePool,
}

impl SqliteCommittedStore {
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
    ///
    /// Capped at one pooled connection – every pooled connection would
    /// otherwise get its own private in-memory database.
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
            CREATE TABLE IF NOT EXISTS committed_events (
                committed_id INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                client_id TEXT NOT NULL,
                partitions TEXT NOT NULL,
                event TEXT NOT NULL,
                canonical TEXT NOT NULL,
                status_updated_at TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total number of committed rows.
    pub async fn event_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM committed_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_existing(
        &self,
        id: &str,
        canonical: &str,
    ) -> Result<Option<CommitOutcome>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}, canonical FROM committed_events WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let stored: String = row.get("canonical");
                if stored != canonical {
                    return Err(StoreError::CanonicalMismatch { id: id.to_owned() });
                }
                Ok(Some(CommitOutcome { deduped: true, event: row_to_event(&row)? }))
            }
        }
    }
}

#[async_trait]
impl CommittedStore for SqliteCommittedStore {
    async fn commit_or_get_existing(&self, candidate: NewEvent) -> Result<CommitOutcome, StoreError> {
        let canonical = candidate
            .canonical_form()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e.message)))?;

        if let Some(existing) = self.fetch_existing(&candidate.id, &canonical).await? {
            return Ok(existing);
        }

        let partitions = serde_json::to_string(&candidate.partitions).map_err(json_err)?;
        let event = serde_json::to_string(&candidate.event).map_err(json_err)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO committed_events
            (id, client_id, partitions, event, canonical, status_updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.client_id)
        .bind(&partitions)
        .bind(&event)
        .bind(&canonical)
        .bind(candidate.now.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(done) => {
                let committed_id = done.last_insert_rowid() as u64;
                // Durability point: WAL fsync happens inside this commit.
                tx.commit().await.map_err(db_err)?;
                let row = sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM committed_events WHERE committed_id = ?"
                ))
                .bind(committed_id as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
                Ok(CommitOutcome { deduped: false, event: row_to_event(&row)? })
            }
            Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => {
                // Lost a race on the id; converge on the winner's row.
                drop(tx);
                self.fetch_existing(&candidate.id, &canonical).await?.ok_or_else(|| {
                    StoreError::Backend(anyhow::anyhow!(
                        "unique violation for {} but row not found",
                        candidate.id
                    ))
                })
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn list_committed_since(&self, query: SyncQuery) -> Result<SyncPage, StoreError> {
        let limit = query.limit as usize;
        // Partition filtering happens in Rust; scan in chunks larger than the
        // page so sparse partitions do not force one query per match.
        let chunk = (limit * 4).max(256);
        let mut events = Vec::with_capacity(limit.min(64));
        let mut has_more = false;
        let mut scan_from = query.since_committed_id;

        'scan: loop {
            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM committed_events \
                 WHERE committed_id > ? AND committed_id <= ? \
                 ORDER BY committed_id ASC LIMIT ?"
            ))
            .bind(scan_from as i64)
            .bind(query.sync_to_committed_id as i64)
            .bind(chunk as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            let exhausted = rows.len() < chunk;

            for row in &rows {
                let event = row_to_event(row)?;
                scan_from = event.committed_id;
                if !canonical::intersects(&event.partitions, &query.partitions) {
                    continue;
                }
                if events.len() == limit {
                    has_more = true;
                    break 'scan;
                }
                events.push(event);
            }
            if exhausted {
                break;
            }
        }

        let next_since_committed_id =
            events.last().map_or(query.since_committed_id, |e| e.committed_id);
        Ok(SyncPage { events, has_more, next_since_committed_id })
    }

    async fn max_committed_id(&self) -> Result<u64, StoreError> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(committed_id), 0) FROM committed_events")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(max as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use insieme_types::EventBody;
    use serde_json::json;

    fn candidate(id: &str, partitions: &[&str], payload: serde_json::Value) -> NewEvent {
        NewEvent {
            id: id.into(),
            client_id: "c1".into(),
            partitions: partitions.iter().map(|s| s.to_string()).collect(),
            event: EventBody::new("event", payload),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_assigns_monotonic_ids() {
        let store = SqliteCommittedStore::in_memory().await.unwrap();
        let a = store.commit_or_get_existing(candidate("e1", &["p1"], json!({}))).await.unwrap();
        let b = store.commit_or_get_existing(candidate("e2", &["p1"], json!({}))).await.unwrap();
        assert_eq!(a.event.committed_id, 1);
        assert_eq!(b.event.committed_id, 2);
        assert_eq!(store.max_committed_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dedup_same_payload_returns_existing_row() {
        let store = SqliteCommittedStore::in_memory().await.unwrap();
        let first =
            store.commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "hi"}))).await.unwrap();
        let second =
            store.commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "hi"}))).await.unwrap();
        assert!(second.deduped);
        assert_eq!(second.event.committed_id, first.event.committed_id);
        assert_eq!(store.event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dedup_differing_payload_is_rejected() {
        let store = SqliteCommittedStore::in_memory().await.unwrap();
        store.commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "hi"}))).await.unwrap();
        let err = store
            .commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "bye"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CanonicalMismatch { .. }));
        assert_eq!(store.event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn canonical_equality_ignores_key_order() {
        let store = SqliteCommittedStore::in_memory().await.unwrap();
        store
            .commit_or_get_existing(candidate("e1", &["p1"], json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        let outcome = store
            .commit_or_get_existing(candidate("e1", &["p1"], json!({"b": 2, "a": 1})))
            .await
            .unwrap();
        assert!(outcome.deduped);
    }

    #[tokio::test]
    async fn paging_filters_partitions_in_chunked_scans() {
        let store = SqliteCommittedStore::in_memory().await.unwrap();
        for i in 0..20 {
            let partition = if i % 4 == 0 { "rare" } else { "common" };
            store
                .commit_or_get_existing(candidate(&format!("e{i}"), &[partition], json!({"i": i})))
                .await
                .unwrap();
        }
        let page = store
            .list_committed_since(SyncQuery {
                partitions: vec!["rare".into()],
                since_committed_id: 0,
                limit: 3,
                sync_to_committed_id: 20,
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(page.has_more);
        assert!(page.events.iter().all(|e| e.partitions == vec!["rare".to_string()]));

        let rest = store
            .list_committed_since(SyncQuery {
                partitions: vec!["rare".into()],
                since_committed_id: page.next_since_committed_id,
                limit: 3,
                sync_to_committed_id: 20,
            })
            .await
            .unwrap();
        assert_eq!(rest.events.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn persistence_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("committed.db");

        {
            let store = SqliteCommittedStore::open(&db_path).await.unwrap();
            store
                .commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "durable"})))
                .await
                .unwrap();
            store.close().await;
        }

        {
            let store = SqliteCommittedStore::open(&db_path).await.unwrap();
            assert_eq!(store.max_committed_id().await.unwrap(), 1);
            let outcome = store
                .commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "durable"})))
                .await
                .unwrap();
            assert!(outcome.deduped);
            assert_eq!(outcome.event.committed_id, 1);
        }
    }
}
