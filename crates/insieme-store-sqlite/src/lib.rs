#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-store-sqlite** – SQLite-based persistent storage drivers for the
//! Insieme sync core.
//!
//! This crate provides durable implementations of both storage contracts via
//! sqlx. Databases run in WAL mode with `synchronous=FULL`, so a committed
//! transaction is on disk before the call returns – the engine may reply and
//! fan out the moment `commit_or_get_existing` comes back.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use insieme_store_core::StoreError;
use insieme_types::{CommittedEvent, EventBody};

mod committed;
mod local;

pub use committed::SqliteCommittedStore;
pub use local::SqliteLocalStore;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.into())
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Backend(e.into())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(e.into()))
}

/// Decode one committed-event row shared by both drivers.
fn row_to_event(row: &SqliteRow) -> Result<CommittedEvent, StoreError> {
    let committed_id: i64 = row.get("committed_id");
    let partitions: String = row.get("partitions");
    let event: String = row.get("event");
    let status_updated_at: String = row.get("status_updated_at");
    Ok(CommittedEvent {
        committed_id: committed_id as u64,
        id: row.get("id"),
        client_id: row.get("client_id"),
        partitions: serde_json::from_str::<Vec<String>>(&partitions).map_err(json_err)?,
        event: serde_json::from_str::<EventBody>(&event).map_err(json_err)?,
        status_updated_at: parse_timestamp(&status_updated_at)?,
    })
}
