#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-store-core** – Core storage contracts for the Insieme sync core.
//!
//! This crate defines the committed-log and client-local-store traits without
//! providing concrete implementations. Storage drivers (SQLite, in-memory)
//! implement these traits in separate crates that depend on this core
//! abstraction.
//!
//! The committed store is the single serialization point for commit order:
//! `commit_or_get_existing` must allocate `committed_id` atomically and be
//! durable before it returns, because the engine replies and fans out as soon
//! as it does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use insieme_types::wire::SubmitResult;
use insieme_types::{canonical, CommittedEvent, Draft, EventBody, ProtocolError};

//─────────────────────────────
//  Commit candidate & outcome
//─────────────────────────────

/// Candidate row handed to [`CommittedStore::commit_or_get_existing`].
///
/// `partitions` must already be normalized; the canonical form is derived
/// from `{ partitions, event }` only.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Client-generated globally unique id (dedup key).
    pub id: String,
    /// Originating client.
    pub client_id: String,
    /// Normalized partition set.
    pub partitions: Vec<String>,
    /// Opaque domain event.
    pub event: EventBody,
    /// Commit wall-clock assigned by the engine.
    pub now: DateTime<Utc>,
}

impl NewEvent {
    /// Canonical equality digest for this candidate.
    pub fn canonical_form(&self) -> Result<String, ProtocolError> {
        canonical::canonical_form(&self.partitions, &self.event)
    }
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// True when a canonically-equal row with the same id already existed.
    pub deduped: bool,
    /// The committed row (existing on dedup, fresh otherwise).
    pub event: CommittedEvent,
}

//─────────────────────────────
//  Sync paging
//─────────────────────────────

/// One page request against the committed log.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQuery {
    /// Normalized partition filter.
    pub partitions: Vec<String>,
    /// Exclusive lower bound.
    pub since_committed_id: u64,
    /// Maximum events returned.
    pub limit: u32,
    /// Inclusive upper bound pinned for the sync cycle.
    pub sync_to_committed_id: u64,
}

/// One page of committed events.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPage {
    /// Matching events in ascending `committed_id` order, at most `limit`.
    pub events: Vec<CommittedEvent>,
    /// True iff more matching events exist within the cycle window.
    pub has_more: bool,
    /// Last returned `committed_id`, or the input `since` when empty.
    pub next_since_committed_id: u64,
}

impl SyncPage {
    /// Empty page that leaves the cursor where it was.
    pub fn empty(since_committed_id: u64) -> Self {
        Self { events: Vec::new(), has_more: false, next_since_committed_id: since_committed_id }
    }
}

//─────────────────────────────
//  Draft insertion
//─────────────────────────────

/// Draft fields supplied by the caller; the store allocates `draft_clock`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDraft {
    /// Client-generated globally unique id.
    pub id: String,
    /// Owning client.
    pub client_id: String,
    /// Normalized partition set.
    pub partitions: Vec<String>,
    /// Opaque domain event.
    pub event: EventBody,
    /// Local creation timestamp.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by storage drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Same `id`, different canonical payload. Maps to `validation_failed`.
    #[error("event {id} already committed with a different canonical payload")]
    CanonicalMismatch {
        /// Conflicting event id.
        id: String,
    },
    /// A draft with this id is already queued locally.
    #[error("draft {id} already queued")]
    DuplicateDraft {
        /// Duplicate draft id.
        id: String,
    },
    /// Committed mirror disagrees with an incoming row on the
    /// `committed_id` ↔ `id` pairing.
    ///
    /// Fatal: the client must discard mirror-derived state and re-sync.
    #[error("protocol integrity violation: {0}")]
    InvariantViolation(String),
    /// Any other backend failure. Maps to `server_error`.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Map to the wire-level protocol error.
    pub fn to_protocol_error(&self) -> ProtocolError {
        match self {
            StoreError::CanonicalMismatch { id } => ProtocolError::validation_failed(format!(
                "event {id} already committed with a different payload"
            )),
            StoreError::DuplicateDraft { id } => {
                ProtocolError::validation_failed(format!("draft {id} already queued"))
            }
            StoreError::InvariantViolation(msg) => ProtocolError::server_error(msg.clone()),
            StoreError::Backend(e) => ProtocolError::server_error(e.to_string()),
        }
    }
}

/// Verify that an existing mirror row and an incoming row agree on the
/// `committed_id` ↔ `id` pairing.
///
/// Called by drivers whenever an idempotent insert finds a row already
/// present under either key.
pub fn verify_mirror_consistency(
    existing: &CommittedEvent,
    incoming: &CommittedEvent,
) -> Result<(), StoreError> {
    if existing.id != incoming.id || existing.committed_id != incoming.committed_id {
        return Err(StoreError::InvariantViolation(format!(
            "committed mirror mismatch: have ({}, {}), got ({}, {})",
            existing.committed_id, existing.id, incoming.committed_id, incoming.id
        )));
    }
    Ok(())
}

//─────────────────────────────
//  Storage contracts
//─────────────────────────────

/// Abstraction over the server's append-only committed log.
#[async_trait]
pub trait CommittedStore: Send + Sync {
    /// Commit `candidate` or return the existing row with the same id.
    ///
    /// Transactional. A row with the same `id` and equal canonical form
    /// yields `(deduped=true, existing)`; a differing canonical form fails
    /// with [`StoreError::CanonicalMismatch`]. Otherwise the next
    /// `committed_id` is allocated atomically, the row inserted, and the
    /// call returns only once the insert is durable.
    async fn commit_or_get_existing(&self, candidate: NewEvent) -> Result<CommitOutcome, StoreError>;

    /// Return committed events with `since < committed_id ≤ sync_to` whose
    /// partitions intersect the filter, ascending, at most `limit`.
    ///
    /// When partition filtering sparsifies a scan the driver may read in
    /// chunks larger than `limit`; external behavior is unchanged.
    async fn list_committed_since(&self, query: SyncQuery) -> Result<SyncPage, StoreError>;

    /// Highest `committed_id` ever assigned (0 when empty).
    async fn max_committed_id(&self) -> Result<u64, StoreError>;
}

/// Abstraction over the client's local store: draft queue, committed
/// mirror, durable sync cursor.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Durable sync cursor (0 when never synced).
    async fn load_cursor(&self) -> Result<u64, StoreError>;

    /// Append a draft, allocating the next `draft_clock` atomically.
    ///
    /// A duplicate `id` is an error.
    async fn insert_draft(&self, draft: NewDraft) -> Result<Draft, StoreError>;

    /// Pending drafts sorted by `(draft_clock asc, id asc)`.
    async fn load_drafts_ordered(&self) -> Result<Vec<Draft>, StoreError>;

    /// Apply one `submit_events_result` entry transactionally.
    ///
    /// On `committed`: the pending draft with the result's id is mirrored
    /// (idempotently) into the committed table; an existing row must agree
    /// on `(committed_id, id)` or the call fails with
    /// [`StoreError::InvariantViolation`]. The draft row is always removed.
    async fn apply_submit_result(
        &self,
        result: &SubmitResult,
        fallback_client_id: &str,
    ) -> Result<(), StoreError>;

    /// Apply a batch of committed events (sync page or broadcast)
    /// transactionally: idempotent mirror insert, invariant verification,
    /// draft removal by matching id, then `cursor ← max(cursor,
    /// next_cursor)` when a cursor is supplied.
    async fn apply_committed_batch(
        &self,
        events: &[CommittedEvent],
        next_cursor: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Drop the committed mirror and reset the cursor to 0.
    ///
    /// Recovery path for a detected integrity violation; drafts survive.
    async fn clear_committed(&self) -> Result<(), StoreError>;
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        verify_mirror_consistency, CommitOutcome, CommittedStore, LocalStore, NewDraft, NewEvent,
        StoreError, SyncPage, SyncQuery,
    };
}
