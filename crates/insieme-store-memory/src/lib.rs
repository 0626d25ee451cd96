#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-store-memory** – In-memory storage drivers for the Insieme sync
//! core.
//!
//! This crate provides fast, non-persistent implementations of both storage
//! contracts, suitable for testing, development, and ephemeral deployments.
//! All data is lost when the process terminates. Commit allocation is
//! serialized under the write lock, which preserves the monotonic
//! `committed_id` invariant without a database sequence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use insieme_store_core::{
    verify_mirror_consistency, CommitOutcome, CommittedStore, LocalStore, NewDraft, NewEvent,
    StoreError, SyncPage, SyncQuery,
};
use insieme_types::wire::{SubmitResult, SubmitStatus};
use insieme_types::{canonical, CommittedEvent, Draft};

//─────────────────────────────
//  Committed store
//─────────────────────────────

#[derive(Debug, Default)]
struct CommittedInner {
    by_committed: BTreeMap<u64, CommittedEvent>,
    by_id: HashMap<String, u64>,
    canonical_by_id: HashMap<String, String>,
    next_committed_id: u64,
}

/// An in-memory, non-persistent committed log.
#[derive(Debug, Clone, Default)]
pub struct MemoryCommittedStore {
    inner: Arc<RwLock<CommittedInner>>,
}

impl MemoryCommittedStore {
    /// Creates a new, empty committed store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of committed rows.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.by_committed.len()
    }
}

#[async_trait]
impl CommittedStore for MemoryCommittedStore {
    async fn commit_or_get_existing(&self, candidate: NewEvent) -> Result<CommitOutcome, StoreError> {
        let canonical = candidate
            .canonical_form()
            .map_err(|e| StoreError::Backend(anyhow!(e.message)))?;

        let mut inner = self.inner.write().await;
        if let Some(&existing_id) = inner.by_id.get(&candidate.id) {
            let stored = inner
                .canonical_by_id
                .get(&candidate.id)
                .ok_or_else(|| StoreError::Backend(anyhow!("missing canonical for {existing_id}")))?;
            if *stored != canonical {
                return Err(StoreError::CanonicalMismatch { id: candidate.id });
            }
            let event = inner
                .by_committed
                .get(&existing_id)
                .cloned()
                .ok_or_else(|| StoreError::Backend(anyhow!("missing row {existing_id}")))?;
            return Ok(CommitOutcome { deduped: true, event });
        }

        inner.next_committed_id += 1;
        let committed_id = inner.next_committed_id;
        let event = CommittedEvent {
            committed_id,
            id: candidate.id.clone(),
            client_id: candidate.client_id,
            partitions: candidate.partitions,
            event: candidate.event,
            status_updated_at: candidate.now,
        };
        inner.by_id.insert(candidate.id.clone(), committed_id);
        inner.canonical_by_id.insert(candidate.id, canonical);
        inner.by_committed.insert(committed_id, event.clone());
        Ok(CommitOutcome { deduped: false, event })
    }

    async fn list_committed_since(&self, query: SyncQuery) -> Result<SyncPage, StoreError> {
        if query.sync_to_committed_id <= query.since_committed_id {
            return Ok(SyncPage::empty(query.since_committed_id));
        }
        let inner = self.inner.read().await;
        let limit = query.limit as usize;
        let mut events = Vec::with_capacity(limit.min(64));
        let mut has_more = false;
        let range = (query.since_committed_id + 1)..=query.sync_to_committed_id;
        for event in inner.by_committed.range(range).map(|(_, e)| e) {
            if !canonical::intersects(&event.partitions, &query.partitions) {
                continue;
            }
            if events.len() == limit {
                has_more = true;
                break;
            }
            events.push(event.clone());
        }
        let next_since_committed_id =
            events.last().map_or(query.since_committed_id, |e| e.committed_id);
        Ok(SyncPage { events, has_more, next_since_committed_id })
    }

    async fn max_committed_id(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().await.next_committed_id)
    }
}

//─────────────────────────────
//  Client local store
//─────────────────────────────

#[derive(Debug, Default)]
struct LocalInner {
    drafts: BTreeMap<u64, Draft>,
    draft_clock_by_id: HashMap<String, u64>,
    mirror: BTreeMap<u64, CommittedEvent>,
    mirror_committed_by_id: HashMap<String, u64>,
    cursor: u64,
    next_draft_clock: u64,
}

impl LocalInner {
    fn remove_draft(&mut self, id: &str) {
        if let Some(clock) = self.draft_clock_by_id.remove(id) {
            self.drafts.remove(&clock);
        }
    }

    /// Idempotent mirror insert; existing rows must agree on both keys.
    fn mirror_insert(&mut self, incoming: &CommittedEvent) -> Result<(), StoreError> {
        if let Some(existing) = self.mirror.get(&incoming.committed_id) {
            return verify_mirror_consistency(existing, incoming);
        }
        if let Some(&committed_id) = self.mirror_committed_by_id.get(&incoming.id) {
            if let Some(existing) = self.mirror.get(&committed_id) {
                return verify_mirror_consistency(existing, incoming);
            }
        }
        self.mirror.insert(incoming.committed_id, incoming.clone());
        self.mirror_committed_by_id.insert(incoming.id.clone(), incoming.committed_id);
        Ok(())
    }
}

/// An in-memory client local store: draft queue, committed mirror, cursor.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocalStore {
    inner: Arc<RwLock<LocalInner>>,
}

impl MemoryLocalStore {
    /// Creates a new, empty local store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the committed mirror in `committed_id` order.
    pub async fn committed_events(&self) -> Vec<CommittedEvent> {
        self.inner.read().await.mirror.values().cloned().collect()
    }

    /// Number of pending drafts.
    pub async fn draft_count(&self) -> usize {
        self.inner.read().await.drafts.len()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn load_cursor(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().await.cursor)
    }

    async fn insert_draft(&self, draft: NewDraft) -> Result<Draft, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.draft_clock_by_id.contains_key(&draft.id) {
            return Err(StoreError::DuplicateDraft { id: draft.id });
        }
        inner.next_draft_clock += 1;
        let clock = inner.next_draft_clock;
        let row = Draft {
            draft_clock: clock,
            id: draft.id.clone(),
            client_id: draft.client_id,
            partitions: draft.partitions,
            event: draft.event,
            created_at: draft.created_at,
        };
        inner.draft_clock_by_id.insert(draft.id, clock);
        inner.drafts.insert(clock, row.clone());
        Ok(row)
    }

    async fn load_drafts_ordered(&self) -> Result<Vec<Draft>, StoreError> {
        // draft_clock is unique, so BTreeMap order is (draft_clock, id) order.
        Ok(self.inner.read().await.drafts.values().cloned().collect())
    }

    async fn apply_submit_result(
        &self,
        result: &SubmitResult,
        fallback_client_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if result.status == SubmitStatus::Committed {
            let committed_id = result.committed_id.ok_or_else(|| {
                StoreError::InvariantViolation("committed result without committed_id".into())
            })?;
            let draft = inner
                .draft_clock_by_id
                .get(&result.id)
                .and_then(|clock| inner.drafts.get(clock))
                .cloned();
            if let Some(draft) = draft {
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
                inner.mirror_insert(&incoming)?;
            }
        }
        inner.remove_draft(&result.id);
        Ok(())
    }

    async fn apply_committed_batch(
        &self,
        events: &[CommittedEvent],
        next_cursor: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for event in events {
            inner.mirror_insert(event)?;
            inner.remove_draft(&event.id);
        }
        if let Some(next) = next_cursor {
            inner.cursor = inner.cursor.max(next);
        }
        Ok(())
    }

    async fn clear_committed(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.mirror.clear();
        inner.mirror_committed_by_id.clear();
        inner.cursor = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn draft(id: &str) -> NewDraft {
        NewDraft {
            id: id.into(),
            client_id: "c1".into(),
            partitions: vec!["p1".into()],
            event: EventBody::new("event", json!({"n": id})),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_assigns_monotonic_ids() {
        let store = MemoryCommittedStore::new();
        let a = store.commit_or_get_existing(candidate("e1", &["p1"], json!({}))).await.unwrap();
        let b = store.commit_or_get_existing(candidate("e2", &["p1"], json!({}))).await.unwrap();
        assert_eq!(a.event.committed_id, 1);
        assert_eq!(b.event.committed_id, 2);
        assert!(!a.deduped);
        assert_eq!(store.max_committed_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dedup_returns_existing_commit() {
        let store = MemoryCommittedStore::new();
        let first =
            store.commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "hi"}))).await.unwrap();
        let second =
            store.commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "hi"}))).await.unwrap();
        assert!(second.deduped);
        assert_eq!(second.event.committed_id, first.event.committed_id);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn dedup_conflict_rejects_differing_payload() {
        let store = MemoryCommittedStore::new();
        store.commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "hi"}))).await.unwrap();
        let err = store
            .commit_or_get_existing(candidate("e1", &["p1"], json!({"t": "bye"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CanonicalMismatch { .. }));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn listing_filters_by_partition_and_pages() {
        let store = MemoryCommittedStore::new();
        for i in 0..10 {
            let partition = if i % 2 == 0 { "even" } else { "odd" };
            store
                .commit_or_get_existing(candidate(&format!("e{i}"), &[partition], json!({"i": i})))
                .await
                .unwrap();
        }
        let page = store
            .list_committed_since(SyncQuery {
                partitions: vec!["even".into()],
                since_committed_id: 0,
                limit: 3,
                sync_to_committed_id: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(page.has_more);
        assert_eq!(page.next_since_committed_id, page.events.last().unwrap().committed_id);

        let rest = store
            .list_committed_since(SyncQuery {
                partitions: vec!["even".into()],
                since_committed_id: page.next_since_committed_id,
                limit: 3,
                sync_to_committed_id: 10,
            })
            .await
            .unwrap();
        assert_eq!(rest.events.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn listing_respects_sync_to_bound() {
        let store = MemoryCommittedStore::new();
        for i in 0..5 {
            store
                .commit_or_get_existing(candidate(&format!("e{i}"), &["p1"], json!({"i": i})))
                .await
                .unwrap();
        }
        let page = store
            .list_committed_since(SyncQuery {
                partitions: vec!["p1".into()],
                since_committed_id: 0,
                limit: 10,
                sync_to_committed_id: 3,
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(!page.has_more);
        assert_eq!(page.next_since_committed_id, 3);
    }

    #[tokio::test]
    async fn draft_queue_orders_by_clock() {
        let store = MemoryLocalStore::new();
        store.insert_draft(draft("b")).await.unwrap();
        store.insert_draft(draft("a")).await.unwrap();
        let drafts = store.load_drafts_ordered().await.unwrap();
        assert_eq!(drafts.len(), 2);
        assert!(drafts[0].draft_clock < drafts[1].draft_clock);
        assert_eq!(drafts[0].id, "b");
    }

    #[tokio::test]
    async fn duplicate_draft_id_is_rejected() {
        let store = MemoryLocalStore::new();
        store.insert_draft(draft("a")).await.unwrap();
        let err = store.insert_draft(draft("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDraft { .. }));
    }

    #[tokio::test]
    async fn submit_result_mirrors_and_removes_draft() {
        let store = MemoryLocalStore::new();
        store.insert_draft(draft("e1")).await.unwrap();
        let result = SubmitResult {
            id: "e1".into(),
            status: SubmitStatus::Committed,
            committed_id: Some(7),
            status_updated_at: Some(Utc::now()),
            reason: None,
            errors: None,
        };
        store.apply_submit_result(&result, "c1").await.unwrap();
        assert_eq!(store.draft_count().await, 0);
        let mirror = store.committed_events().await;
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror[0].committed_id, 7);
        assert_eq!(mirror[0].id, "e1");
    }

    #[tokio::test]
    async fn batch_apply_removes_matching_draft_and_advances_cursor() {
        let store = MemoryLocalStore::new();
        store.insert_draft(draft("e1")).await.unwrap();
        let event = CommittedEvent {
            committed_id: 3,
            id: "e1".into(),
            client_id: "other".into(),
            partitions: vec!["p1".into()],
            event: EventBody::new("event", json!({})),
            status_updated_at: Utc::now(),
        };
        store.apply_committed_batch(&[event], Some(3)).await.unwrap();
        assert_eq!(store.draft_count().await, 0);
        assert_eq!(store.load_cursor().await.unwrap(), 3);

        // Cursor never decreases.
        store.apply_committed_batch(&[], Some(1)).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mirror_mismatch_is_fatal() {
        let store = MemoryLocalStore::new();
        let event = CommittedEvent {
            committed_id: 3,
            id: "e1".into(),
            client_id: "c".into(),
            partitions: vec!["p1".into()],
            event: EventBody::new("event", json!({})),
            status_updated_at: Utc::now(),
        };
        store.apply_committed_batch(&[event.clone()], None).await.unwrap();
        let conflicting = CommittedEvent { id: "e2".into(), ..event };
        let err = store.apply_committed_batch(&[conflicting], None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn clear_committed_keeps_drafts() {
        let store = MemoryLocalStore::new();
        store.insert_draft(draft("e1")).await.unwrap();
        let event = CommittedEvent {
            committed_id: 1,
            id: "other".into(),
            client_id: "c".into(),
            partitions: vec!["p1".into()],
            event: EventBody::new("event", json!({})),
            status_updated_at: Utc::now(),
        };
        store.apply_committed_batch(&[event], Some(1)).await.unwrap();
        store.clear_committed().await.unwrap();
        assert!(store.committed_events().await.is_empty());
        assert_eq!(store.load_cursor().await.unwrap(), 0);
        assert_eq!(store.draft_count().await, 1);
    }
}
