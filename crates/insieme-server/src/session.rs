//! Per-connection session state machine.
//!
//! ```text
//! [await_connect] --connect(valid)--> [active]
//! [await_connect] --connect(bad auth)--> error(auth_failed) -> [closed]
//! [await_connect] --any other msg--> error(bad_request), stay
//! [active] --submit_events/sync--> process, stay
//! [*] --version mismatch / unexpected fault--> error -> [closed]
//! ```
//!
//! One task per session reads its inbound queue and awaits each handler to
//! completion, so inbound messages are processed strictly sequentially.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use insieme_auth::Identity;
use insieme_store_core::{NewEvent, SyncQuery};
use insieme_types::wire::{
    ConnectPayload, ConnectedPayload, Message, SubmitEventsPayload, SubmitEventsResultPayload,
    SubmitItem, SubmitResult, SyncPayload, SyncResponsePayload,
};
use insieme_types::{
    canonical, CommittedEvent, Envelope, ErrorCode, ProtocolError, ValidationContext,
    DEFAULT_SYNC_LIMIT, MAX_SUBMIT_ITEMS, MAX_SYNC_LIMIT,
};

use crate::hub::{SessionHandle, SessionId};
use crate::ServerInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitConnect,
    Active,
    Closed,
}

enum ItemOutcome {
    Rejected(SubmitResult),
    Committed { result: SubmitResult, broadcast: Option<CommittedEvent> },
}

pub(crate) struct Session {
    id: SessionId,
    server: Arc<ServerInner>,
    handle: Arc<SessionHandle>,
    outbound: mpsc::Sender<Envelope>,
    state: SessionState,
    identity: Option<Identity>,
    /// Pinned upper bound for the sync cycle in progress.
    sync_to: Option<u64>,
    window_start: Instant,
    window_count: u32,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        server: Arc<ServerInner>,
        handle: Arc<SessionHandle>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            id,
            server,
            handle,
            outbound,
            state: SessionState::AwaitConnect,
            identity: None,
            sync_to: None,
            window_start: Instant::now(),
            window_count: 0,
        }
    }

    pub(crate) async fn run(mut self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            if let Err(err) = self.dispatch(envelope).await {
                self.send_error(&err).await;
            }
            if self.state == SessionState::Closed {
                break;
            }
        }
        self.server.hub.unregister(self.id);
        debug!(session = %self.id, "session closed");
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        envelope.ensure_version()?;
        let state = self.state;
        match (state, envelope.message) {
            (SessionState::AwaitConnect, Message::Connect(payload)) => {
                self.handle_connect(payload).await
            }
            (SessionState::AwaitConnect, _) => {
                Err(ProtocolError::bad_request("connect required before any other message"))
            }
            (SessionState::Active, Message::SubmitEvents(payload)) => {
                self.handle_submit(payload).await
            }
            (SessionState::Active, Message::Sync(payload)) => self.handle_sync(payload).await,
            (SessionState::Active, _) => {
                Err(ProtocolError::bad_request("unexpected message type for active session"))
            }
            (SessionState::Closed, _) => Ok(()),
        }
    }

    //───────────────────── connect ─────────────────────

    async fn handle_connect(&mut self, payload: ConnectPayload) -> Result<(), ProtocolError> {
        let identity = self
            .server
            .verifier
            .verify(&payload.token)
            .await
            .map_err(|e| ProtocolError::auth_failed(format!("token rejected: {e}")))?;
        if identity.client_id != payload.client_id {
            warn!(session = %self.id, claimed = %payload.client_id, "client_id does not match token subject");
            return Err(ProtocolError::auth_failed("client_id does not match token subject"));
        }
        let server_last_committed_id = self
            .server
            .store
            .max_committed_id()
            .await
            .map_err(|e| e.to_protocol_error())?;

        self.state = SessionState::Active;
        info!(session = %self.id, client = %identity.client_id, "session active");
        let client_id = identity.client_id.clone();
        self.identity = Some(identity);
        self.send(Message::Connected(ConnectedPayload { client_id, server_last_committed_id }))
            .await
    }

    //───────────────────── submit ─────────────────────

    async fn handle_submit(&mut self, payload: SubmitEventsPayload) -> Result<(), ProtocolError> {
        if has_duplicate_ids(&payload.events) {
            return Err(ProtocolError::bad_request("duplicate event ids in request"));
        }
        if payload.events.len() != MAX_SUBMIT_ITEMS {
            return Err(ProtocolError::bad_request("exactly one event per submit_events request"));
        }
        let Some(item) = payload.events.into_iter().next() else {
            return Err(ProtocolError::bad_request("exactly one event per submit_events request"));
        };
        self.check_submit_rate()?;

        let client_id = self
            .identity
            .as_ref()
            .map(|i| i.client_id.clone())
            .ok_or_else(|| ProtocolError::server_error("active session without identity"))?;

        match self.process_item(item, &client_id).await? {
            ItemOutcome::Rejected(result) => {
                self.send(Message::SubmitEventsResult(SubmitEventsResultPayload {
                    results: vec![result],
                }))
                .await
            }
            ItemOutcome::Committed { result, broadcast } => {
                // The origin learns the outcome from this reply, never from a
                // broadcast; fan-out strictly follows it.
                self.send(Message::SubmitEventsResult(SubmitEventsResultPayload {
                    results: vec![result],
                }))
                .await?;
                if let Some(event) = broadcast {
                    self.server.hub.broadcast(self.id, &event);
                }
                Ok(())
            }
        }
    }

    /// Run one item through normalize → authorize → validate → commit.
    ///
    /// `Ok(Rejected)` is a per-item soft failure; `Err` rejects the request
    /// envelope (`bad_request`) or tears the session down (`server_error`).
    async fn process_item(
        &mut self,
        item: SubmitItem,
        client_id: &str,
    ) -> Result<ItemOutcome, ProtocolError> {
        let partitions = match canonical::normalize_partitions(&item.partitions) {
            Ok(partitions) => partitions,
            Err(err) => return Ok(ItemOutcome::Rejected(SubmitResult::rejected(&item.id, &err))),
        };

        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| ProtocolError::server_error("active session without identity"))?;
        let authorized = self
            .server
            .authorizer
            .authorize(identity, &partitions)
            .await
            .map_err(|e| ProtocolError::server_error(format!("authorizer failure: {e}")))?;
        if !authorized {
            let err = ProtocolError::forbidden("partition access denied");
            return Ok(ItemOutcome::Rejected(SubmitResult::rejected(&item.id, &err)));
        }

        let ctx = ValidationContext { client_id };
        if let Err(err) = self.server.validator.validate(&item, &ctx) {
            return match err.code {
                ErrorCode::ValidationFailed | ErrorCode::Forbidden => {
                    Ok(ItemOutcome::Rejected(SubmitResult::rejected(&item.id, &err)))
                }
                _ => Err(err),
            };
        }

        let candidate = NewEvent {
            id: item.id.clone(),
            client_id: client_id.to_owned(),
            partitions,
            event: item.event,
            now: Utc::now(),
        };
        match self.server.store.commit_or_get_existing(candidate).await {
            Ok(outcome) => {
                debug!(
                    session = %self.id,
                    committed_id = outcome.event.committed_id,
                    deduped = outcome.deduped,
                    "event committed"
                );
                let result = SubmitResult::committed(&outcome.event);
                // A dedup hit was fanned out when it first committed.
                let broadcast = (!outcome.deduped).then_some(outcome.event);
                Ok(ItemOutcome::Committed { result, broadcast })
            }
            Err(err @ insieme_store_core::StoreError::CanonicalMismatch { .. }) => {
                Ok(ItemOutcome::Rejected(SubmitResult::rejected(&item.id, &err.to_protocol_error())))
            }
            Err(err) => Err(err.to_protocol_error()),
        }
    }

    fn check_submit_rate(&mut self) -> Result<(), ProtocolError> {
        let Some(max) = self.server.config.max_submits_per_window else {
            return Ok(());
        };
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.server.config.submit_window {
            self.window_start = now;
            self.window_count = 0;
        }
        if self.window_count >= max {
            return Err(ProtocolError::rate_limited("submit rate exceeded"));
        }
        self.window_count += 1;
        Ok(())
    }

    //───────────────────── sync ─────────────────────

    async fn handle_sync(&mut self, payload: SyncPayload) -> Result<(), ProtocolError> {
        let partitions = canonical::normalize_partitions(&payload.partitions)?;

        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| ProtocolError::server_error("active session without identity"))?;
        let authorized = self
            .server
            .authorizer
            .authorize(identity, &partitions)
            .await
            .map_err(|e| ProtocolError::server_error(format!("authorizer failure: {e}")))?;
        if !authorized {
            return Err(ProtocolError::forbidden("partition access denied"));
        }

        let limit = payload.limit.unwrap_or(DEFAULT_SYNC_LIMIT).clamp(1, MAX_SYNC_LIMIT);
        let sync_to_committed_id = match self.sync_to {
            Some(pinned) => {
                self.handle.set_subscription(partitions.clone());
                pinned
            }
            None => {
                let max = self
                    .server
                    .store
                    .max_committed_id()
                    .await
                    .map_err(|e| e.to_protocol_error())?;
                self.handle.begin_sync(partitions.clone());
                self.sync_to = Some(max);
                max
            }
        };

        let page = self
            .server
            .store
            .list_committed_since(SyncQuery {
                partitions: partitions.clone(),
                since_committed_id: payload.since_committed_id,
                limit,
                sync_to_committed_id,
            })
            .await
            .map_err(|e| e.to_protocol_error())?;

        let has_more = page.has_more;
        debug!(
            session = %self.id,
            events = page.events.len(),
            has_more,
            sync_to = sync_to_committed_id,
            "sync page served"
        );
        self.send(Message::SyncResponse(SyncResponsePayload {
            partitions,
            events: page.events,
            next_since_committed_id: page.next_since_committed_id,
            has_more,
        }))
        .await?;

        if !has_more {
            self.sync_to = None;
            self.handle.end_sync();
        }
        Ok(())
    }

    //───────────────────── plumbing ─────────────────────

    async fn send(&mut self, message: Message) -> Result<(), ProtocolError> {
        if self.outbound.send(Envelope::new(message)).await.is_err() {
            debug!(session = %self.id, "outbound channel closed");
            self.state = SessionState::Closed;
        }
        Ok(())
    }

    async fn send_error(&mut self, err: &ProtocolError) {
        warn!(session = %self.id, code = %err.code, "protocol error: {}", err.message);
        let _ = self.send(Message::Error(err.to_payload())).await;
        if err.code.closes_connection() {
            self.state = SessionState::Closed;
        }
    }
}

fn has_duplicate_ids(items: &[SubmitItem]) -> bool {
    for (i, item) in items.iter().enumerate() {
        if items[i + 1..].iter().any(|other| other.id == item.id) {
            return true;
        }
    }
    false
}
