//! Connection engine actor.
//!
//! One task owns the transport link and the command channel. Inbound
//! messages are handled to completion one at a time, which is the whole of
//! the inbound-serialization guarantee. The task survives transport faults
//! by reconnecting under the configured policy and ends on `stop()` or a
//! non-retryable failure.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use insieme_store_core::{LocalStore, StoreError};
use insieme_transport::{Transport, TransportLink};
use insieme_types::wire::{ConnectPayload, Message, SyncPayload};
use insieme_types::{CommittedEvent, Draft, Envelope, ErrorCode};

use crate::backoff::Backoff;
use crate::{ClientConfig, ClientError, ClientEvent};

pub(crate) enum Command {
    Submit(Draft),
    SetPartitions(Vec<String>),
    SyncNow,
    FlushDrafts,
    Stop(oneshot::Sender<()>),
}

/// Why a connection (or the whole engine) ended.
enum RunEnd {
    /// `stop()` or command channel gone.
    Stopped,
    /// Not retryable: `auth_failed`, `protocol_version_unsupported`.
    Fatal(String),
    /// Retryable: transport fault or `server_error`.
    Fault(String),
}

/// Per-connection state; dropped on disconnect.
struct Connection {
    outbound: mpsc::Sender<Envelope>,
    syncing: bool,
    buffered: Vec<CommittedEvent>,
}

pub(crate) struct Engine {
    config: ClientConfig,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::Receiver<Command>,
    partitions: Vec<String>,
    first_handshake: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl Engine {
    pub(crate) fn new(
        config: ClientConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<ClientEvent>,
        commands: mpsc::Receiver<Command>,
        first_handshake: oneshot::Sender<Result<(), ClientError>>,
    ) -> Self {
        let partitions = config.partitions.clone();
        Self {
            config,
            store,
            transport,
            events,
            commands,
            partitions,
            first_handshake: Some(first_handshake),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut backoff = self.config.reconnect.clone().map(Backoff::new);
        loop {
            match self.run_connection(&mut backoff).await {
                RunEnd::Stopped => {
                    self.emit(ClientEvent::Stopped);
                    break;
                }
                RunEnd::Fatal(reason) => {
                    warn!(%reason, "connection failed, not retryable");
                    self.emit(ClientEvent::Disconnected { reason });
                    break;
                }
                RunEnd::Fault(reason) => {
                    debug!(%reason, "connection fault");
                    self.emit(ClientEvent::Disconnected { reason });
                    let Some(backoff) = backoff.as_mut() else { break };
                    let Some(delay) = backoff.next_delay() else {
                        warn!("reconnect attempts exhausted");
                        break;
                    };
                    self.emit(ClientEvent::ReconnectScheduled { attempt: backoff.attempt(), delay });
                    if self.sleep_or_stop(delay).await {
                        self.emit(ClientEvent::Stopped);
                        break;
                    }
                }
            }
        }
    }

    /// Wait out a backoff delay; true means a stop arrived meanwhile.
    async fn sleep_or_stop(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return false,
                maybe = self.commands.recv() => match maybe {
                    None => return true,
                    Some(Command::Stop(ack)) => {
                        let _ = ack.send(());
                        return true;
                    }
                    // Anything else just sits in the local queue until the
                    // next connection flushes drafts.
                    Some(_) => {}
                },
            }
        }
    }

    //───────────────────── one connection ─────────────────────

    async fn run_connection(&mut self, backoff: &mut Option<Backoff>) -> RunEnd {
        let link = match self.transport.connect().await {
            Ok(link) => link,
            Err(e) => return self.handshake_failed(RunEnd::Fault(format!("connect failed: {e}"))),
        };
        let TransportLink { outbound, mut inbound } = link;

        let connect = Envelope::new(Message::Connect(ConnectPayload {
            token: self.config.token.clone(),
            client_id: self.config.client_id.clone(),
        }));
        if outbound.send(connect).await.is_err() {
            return self.handshake_failed(RunEnd::Fault("link closed during handshake".into()));
        }

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            wait_for_connected(&mut inbound),
        )
        .await;
        let connected = match handshake {
            Err(_) => {
                return self.handshake_failed(RunEnd::Fault("handshake timed out".into()));
            }
            Ok(Err(end)) => return self.handshake_failed(end),
            Ok(Ok(payload)) => payload,
        };

        if let Some(tx) = self.first_handshake.take() {
            let _ = tx.send(Ok(()));
        }
        if let Some(backoff) = backoff.as_mut() {
            backoff.reset();
        }
        info!(
            client = %self.config.client_id,
            server_last = connected.server_last_committed_id,
            "connected"
        );
        self.emit(ClientEvent::Connected {
            server_last_committed_id: connected.server_last_committed_id,
        });

        let mut conn = Connection { outbound, syncing: false, buffered: Vec::new() };
        if let Err(end) = self.begin_sync(&mut conn).await {
            return end;
        }

        loop {
            tokio::select! {
                maybe = self.commands.recv() => match maybe {
                    None => return RunEnd::Stopped,
                    Some(Command::Stop(ack)) => {
                        let _ = ack.send(());
                        return RunEnd::Stopped;
                    }
                    Some(command) => {
                        if let Err(end) = self.handle_command(&mut conn, command).await {
                            return end;
                        }
                    }
                },
                maybe = inbound.recv() => match maybe {
                    None => return RunEnd::Fault("transport closed".into()),
                    Some(envelope) => {
                        if let Err(end) = self.handle_message(&mut conn, envelope).await {
                            return end;
                        }
                    }
                },
            }
        }
    }

    /// A handshake failure before the first success also resolves `start()`.
    fn handshake_failed(&mut self, end: RunEnd) -> RunEnd {
        if let Some(tx) = self.first_handshake.take() {
            let reason = match &end {
                RunEnd::Fault(r) | RunEnd::Fatal(r) => r.clone(),
                RunEnd::Stopped => "stopped".into(),
            };
            let _ = tx.send(Err(ClientError::Handshake(reason)));
            // Never connected: no reconnect loop, surface the error instead.
            return RunEnd::Stopped;
        }
        end
    }

    //───────────────────── commands ─────────────────────

    async fn handle_command(
        &mut self,
        conn: &mut Connection,
        command: Command,
    ) -> Result<(), RunEnd> {
        match command {
            Command::Submit(draft) => {
                if conn.syncing {
                    // Sits in the queue; the post-sync flush drains it.
                    return Ok(());
                }
                self.send_submit(conn, &draft).await
            }
            Command::SetPartitions(partitions) => {
                self.partitions = partitions;
                if conn.syncing {
                    return Ok(());
                }
                self.begin_sync(conn).await
            }
            Command::SyncNow | Command::FlushDrafts if conn.syncing => Ok(()),
            Command::SyncNow => self.begin_sync(conn).await,
            Command::FlushDrafts => self.flush_drafts(conn).await,
            Command::Stop(_) => Ok(()),
        }
    }

    //───────────────────── inbound ─────────────────────

    async fn handle_message(
        &mut self,
        conn: &mut Connection,
        envelope: Envelope,
    ) -> Result<(), RunEnd> {
        match envelope.message {
            Message::Connected(payload) => {
                // A fresh handshake mid-session (offline shim attached, or
                // the peer restarted): catch up again.
                self.emit(ClientEvent::Connected {
                    server_last_committed_id: payload.server_last_committed_id,
                });
                if !conn.syncing {
                    self.begin_sync(conn).await?;
                }
                Ok(())
            }
            Message::SyncResponse(page) => {
                let resyncing = self
                    .apply_batch(conn, &page.events, Some(page.next_since_committed_id))
                    .await?;
                if resyncing {
                    return Ok(());
                }
                self.emit(ClientEvent::SyncPage {
                    count: page.events.len(),
                    next_since_committed_id: page.next_since_committed_id,
                });
                if page.has_more {
                    self.send_sync(conn, page.next_since_committed_id).await
                } else {
                    conn.syncing = false;
                    let buffered = std::mem::take(&mut conn.buffered);
                    if !buffered.is_empty() {
                        debug!(count = buffered.len(), "flushing broadcasts buffered during sync");
                        if self.apply_batch(conn, &buffered, None).await? {
                            return Ok(());
                        }
                        for event in &buffered {
                            self.emit(ClientEvent::BroadcastApplied {
                                committed_id: event.committed_id,
                            });
                        }
                    }
                    let cursor = match self.store.load_cursor().await {
                        Ok(cursor) => cursor,
                        Err(e) => return Err(RunEnd::Fault(format!("local store failure: {e}"))),
                    };
                    self.emit(ClientEvent::Synced { cursor });
                    self.flush_drafts(conn).await
                }
            }
            Message::SubmitEventsResult(payload) => {
                for result in payload.results {
                    match self.store.apply_submit_result(&result, &self.config.client_id).await {
                        Ok(()) => {}
                        Err(StoreError::InvariantViolation(msg)) => {
                            self.request_resync(conn, msg).await?;
                        }
                        Err(e) => return Err(RunEnd::Fault(format!("local store failure: {e}"))),
                    }
                    self.emit(ClientEvent::SubmitResult(result));
                }
                Ok(())
            }
            Message::EventBroadcast(event) => {
                if conn.syncing {
                    conn.buffered.push(event);
                    return Ok(());
                }
                let committed_id = event.committed_id;
                if !self.apply_batch(conn, &[event], None).await? {
                    self.emit(ClientEvent::BroadcastApplied { committed_id });
                }
                Ok(())
            }
            Message::Error(payload) => match payload.code {
                ErrorCode::AuthFailed | ErrorCode::ProtocolVersionUnsupported => {
                    Err(RunEnd::Fatal(format!("{}: {}", payload.code, payload.message)))
                }
                ErrorCode::ServerError => {
                    Err(RunEnd::Fault(format!("server_error: {}", payload.message)))
                }
                _ => {
                    warn!(code = %payload.code, "server rejection: {}", payload.message);
                    self.emit(ClientEvent::ServerRejection(payload));
                    Ok(())
                }
            },
            other => {
                warn!("ignoring unexpected inbound message: {other:?}");
                Ok(())
            }
        }
    }

    //───────────────────── sync plumbing ─────────────────────

    async fn begin_sync(&mut self, conn: &mut Connection) -> Result<(), RunEnd> {
        conn.syncing = true;
        let since = match self.store.load_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => return Err(RunEnd::Fault(format!("local store failure: {e}"))),
        };
        self.send_sync(conn, since).await
    }

    async fn send_sync(&mut self, conn: &mut Connection, since: u64) -> Result<(), RunEnd> {
        let envelope = Envelope::new(Message::Sync(SyncPayload {
            partitions: self.partitions.clone(),
            since_committed_id: since,
            limit: Some(self.config.sync_limit),
        }));
        conn.outbound
            .send(envelope)
            .await
            .map_err(|_| RunEnd::Fault("transport closed".into()))
    }

    async fn send_submit(&mut self, conn: &mut Connection, draft: &Draft) -> Result<(), RunEnd> {
        let envelope = Envelope::new(Message::SubmitEvents(draft_to_submit(draft)));
        conn.outbound
            .send(envelope)
            .await
            .map_err(|_| RunEnd::Fault("transport closed".into()))
    }

    /// One `submit_events` per draft in `(draft_clock, id)` order.
    async fn flush_drafts(&mut self, conn: &mut Connection) -> Result<(), RunEnd> {
        let drafts = match self.store.load_drafts_ordered().await {
            Ok(drafts) => drafts,
            Err(e) => return Err(RunEnd::Fault(format!("local store failure: {e}"))),
        };
        if drafts.is_empty() {
            return Ok(());
        }
        debug!(count = drafts.len(), "flushing drafts");
        for draft in &drafts {
            self.send_submit(conn, draft).await?;
        }
        Ok(())
    }

    /// Apply a committed batch; an integrity violation drops the mirror and
    /// restarts the catch-up from zero. `Ok(true)` means a re-sync is now in
    /// flight and the caller should abandon the rest of its handling.
    async fn apply_batch(
        &mut self,
        conn: &mut Connection,
        events: &[CommittedEvent],
        next_cursor: Option<u64>,
    ) -> Result<bool, RunEnd> {
        match self.store.apply_committed_batch(events, next_cursor).await {
            Ok(()) => Ok(false),
            Err(StoreError::InvariantViolation(msg)) => {
                self.request_resync(conn, msg).await?;
                Ok(true)
            }
            Err(e) => Err(RunEnd::Fault(format!("local store failure: {e}"))),
        }
    }

    async fn request_resync(&mut self, conn: &mut Connection, reason: String) -> Result<(), RunEnd> {
        warn!(%reason, "protocol integrity violation, forcing full re-sync");
        self.emit(ClientEvent::ResyncRequired { reason });
        if let Err(e) = self.store.clear_committed().await {
            return Err(RunEnd::Fault(format!("local store failure: {e}")));
        }
        conn.buffered.clear();
        conn.syncing = true;
        self.send_sync(conn, 0).await
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine; lagging subscribers drop old events.
        let _ = self.events.send(event);
    }
}

async fn wait_for_connected(
    inbound: &mut mpsc::Receiver<Envelope>,
) -> Result<insieme_types::wire::ConnectedPayload, RunEnd> {
    loop {
        match inbound.recv().await {
            None => return Err(RunEnd::Fault("transport closed during handshake".into())),
            Some(envelope) => match envelope.message {
                Message::Connected(payload) => return Ok(payload),
                Message::Error(payload) => {
                    return match payload.code {
                        ErrorCode::AuthFailed | ErrorCode::ProtocolVersionUnsupported => {
                            Err(RunEnd::Fatal(format!("{}: {}", payload.code, payload.message)))
                        }
                        _ => Err(RunEnd::Fault(format!("{}: {}", payload.code, payload.message))),
                    }
                }
                other => {
                    debug!("ignoring pre-handshake message: {other:?}");
                }
            },
        }
    }
}

fn draft_to_submit(draft: &Draft) -> insieme_types::wire::SubmitEventsPayload {
    insieme_types::wire::SubmitEventsPayload {
        events: vec![insieme_types::wire::SubmitItem {
            id: draft.id.clone(),
            partitions: draft.partitions.clone(),
            event: draft.event.clone(),
        }],
    }
}
