//! Offline-capable transport shim.
//!
//! Lets a client run its full lifecycle with no network: `connect` and
//! `sync` are answered locally, submits are buffered. Once an online link is
//! attached the shim replays the handshake and drains the buffer in
//! insertion order, so the client engine never needs to know it started
//! offline.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use insieme_types::wire::{ConnectedPayload, Message, SyncResponsePayload};
use insieme_types::{Envelope, ProtocolError};

use crate::{Transport, TransportError, TransportLink, DEFAULT_CHANNEL_DEPTH};

/// Shim configuration.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// `server_last_committed_id` reported by local `connected` replies.
    pub server_last_committed_id: u64,
    /// Maximum buffered `submit_events` envelopes before `rate_limited`.
    pub buffer_cap: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { server_last_committed_id: 0, buffer_cap: 1024 }
    }
}

/// Offline-first transport: local replies until an online link is attached.
///
/// Supports one client connection; [`OfflineTransport::attach_online`] may be
/// called at any time after construction.
pub struct OfflineTransport {
    config: OfflineConfig,
    attach_tx: mpsc::Sender<TransportLink>,
    attach_rx: Mutex<Option<mpsc::Receiver<TransportLink>>>,
}

impl OfflineTransport {
    /// Create a shim with the given configuration.
    pub fn new(config: OfflineConfig) -> Self {
        let (attach_tx, attach_rx) = mpsc::channel(1);
        Self { config, attach_tx, attach_rx: Mutex::new(Some(attach_rx)) }
    }

    /// Attach an established online link.
    ///
    /// The shim replays the last `connect` envelope and, once the peer
    /// answers `connected`, drains buffered submits in insertion order.
    pub async fn attach_online(&self, link: TransportLink) -> Result<(), TransportError> {
        self.attach_tx.send(link).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for OfflineTransport {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let attach_rx = self
            .attach_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::ConnectFailed("shim already connected".into()))?;

        let (client_outbound_tx, client_outbound_rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
        let (client_inbound_tx, client_inbound_rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
        let shim = Shim {
            config: self.config.clone(),
            to_client: client_inbound_tx,
            from_client: client_outbound_rx,
            attach_rx,
            last_connect: None,
            buffered: VecDeque::new(),
            online: None,
            awaiting_online_connected: false,
        };
        tokio::spawn(shim.run());
        Ok(TransportLink { outbound: client_outbound_tx, inbound: client_inbound_rx })
    }
}

struct Shim {
    config: OfflineConfig,
    to_client: mpsc::Sender<Envelope>,
    from_client: mpsc::Receiver<Envelope>,
    attach_rx: mpsc::Receiver<TransportLink>,
    last_connect: Option<Envelope>,
    buffered: VecDeque<Envelope>,
    online: Option<TransportLink>,
    awaiting_online_connected: bool,
}

impl Shim {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe = self.from_client.recv() => match maybe {
                    None => break,
                    Some(envelope) => {
                        if self.on_client(envelope).await.is_err() {
                            break;
                        }
                    }
                },
                maybe = self.attach_rx.recv() => {
                    if let Some(link) = maybe {
                        self.on_attach(link).await;
                    }
                },
                maybe = recv_online(&mut self.online) => match maybe {
                    None => {
                        debug!("online link closed, shim back to local replies");
                        self.online = None;
                        self.awaiting_online_connected = false;
                    }
                    Some(envelope) => {
                        if self.on_online(envelope).await.is_err() {
                            break;
                        }
                    }
                },
            }
        }
    }

    /// Err means the client side is gone and the task should end.
    async fn on_client(&mut self, envelope: Envelope) -> Result<(), ()> {
        if self.online.is_some() {
            // Until the replayed handshake completes, submits keep queueing
            // behind the already-buffered ones so insertion order survives.
            if self.awaiting_online_connected
                && matches!(envelope.message, Message::SubmitEvents(_))
            {
                return self.buffer_submit(envelope).await;
            }
            if matches!(envelope.message, Message::Connect(_)) {
                self.last_connect = Some(envelope.clone());
            }
            let sent = match &self.online {
                Some(link) => link.outbound.send(envelope).await.is_ok(),
                None => true,
            };
            if !sent {
                warn!("online link rejected send, shim back to local replies");
                self.online = None;
                self.awaiting_online_connected = false;
            }
            return Ok(());
        }

        match &envelope.message {
            Message::Connect(payload) => {
                let reply = Message::Connected(ConnectedPayload {
                    client_id: payload.client_id.clone(),
                    server_last_committed_id: self.config.server_last_committed_id,
                });
                self.last_connect = Some(envelope.clone());
                self.reply(reply).await
            }
            Message::Sync(payload) => {
                let reply = Message::SyncResponse(SyncResponsePayload {
                    partitions: payload.partitions.clone(),
                    events: Vec::new(),
                    next_since_committed_id: payload.since_committed_id,
                    has_more: false,
                });
                self.reply(reply).await
            }
            Message::SubmitEvents(_) => self.buffer_submit(envelope).await,
            _ => {
                let err = ProtocolError::bad_request("unexpected message for offline shim");
                self.reply(Message::Error(err.to_payload())).await
            }
        }
    }

    async fn buffer_submit(&mut self, envelope: Envelope) -> Result<(), ()> {
        if self.buffered.len() >= self.config.buffer_cap {
            let err = ProtocolError::rate_limited("offline submit buffer full");
            return self.reply(Message::Error(err.to_payload())).await;
        }
        self.buffered.push_back(envelope);
        Ok(())
    }

    async fn on_attach(&mut self, link: TransportLink) {
        debug!("online transport attached, replaying handshake");
        self.online = Some(link);
        if let Some(connect) = self.last_connect.clone() {
            self.awaiting_online_connected = true;
            let sent = match &self.online {
                Some(online) => online.outbound.send(connect).await.is_ok(),
                None => false,
            };
            if !sent {
                self.online = None;
                self.awaiting_online_connected = false;
            }
        }
    }

    async fn on_online(&mut self, envelope: Envelope) -> Result<(), ()> {
        let completes_handshake =
            self.awaiting_online_connected && matches!(envelope.message, Message::Connected(_));
        self.to_client.send(envelope).await.map_err(|_| ())?;
        if completes_handshake {
            self.awaiting_online_connected = false;
            while let Some(buffered) = self.buffered.pop_front() {
                let sent = match &self.online {
                    Some(online) => online.outbound.send(buffered).await.is_ok(),
                    None => false,
                };
                if !sent {
                    self.online = None;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn reply(&self, message: Message) -> Result<(), ()> {
        self.to_client.send(Envelope::new(message)).await.map_err(|_| ())
    }
}

async fn recv_online(online: &mut Option<TransportLink>) -> Option<Envelope> {
    match online {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insieme_types::wire::{
        ConnectPayload, SubmitEventsPayload, SubmitItem, SyncPayload,
    };
    use insieme_types::{ErrorCode, EventBody};
    use serde_json::json;

    fn connect_envelope(client_id: &str) -> Envelope {
        Envelope::new(Message::Connect(ConnectPayload {
            token: client_id.to_string(),
            client_id: client_id.to_string(),
        }))
    }

    fn submit_envelope(id: &str) -> Envelope {
        Envelope::new(Message::SubmitEvents(SubmitEventsPayload {
            events: vec![SubmitItem {
                id: id.into(),
                partitions: vec!["p1".into()],
                event: EventBody::new("event", json!({"n": id})),
            }],
        }))
    }

    #[tokio::test]
    async fn offline_connect_and_sync_answer_locally() {
        let shim = OfflineTransport::new(OfflineConfig {
            server_last_committed_id: 7,
            buffer_cap: 4,
        });
        let mut link = shim.connect().await.unwrap();

        link.outbound.send(connect_envelope("c1")).await.unwrap();
        let reply = link.inbound.recv().await.unwrap();
        match reply.message {
            Message::Connected(payload) => {
                assert_eq!(payload.client_id, "c1");
                assert_eq!(payload.server_last_committed_id, 7);
            }
            other => panic!("expected connected, got {other:?}"),
        }

        link.outbound
            .send(Envelope::new(Message::Sync(SyncPayload {
                partitions: vec!["p1".into()],
                since_committed_id: 3,
                limit: None,
            })))
            .await
            .unwrap();
        let reply = link.inbound.recv().await.unwrap();
        match reply.message {
            Message::SyncResponse(payload) => {
                assert!(payload.events.is_empty());
                assert!(!payload.has_more);
                assert_eq!(payload.next_since_committed_id, 3);
            }
            other => panic!("expected sync_response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn over_cap_submits_are_rate_limited() {
        let shim = OfflineTransport::new(OfflineConfig {
            server_last_committed_id: 0,
            buffer_cap: 1,
        });
        let mut link = shim.connect().await.unwrap();

        link.outbound.send(submit_envelope("e1")).await.unwrap();
        link.outbound.send(submit_envelope("e2")).await.unwrap();
        let reply = link.inbound.recv().await.unwrap();
        match reply.message {
            Message::Error(payload) => assert_eq!(payload.code, ErrorCode::RateLimited),
            other => panic!("expected rate_limited error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attach_replays_connect_then_drains_buffer_in_order() {
        let shim = OfflineTransport::new(OfflineConfig::default());
        let mut link = shim.connect().await.unwrap();

        link.outbound.send(connect_envelope("c1")).await.unwrap();
        let _local_connected = link.inbound.recv().await.unwrap();
        link.outbound.send(submit_envelope("e1")).await.unwrap();
        link.outbound.send(submit_envelope("e2")).await.unwrap();

        // Fake online peer.
        let (online_outbound, mut peer_rx) = mpsc::channel(16);
        let (peer_tx, online_inbound) = mpsc::channel(16);
        shim.attach_online(TransportLink { outbound: online_outbound, inbound: online_inbound })
            .await
            .unwrap();

        // Handshake replay arrives first.
        let replayed = peer_rx.recv().await.unwrap();
        assert!(matches!(replayed.message, Message::Connect(_)));

        // Peer confirms; the buffer drains in insertion order.
        peer_tx
            .send(Envelope::new(Message::Connected(ConnectedPayload {
                client_id: "c1".into(),
                server_last_committed_id: 0,
            })))
            .await
            .unwrap();

        let first = peer_rx.recv().await.unwrap();
        let second = peer_rx.recv().await.unwrap();
        let id_of = |env: &Envelope| match &env.message {
            Message::SubmitEvents(p) => p.events[0].id.clone(),
            other => panic!("expected submit, got {other:?}"),
        };
        assert_eq!(id_of(&first), "e1");
        assert_eq!(id_of(&second), "e2");

        // The client sees the online connected.
        let forwarded = link.inbound.recv().await.unwrap();
        assert!(matches!(forwarded.message, Message::Connected(_)));
    }
}
