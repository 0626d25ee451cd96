#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-transport** – Message-passing transport abstraction for the
//! Insieme sync core.
//!
//! Transport framing (WebSocket, long polling, …) is out of scope for the
//! core; both engines speak [`Envelope`] values over a pair of channels. This
//! crate defines that contract, an in-process implementation for tests and
//! embedded deployments, and the offline-capable shim a client may use before
//! a network transport exists.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;

use insieme_types::Envelope;

mod offline;
pub use offline::{OfflineConfig, OfflineTransport};

/// Default channel depth for transport links.
pub const DEFAULT_CHANNEL_DEPTH: usize = 256;

/// One established connection: a send half and a receive half.
///
/// Dropping either half (or the peer dropping its ends) is the transport
/// fault signal; there is no separate disconnect message.
#[derive(Debug)]
pub struct TransportLink {
    /// Client → server messages.
    pub outbound: mpsc::Sender<Envelope>,
    /// Server → client messages.
    pub inbound: mpsc::Receiver<Envelope>,
}

/// Errors surfaced by transport implementations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or refused the connection.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// The link closed while sending.
    #[error("link closed")]
    Closed,
}

/// Connection factory used by the client engine.
///
/// Each `connect` call yields a fresh link; reconnection is the caller's
/// policy, not the transport's.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a new link.
    async fn connect(&self) -> Result<TransportLink, TransportError>;
}

/// In-process transport built from a connect closure.
///
/// The closure typically calls a server's local-attach entry point and
/// returns the resulting channel pair.
pub struct ChannelTransport<F> {
    connect_fn: F,
}

impl<F> ChannelTransport<F> {
    /// Wrap a connect closure.
    pub fn new(connect_fn: F) -> Self {
        Self { connect_fn }
    }
}

#[async_trait]
impl<F, Fut> Transport for ChannelTransport<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportLink, TransportError>> + Send,
{
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        (self.connect_fn)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insieme_types::wire::{ConnectPayload, Message};

    #[tokio::test]
    async fn channel_transport_invokes_factory_per_connect() {
        let transport = ChannelTransport::new(|| async {
            let (outbound, mut server_rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
            let (server_tx, inbound) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
            tokio::spawn(async move {
                // Echo server: bounce every envelope back.
                while let Some(envelope) = server_rx.recv().await {
                    if server_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
            });
            Ok(TransportLink { outbound, inbound })
        });

        let mut link = transport.connect().await.unwrap();
        let envelope = Envelope::new(Message::Connect(ConnectPayload {
            token: "t".into(),
            client_id: "c".into(),
        }));
        link.outbound.send(envelope.clone()).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), envelope);
    }
}
