#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-server** – Authoritative sync server for the Insieme core.
//!
//! The server validates capability tokens, runs one state-machine task per
//! connection, commits events through the injected [`CommittedStore`], and
//! fans committed events out to subscribed peers. Commit order is linearized
//! by the store; the engine replies to the origin and broadcasts strictly
//! after the commit is durable.
//!
//! Transport framing is out of scope: a connection is a pair of envelope
//! channels. [`SyncServer::connect_local`] attaches an in-process connection,
//! which is all tests and embedded deployments need; network gateways own
//! the socket side and forward envelopes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use insieme_auth::{PartitionAuthorizer, TokenVerifier};
use insieme_store_core::CommittedStore;
use insieme_transport::TransportLink;
use insieme_types::EventValidator;

mod hub;
mod session;

pub use hub::{SessionHub, SessionId};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Depth of each session's envelope channels.
    pub channel_depth: usize,
    /// Per-session submit cap within [`ServerConfig::submit_window`];
    /// `None` disables rate limiting.
    pub max_submits_per_window: Option<u32>,
    /// Window for the submit cap.
    pub submit_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_depth: 256,
            max_submits_per_window: None,
            submit_window: Duration::from_secs(60),
        }
    }
}

pub(crate) struct ServerInner {
    pub(crate) store: Arc<dyn CommittedStore>,
    pub(crate) verifier: Arc<dyn TokenVerifier>,
    pub(crate) authorizer: Arc<dyn PartitionAuthorizer>,
    pub(crate) validator: Arc<dyn EventValidator>,
    pub(crate) hub: SessionHub,
    pub(crate) config: ServerConfig,
}

/// The commit & broadcast engine plus its session registry.
#[derive(Clone)]
pub struct SyncServer {
    inner: Arc<ServerInner>,
}

impl SyncServer {
    /// Build a server over injected dependencies.
    pub fn new(
        store: Arc<dyn CommittedStore>,
        verifier: Arc<dyn TokenVerifier>,
        authorizer: Arc<dyn PartitionAuthorizer>,
        validator: Arc<dyn EventValidator>,
        config: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                store,
                verifier,
                authorizer,
                validator,
                hub: SessionHub::default(),
                config,
            }),
        }
    }

    /// Attach one in-process connection and spawn its session task.
    ///
    /// The returned link is the client's side: `outbound` feeds the session,
    /// `inbound` carries replies and broadcasts. Dropping `outbound` ends
    /// the session.
    pub fn connect_local(&self) -> TransportLink {
        let depth = self.inner.config.channel_depth;
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let id = Uuid::new_v4();
        let handle = self.inner.hub.register(id, outbound_tx.clone());
        let session = session::Session::new(id, Arc::clone(&self.inner), handle, outbound_tx);
        tokio::spawn(session.run(inbound_rx));
        TransportLink { outbound: inbound_tx, inbound: outbound_rx }
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.hub.session_count()
    }
}
