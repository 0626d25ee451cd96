#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-client** – Optimistic sync client for the Insieme core.
//!
//! The client persists drafts locally first, catches up with the server page
//! by page, flushes the draft queue once caught up, and applies broadcasts
//! as they arrive – buffering any that land mid-sync. A reconnect policy
//! with capped exponential backoff and jitter covers transport faults and
//! `server_error`; authentication and protocol-version failures never retry.
//!
//! All inbound traffic is handled by a single engine task, one message at a
//! time, so handlers never observe each other mid-flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use insieme_store_core::{LocalStore, NewDraft, StoreError};
use insieme_transport::{Transport, TransportError};
use insieme_types::wire::{ErrorPayload, SubmitItem, SubmitResult};
use insieme_types::{
    canonical, Draft, EventBody, EventValidator, ProtocolError, ValidationContext,
    DEFAULT_SYNC_LIMIT, MAX_SYNC_LIMIT,
};

mod backoff;
mod engine;

pub use backoff::ReconnectPolicy;

use engine::{Command, Engine};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stable client identifier; must match the token subject.
    pub client_id: String,
    /// Capability token presented on `connect`.
    pub token: String,
    /// Initial partition subscription (normalized at construction).
    pub partitions: Vec<String>,
    /// Bound on the wait for `connected`.
    pub handshake_timeout: Duration,
    /// Page size for catch-up, clamped to `[1, 1000]`.
    pub sync_limit: u32,
    /// Reconnect policy; `None` disables reconnection.
    pub reconnect: Option<ReconnectPolicy>,
}

impl ClientConfig {
    /// Configuration with the default timeouts and page size.
    pub fn new(
        client_id: impl Into<String>,
        token: impl Into<String>,
        partitions: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            token: token.into(),
            partitions,
            handshake_timeout: Duration::from_secs(5),
            sync_limit: DEFAULT_SYNC_LIMIT,
            reconnect: Some(ReconnectPolicy::default()),
        }
    }
}

/// Notifications emitted by the engine.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed.
    Connected {
        /// Server high-water mark at handshake time.
        server_last_committed_id: u64,
    },
    /// One catch-up page was applied.
    SyncPage {
        /// Events on the page.
        count: usize,
        /// Cursor after the page.
        next_since_committed_id: u64,
    },
    /// Catch-up finished; drafts flush next.
    Synced {
        /// Durable cursor after the cycle.
        cursor: u64,
    },
    /// One submit result was applied to the local store.
    SubmitResult(SubmitResult),
    /// A broadcast event was applied to the committed mirror.
    BroadcastApplied {
        /// The event's committed id.
        committed_id: u64,
    },
    /// A non-fatal server rejection arrived (connection stays open).
    ServerRejection(ErrorPayload),
    /// The connection dropped; a reconnect may follow.
    Disconnected {
        /// Human-readable fault description.
        reason: String,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        /// 1-based attempt counter.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Mirror integrity violation detected; a full re-sync is in flight.
    ResyncRequired {
        /// What the store observed.
        reason: String,
    },
    /// The engine ended (after `stop()` or exhausted reconnects).
    Stopped,
}

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client is not running (or was stopped mid-wait).
    #[error("client stopped")]
    Stopped,
    /// `start()` called while the engine is already running.
    #[error("client already started")]
    AlreadyStarted,
    /// Handshake failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Local store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Protocol-level rejection (e.g. invalid partition set).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Offline-first sync client.
///
/// `submit_event` always lands in the local draft queue first; the engine
/// submits immediately when online and idle, otherwise the draft waits for
/// the flush that follows the next completed sync cycle.
pub struct SyncClient {
    config: ClientConfig,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    validator: Option<Arc<dyn EventValidator>>,
    events: broadcast::Sender<ClientEvent>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl SyncClient {
    /// Build a client over a transport and a local store.
    ///
    /// The configured partition set is normalized here; an invalid set is a
    /// construction error surfaced on [`SyncClient::start`].
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
        config: ClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { config, store, transport, validator: None, events, commands: Mutex::new(None) }
    }

    /// Install a local pre-commit validator for `submit_event`.
    pub fn with_validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Connect and handshake; returns once `connected` arrives or the
    /// handshake times out.
    pub async fn start(&self) -> Result<(), ClientError> {
        let mut commands = self.commands.lock().await;
        if commands.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let mut config = self.config.clone();
        config.partitions = canonical::normalize_partitions(&config.partitions)?;
        config.sync_limit = config.sync_limit.clamp(1, MAX_SYNC_LIMIT);

        let (command_tx, command_rx) = mpsc::channel(256);
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let engine = Engine::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.events.clone(),
            command_rx,
            handshake_tx,
        );
        tokio::spawn(engine.run());
        *commands = Some(command_tx);
        drop(commands);

        match handshake_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.commands.lock().await.take();
                Err(err)
            }
            // Engine died without reporting: treat as stopped.
            Err(_) => {
                self.commands.lock().await.take();
                Err(ClientError::Stopped)
            }
        }
    }

    /// Stop the engine: abort pending waits and disconnect.
    pub async fn stop(&self) {
        let command_tx = self.commands.lock().await.take();
        if let Some(command_tx) = command_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if command_tx.send(Command::Stop(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
    }

    /// Create a draft: persist locally, then submit when the engine is
    /// online and not syncing.
    ///
    /// Returns the stored draft with its assigned `draft_clock`.
    pub async fn submit_event(
        &self,
        id: impl Into<String>,
        partitions: Vec<String>,
        event: EventBody,
    ) -> Result<Draft, ClientError> {
        let id = id.into();
        let partitions = canonical::normalize_partitions(&partitions)?;

        if let Some(validator) = &self.validator {
            let item = SubmitItem {
                id: id.clone(),
                partitions: partitions.clone(),
                event: event.clone(),
            };
            let ctx = ValidationContext { client_id: &self.config.client_id };
            validator.validate(&item, &ctx)?;
        }

        let draft = self
            .store
            .insert_draft(NewDraft {
                id,
                client_id: self.config.client_id.clone(),
                partitions,
                event,
                created_at: Utc::now(),
            })
            .await?;

        if let Some(command_tx) = self.commands.lock().await.as_ref() {
            // Engine gone just means the draft waits for the next flush.
            let _ = command_tx.send(Command::Submit(draft.clone())).await;
        }
        Ok(draft)
    }

    /// Replace the partition subscription; takes effect with the next sync.
    pub async fn set_partitions(&self, partitions: Vec<String>) -> Result<(), ClientError> {
        let partitions = canonical::normalize_partitions(&partitions)?;
        self.send_command(Command::SetPartitions(partitions)).await
    }

    /// Start a sync cycle now (no-op while one is already running).
    pub async fn sync_now(&self) -> Result<(), ClientError> {
        self.send_command(Command::SyncNow).await
    }

    /// Flush the draft queue now (no-op while a sync is running).
    pub async fn flush_drafts(&self) -> Result<(), ClientError> {
        self.send_command(Command::FlushDrafts).await
    }

    async fn send_command(&self, command: Command) -> Result<(), ClientError> {
        let commands = self.commands.lock().await;
        let Some(command_tx) = commands.as_ref() else {
            return Err(ClientError::Stopped);
        };
        command_tx.send(command).await.map_err(|_| ClientError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_protocol() {
        let config = ClientConfig::new("c1", "token", vec!["p1".into()]);
        assert_eq!(config.sync_limit, DEFAULT_SYNC_LIMIT);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert!(config.reconnect.is_some());
    }

    #[tokio::test]
    async fn commands_fail_once_stopped() {
        let transport = Arc::new(insieme_transport::OfflineTransport::new(Default::default()));
        let store = Arc::new(insieme_store_memory::MemoryLocalStore::new());
        let client = SyncClient::new(transport, store, ClientConfig::new("c", "t", vec!["p".into()]));
        assert!(matches!(client.sync_now().await, Err(ClientError::Stopped)));
        assert!(matches!(client.flush_drafts().await, Err(ClientError::Stopped)));
    }

    #[tokio::test]
    async fn submit_event_queues_draft_even_while_stopped() {
        let transport = Arc::new(insieme_transport::OfflineTransport::new(Default::default()));
        let store = Arc::new(insieme_store_memory::MemoryLocalStore::new());
        let client = SyncClient::new(
            transport,
            Arc::clone(&store) as Arc<dyn LocalStore>,
            ClientConfig::new("c", "t", vec!["p".into()]),
        );
        let draft = client
            .submit_event("e1", vec!["p".into()], EventBody::new("event", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(draft.draft_clock, 1);
        assert_eq!(store.draft_count().await, 1);
    }

    #[tokio::test]
    async fn submit_event_rejects_invalid_partitions() {
        let transport = Arc::new(insieme_transport::OfflineTransport::new(Default::default()));
        let store = Arc::new(insieme_store_memory::MemoryLocalStore::new());
        let client = SyncClient::new(transport, store, ClientConfig::new("c", "t", vec!["p".into()]));
        let err = client
            .submit_event("e1", vec![], EventBody::new("event", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
