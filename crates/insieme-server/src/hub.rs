//! Partition-aware session hub.
//!
//! The hub keeps one handle per active session and fans committed events out
//! to every peer whose current subscription intersects the event's
//! partitions. Two delivery rules live here: the origin session never gets a
//! broadcast for its own item, and a session with a sync cycle in progress
//! gets nothing until the cycle ends – deferred events flush right after the
//! final page.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use insieme_types::wire::Message;
use insieme_types::{canonical, CommittedEvent, Envelope};

/// Opaque per-connection identifier.
pub type SessionId = Uuid;

#[derive(Debug, Default)]
struct DeliveryGate {
    subscription: Vec<String>,
    syncing: bool,
    deferred: Vec<CommittedEvent>,
}

/// Hub-side view of one session.
///
/// Broadcast delivery is non-blocking: a session whose outbound channel is
/// full loses the broadcast (it will observe the event on its next sync
/// cycle instead).
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::Sender<Envelope>,
    gate: Mutex<DeliveryGate>,
}

impl SessionHandle {
    fn new(id: SessionId, outbound: mpsc::Sender<Envelope>) -> Self {
        Self { id, outbound, gate: Mutex::new(DeliveryGate::default()) }
    }

    /// Start a sync cycle: replace the subscription and suppress broadcasts.
    pub fn begin_sync(&self, subscription: Vec<String>) {
        if let Ok(mut gate) = self.gate.lock() {
            gate.subscription = subscription;
            gate.syncing = true;
        }
    }

    /// Update the subscription mid-cycle (a later page named new partitions).
    pub fn set_subscription(&self, subscription: Vec<String>) {
        if let Ok(mut gate) = self.gate.lock() {
            gate.subscription = subscription;
        }
    }

    /// End the sync cycle and flush every deferred broadcast.
    pub fn end_sync(&self) {
        let deferred = match self.gate.lock() {
            Ok(mut gate) => {
                gate.syncing = false;
                std::mem::take(&mut gate.deferred)
            }
            Err(_) => Vec::new(),
        };
        for event in deferred {
            self.push(event);
        }
    }

    fn deliver(&self, event: &CommittedEvent) {
        let Ok(mut gate) = self.gate.lock() else { return };
        if !canonical::intersects(&gate.subscription, &event.partitions) {
            return;
        }
        if gate.syncing {
            gate.deferred.push(event.clone());
            return;
        }
        drop(gate);
        self.push(event.clone());
    }

    fn push(&self, event: CommittedEvent) {
        let envelope = Envelope::new(Message::EventBroadcast(event));
        if self.outbound.try_send(envelope).is_err() {
            warn!(session = %self.id, "broadcast dropped: outbound channel full or closed");
        }
    }
}

/// Registry of active sessions.
#[derive(Debug, Default)]
pub struct SessionHub {
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionHub {
    /// Register a new session and return its hub handle.
    pub fn register(&self, id: SessionId, outbound: mpsc::Sender<Envelope>) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(id, outbound));
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, Arc::clone(&handle));
        }
        handle
    }

    /// Drop a closed session.
    pub fn unregister(&self, id: SessionId) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
        }
        debug!(session = %id, "session unregistered");
    }

    /// Fan a committed event out to every other subscribed session.
    pub fn broadcast(&self, origin: SessionId, event: &CommittedEvent) {
        let handles: Vec<Arc<SessionHandle>> = match self.sessions.lock() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(id, _)| **id != origin)
                .map(|(_, handle)| Arc::clone(handle))
                .collect(),
            Err(_) => return,
        };
        for handle in handles {
            handle.deliver(event);
        }
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use insieme_types::EventBody;

    fn event(committed_id: u64, partitions: &[&str]) -> CommittedEvent {
        CommittedEvent {
            committed_id,
            id: format!("e{committed_id}"),
            client_id: "c".into(),
            partitions: partitions.iter().map(|s| s.to_string()).collect(),
            event: EventBody::new("event", serde_json::json!({})),
            status_updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn broadcast_skips_origin_and_non_subscribers() {
        let hub = SessionHub::default();
        let origin = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let (origin_tx, mut origin_rx) = mpsc::channel(8);
        let (peer_tx, mut peer_rx) = mpsc::channel(8);
        let (stranger_tx, mut stranger_rx) = mpsc::channel(8);

        let origin_handle = hub.register(origin, origin_tx);
        let peer_handle = hub.register(peer, peer_tx);
        let stranger_handle = hub.register(stranger, stranger_tx);

        origin_handle.begin_sync(vec!["p1".into()]);
        origin_handle.end_sync();
        peer_handle.begin_sync(vec!["p1".into()]);
        peer_handle.end_sync();
        stranger_handle.begin_sync(vec!["other".into()]);
        stranger_handle.end_sync();

        hub.broadcast(origin, &event(1, &["p1"]));

        let delivered = peer_rx.try_recv().unwrap();
        assert!(matches!(delivered.message, Message::EventBroadcast(e) if e.committed_id == 1));
        assert!(origin_rx.try_recv().is_err());
        assert!(stranger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mid_sync_broadcasts_are_deferred_until_end_of_cycle() {
        let hub = SessionHub::default();
        let origin = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let (peer_tx, mut peer_rx) = mpsc::channel(8);
        let handle = hub.register(peer, peer_tx);

        handle.begin_sync(vec!["p1".into()]);
        hub.broadcast(origin, &event(5, &["p1"]));
        assert!(peer_rx.try_recv().is_err());

        handle.end_sync();
        let delivered = peer_rx.try_recv().unwrap();
        assert!(matches!(delivered.message, Message::EventBroadcast(e) if e.committed_id == 5));
    }

    #[tokio::test]
    async fn unregistered_session_receives_nothing() {
        let hub = SessionHub::default();
        let peer = Uuid::new_v4();
        let (peer_tx, mut peer_rx) = mpsc::channel(8);
        let handle = hub.register(peer, peer_tx);
        handle.begin_sync(vec!["p1".into()]);
        handle.end_sync();
        hub.unregister(peer);

        hub.broadcast(Uuid::new_v4(), &event(1, &["p1"]));
        assert!(peer_rx.try_recv().is_err());
        assert_eq!(hub.session_count(), 0);
    }
}
