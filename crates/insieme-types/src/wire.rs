//! Wire envelope and message enumeration.
//!
//! Every message in both directions is an [`Envelope`]: a `type` tag, the
//! mandatory `protocol_version`, optional trace fields, and a `payload`
//! object. Transport framing is out of scope; envelopes travel over an
//! abstract message-passing channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CommittedEvent, ErrorCode, EventBody, ProtocolError, PROTOCOL_VERSION};

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// Transport-level wrapper carried by every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version; mismatch yields `protocol_version_unsupported`.
    pub protocol_version: String,
    /// Opaque trace id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    /// Sender wall-clock in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Typed message (`type` + `payload` on the wire).
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with the current protocol version and no trace fields.
    pub fn new(message: Message) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            msg_id: None,
            timestamp: None,
            message,
        }
    }

    /// Check the envelope version, mapping a mismatch to the wire error.
    pub fn ensure_version(&self) -> Result<(), ProtocolError> {
        if self.protocol_version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(ProtocolError::version_unsupported(format!(
                "protocol version {} is not supported (expected {})",
                self.protocol_version, PROTOCOL_VERSION
            )))
        }
    }
}

//─────────────────────────────
//  Messages
//─────────────────────────────

/// All wire messages, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Client → server: authenticate and bind the connection to a client id.
    Connect(ConnectPayload),
    /// Client → server: submit exactly one event for commit (core profile).
    SubmitEvents(SubmitEventsPayload),
    /// Client → server: request one catch-up page.
    Sync(SyncPayload),
    /// Server → client: handshake acknowledgement.
    Connected(ConnectedPayload),
    /// Server → client: per-item commit results.
    SubmitEventsResult(SubmitEventsResultPayload),
    /// Server → client: fan-out of a committed event.
    EventBroadcast(CommittedEvent),
    /// Server → client: one catch-up page.
    SyncResponse(SyncResponsePayload),
    /// Either direction: protocol failure.
    Error(ErrorPayload),
}

/// `connect` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    /// Bearer token; identity must match `client_id`.
    pub token: String,
    /// Claimed client identifier.
    pub client_id: String,
}

/// One item in a `submit_events` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitItem {
    /// Client-generated globally unique event id.
    pub id: String,
    /// Requested partition set (normalized by the server).
    pub partitions: Vec<String>,
    /// Opaque domain event.
    pub event: EventBody,
}

/// `submit_events` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitEventsPayload {
    /// Submitted items; exactly one in the core profile.
    pub events: Vec<SubmitItem>,
}

/// `sync` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Partition subscription for this cycle and subsequent broadcasts.
    pub partitions: Vec<String>,
    /// Exclusive lower bound for the page.
    pub since_committed_id: u64,
    /// Requested page size; clamped to `[1, 1000]`, default 500.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// `connected` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Authenticated client id.
    pub client_id: String,
    /// Highest committed id at handshake time.
    pub server_last_committed_id: u64,
}

/// Status of one submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Durably committed (fresh or dedup hit).
    Committed,
    /// Rejected; `reason` carries the code.
    Rejected,
}

/// Per-item result inside `submit_events_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    /// Event id the result refers to.
    pub id: String,
    /// Commit outcome.
    pub status: SubmitStatus,
    /// Assigned (or existing, on dedup) committed id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_id: Option<u64>,
    /// Commit timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<DateTime<Utc>>,
    /// Rejection code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorCode>,
    /// Optional rejection details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl SubmitResult {
    /// Result for a committed (or deduped) item.
    pub fn committed(event: &CommittedEvent) -> Self {
        Self {
            id: event.id.clone(),
            status: SubmitStatus::Committed,
            committed_id: Some(event.committed_id),
            status_updated_at: Some(event.status_updated_at),
            reason: None,
            errors: None,
        }
    }

    /// Result for a rejected item.
    pub fn rejected(id: impl Into<String>, err: &ProtocolError) -> Self {
        Self {
            id: id.into(),
            status: SubmitStatus::Rejected,
            committed_id: None,
            status_updated_at: None,
            reason: Some(err.code),
            errors: Some(vec![err.message.clone()]),
        }
    }
}

/// `submit_events_result` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitEventsResultPayload {
    /// Exactly one entry in the core profile.
    pub results: Vec<SubmitResult>,
}

/// `sync_response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    /// Normalized subscription the page was computed for.
    pub partitions: Vec<String>,
    /// Matching events in ascending `committed_id` order.
    pub events: Vec<CommittedEvent>,
    /// Cursor for the next page (input `since` if the page is empty).
    pub next_since_committed_id: u64,
    /// Whether more matching events exist within the cycle window.
    pub has_more: bool,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Closed-set error code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
