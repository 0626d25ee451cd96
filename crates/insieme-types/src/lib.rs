#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **insieme-types** – Shared primitive data structures for the Insieme sync core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the event data model, the wire envelope, the closed error
//! taxonomy, and the canonical equality forms. It makes no assumptions about
//! I/O, transport framing, or storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Protocol constants
//─────────────────────────────

/// Wire protocol version carried on every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum number of partitions a single event may carry (after dedup).
pub const MAX_PARTITIONS_PER_EVENT: usize = 64;

/// Maximum byte length of a single partition label.
pub const MAX_PARTITION_LEN: usize = 128;

/// Default page size for sync catch-up.
pub const DEFAULT_SYNC_LIMIT: u32 = 500;

/// Upper clamp for a client-requested sync page size.
pub const MAX_SYNC_LIMIT: u32 = 1000;

/// Number of items allowed in one `submit_events` request (core profile).
pub const MAX_SUBMIT_ITEMS: usize = 1;

//─────────────────────────────
//  Canonical forms & behaviour traits
//─────────────────────────────

/// Deterministic partition normalization and canonical JSON serialization.
pub mod canonical;

/// Injected validation and reducer contracts shared by server and client.
pub mod traits;
pub use traits::{AcceptAll, EventValidator, Reducer, ValidationContext};

/// Wire envelope and message enumeration.
pub mod wire;
pub use wire::{
    ConnectPayload, ConnectedPayload, Envelope, ErrorPayload, Message, SubmitEventsPayload,
    SubmitEventsResultPayload, SubmitItem, SubmitResult, SubmitStatus, SyncPayload,
    SyncResponsePayload,
};

//─────────────────────────────
//  Event data model
//─────────────────────────────

/// Opaque domain event carried inside drafts and committed events.
///
/// The core never interprets `payload`; domain semantics live behind the
/// injected [`EventValidator`] and out-of-core reducers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    /// Envelope kind, e.g. `event`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Domain payload, opaque to the core.
    pub payload: serde_json::Value,
}

impl EventBody {
    /// Convenience constructor.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { kind: kind.into(), payload }
    }
}

/// A locally persisted intended event awaiting commit.
///
/// `draft_clock` is assigned by the local store on insert and never
/// transmitted; it only orders the flush queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    /// Per-client monotonic insertion clock (local only).
    pub draft_clock: u64,
    /// Client-generated globally unique event id (dedup key).
    pub id: String,
    /// Originating client identifier.
    pub client_id: String,
    /// Normalized partition set.
    pub partitions: Vec<String>,
    /// Opaque domain event.
    pub event: EventBody,
    /// Local creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An event the server has durably stored with a `committed_id`.
///
/// `committed_id` is the canonical total order; `id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    /// Server-assigned, globally monotonic positive integer.
    pub committed_id: u64,
    /// Client-generated globally unique event id (dedup key).
    pub id: String,
    /// Originating client identifier.
    pub client_id: String,
    /// Normalized partition set.
    pub partitions: Vec<String>,
    /// Opaque domain event.
    pub event: EventBody,
    /// Server timestamp of the commit.
    pub status_updated_at: DateTime<Utc>,
}

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Closed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unauthenticated or identity mismatch. Closes the connection.
    AuthFailed,
    /// Envelope carries an unsupported protocol version. Closes the connection.
    ProtocolVersionUnsupported,
    /// Malformed envelope, unknown type, or shape violation. Connection stays open.
    BadRequest,
    /// Authorization denied for the requested partitions. Connection stays open.
    Forbidden,
    /// Domain validation failure or dedup conflict. Connection stays open.
    ValidationFailed,
    /// Rate or size limit breached. Connection stays open.
    RateLimited,
    /// Unexpected internal fault. Closes the connection.
    ServerError,
}

impl ErrorCode {
    /// Whether the server closes the connection after emitting this code.
    ///
    /// `rate_limited` keeps the connection open in this implementation.
    pub fn closes_connection(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed | ErrorCode::ProtocolVersionUnsupported | ErrorCode::ServerError
        )
    }

    /// Stable wire string for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::ProtocolVersionUnsupported => "protocol_version_unsupported",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed protocol failure carrying one of the closed wire codes.
///
/// Mapping to the wire `error` payload is a single function
/// ([`ProtocolError::to_payload`]); everything upstream matches on the code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable detail (never interpreted by peers).
    pub message: String,
}

impl ProtocolError {
    /// Build an error with an arbitrary code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// `bad_request` – malformed envelope or request shape.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// `validation_failed` – soft domain or normalization rejection.
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    /// `forbidden` – partition authorization denied.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// `auth_failed` – unauthenticated or identity mismatch.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthFailed, message)
    }

    /// `rate_limited` – rate or size limit breached.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    /// `server_error` – unexpected internal fault.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }

    /// `protocol_version_unsupported` – envelope version mismatch.
    pub fn version_unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolVersionUnsupported, message)
    }

    /// Map to the wire `error` payload.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code,
            message: self.message.clone(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_as_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ValidationFailed).unwrap();
        assert_eq!(json, r#""validation_failed""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::ValidationFailed);
    }

    #[test]
    fn close_policy_matches_taxonomy() {
        assert!(ErrorCode::AuthFailed.closes_connection());
        assert!(ErrorCode::ProtocolVersionUnsupported.closes_connection());
        assert!(ErrorCode::ServerError.closes_connection());
        assert!(!ErrorCode::BadRequest.closes_connection());
        assert!(!ErrorCode::Forbidden.closes_connection());
        assert!(!ErrorCode::ValidationFailed.closes_connection());
        assert!(!ErrorCode::RateLimited.closes_connection());
    }

    #[test]
    fn event_body_serializes_type_field() {
        let body = EventBody::new("event", serde_json::json!({"schema": "note.create"}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["payload"]["schema"], "note.create");
    }
}
