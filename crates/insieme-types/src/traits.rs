//! Injected behaviour contracts shared by the server and client engines.
//!
//! The traits are intentionally minimal and live in `insieme-types` so they
//! can be shared without creating cyclic dependencies. Validators and
//! reducers are pure: no I/O that affects durability, no dependency on
//! `client_id` or transport fields beyond what the event itself carries.

use serde_json::Value;

use crate::{EventBody, ProtocolError, SubmitItem};

/// Ambient facts a validator may consult. Carries no transport state.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Authenticated client submitting the item.
    pub client_id: &'a str,
}

/// Domain validation hook invoked before commit (server) or before local
/// draft insert (client pre-check).
///
/// `validation_failed` and `forbidden` reject the single item;
/// `bad_request` rejects the whole request envelope.
pub trait EventValidator: Send + Sync {
    /// Validate one submitted item.
    fn validate(&self, item: &SubmitItem, ctx: &ValidationContext<'_>) -> Result<(), ProtocolError>;
}

/// Permissive validator used by tests and hosts without domain rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventValidator for AcceptAll {
    fn validate(&self, _item: &SubmitItem, _ctx: &ValidationContext<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Pure state derivation for materialized views.
///
/// Committed ingestion is the single trigger: hosts feed every mirrored
/// event, in `committed_id` order, through their reducers. On a
/// `view_version` change the host drops derived state and replays.
pub trait Reducer: Send + Sync {
    /// Stable view name this reducer materializes.
    fn view_name(&self) -> &str;

    /// Version of the derivation; bumping it forces a rebuild by replay.
    fn view_version(&self) -> u32;

    /// Fold one committed event into the view state for one partition.
    fn apply(&self, state: Value, event: &EventBody, partition: &str) -> Value;
}
