use crate::types::{EventKey, WebhookId};
use thiserror::Error;

/// Result type for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Errors that can occur in the delivery engine.
///
/// Every variant carries owned data so records stay `Clone`-able: errors from
/// the delivery, retry, and recovery paths are published on the sliding error
/// bus rather than propagated to callers. Transport outcomes (non-200, network
/// failure) are not errors; they drive the retry state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CourierError {
    /// Webhook id absent from the webhook repository
    #[error("webhook not found: {0}")]
    MissingWebhook(WebhookId),

    /// Event key absent on a status update
    #[error("event not found: {0}")]
    MissingEvent(EventKey),

    /// Several event keys absent on a bulk status update
    #[error("events not found: {0:?}")]
    MissingEvents(Vec<EventKey>),

    /// Persisted server state blob unparseable
    #[error("invalid persisted state: {0}")]
    InvalidState(String),

    /// State repository read/write failure
    #[error("state repository io: {0}")]
    Io(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
