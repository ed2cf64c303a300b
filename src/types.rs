//! Core types for the webhook delivery system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for a webhook endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(Uuid);

impl WebhookId {
    /// Create a new random webhook ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("whk_{}", &hex[..8])
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WebhookId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for WebhookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// A unique identifier for an event within a webhook's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("evt_{}", &hex[..8])
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Composite identity of an event: the webhook it belongs to plus its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub webhook_id: WebhookId,
    pub event_id: EventId,
}

impl EventKey {
    pub fn new(webhook_id: WebhookId, event_id: EventId) -> Self {
        Self {
            webhook_id,
            event_id,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.webhook_id, self.event_id)
    }
}

/// How events for a webhook are grouped into HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchingMode {
    /// One event per POST.
    Single,
    /// Events sharing a batch key are coalesced into one POST.
    Batched,
}

/// Delivery guarantee for a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySemantics {
    /// One POST attempt; failure marks the events failed.
    AtMostOnce,
    /// Failures are retried with exponential backoff until success or timeout.
    AtLeastOnce,
}

/// A webhook's delivery mode: how to group events and what to promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMode {
    pub batching: BatchingMode,
    pub semantics: DeliverySemantics,
}

impl DeliveryMode {
    pub fn new(batching: BatchingMode, semantics: DeliverySemantics) -> Self {
        Self {
            batching,
            semantics,
        }
    }
}

/// Operator-visible status of a webhook endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Accepting deliveries.
    Enabled,
    /// Switched off by the operator; no delivery until re-enabled.
    Disabled,
    /// Exhausted its retry timeout; no delivery until the operator re-enables.
    Unavailable { since: DateTime<Utc> },
}

/// A webhook endpoint as stored in the webhook repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    /// Target URL for delivery POSTs.
    pub url: String,
    pub delivery: DeliveryMode,
    pub status: WebhookStatus,
}

impl Webhook {
    /// Whether the webhook currently accepts deliveries.
    pub fn is_available(&self) -> bool {
        matches!(self.status, WebhookStatus::Enabled)
    }
}

/// Delivery status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Newly published, not yet picked up.
    New,
    /// Handed to the delivery engine; a POST may be in flight or pending retry.
    Delivering,
    /// Confirmed by a 200 response.
    Delivered,
    /// Given up on: at-most-once failure, retry timeout, or operator action.
    Failed,
}

impl EventStatus {
    /// Check if this status is terminal (delivered or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Delivered | EventStatus::Failed)
    }
}

/// An event addressed to a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub key: EventKey,
    /// Serialized payload to POST.
    pub payload: String,
    /// Request headers recorded with the event, content-type included.
    pub headers: Vec<(String, String)>,
    pub status: EventStatus,
}

impl WebhookEvent {
    /// The event's content-type header, if present (case-insensitive lookup).
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }

    /// The batch key this event groups under.
    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            webhook_id: self.key.webhook_id,
            content_type: self.content_type().map(str::to_owned),
        }
    }
}

/// Grouping key for batching: two events coalesce iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub webhook_id: WebhookId,
    pub content_type: Option<String>,
}

/// A non-empty batch of events bound for one webhook.
///
/// Immutable once constructed; carries the webhook's URL and semantics so the
/// posting path needs no further repository lookups.
#[derive(Debug, Clone)]
pub struct WebhookDispatch {
    webhook_id: WebhookId,
    url: String,
    semantics: DeliverySemantics,
    events: Vec<WebhookEvent>,
}

impl WebhookDispatch {
    /// Build a dispatch for `webhook` carrying `events`.
    ///
    /// Returns `None` for an empty batch.
    pub fn new(webhook: &Webhook, events: Vec<WebhookEvent>) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self {
            webhook_id: webhook.id,
            url: webhook.url.clone(),
            semantics: webhook.delivery.semantics,
            events,
        })
    }

    pub fn webhook_id(&self) -> WebhookId {
        self.webhook_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn semantics(&self) -> DeliverySemantics {
        self.semantics
    }

    /// Events in construction order. Never empty.
    pub fn events(&self) -> &[WebhookEvent] {
        &self.events
    }

    /// Keys of all events in the dispatch, in construction order.
    pub fn event_keys(&self) -> Vec<EventKey> {
        self.events.iter().map(|e| e.key).collect()
    }

    /// Consume the dispatch, yielding its events.
    pub fn into_events(self) -> Vec<WebhookEvent> {
        self.events
    }
}
