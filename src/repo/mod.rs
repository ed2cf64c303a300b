//! Repository seams for the delivery engine's external collaborators.
//!
//! The engine never owns durable storage: webhooks, events, and the retry
//! checkpoint blob live behind these traits. Implementations can be backed by
//! different storage mechanisms; the in-memory ones in [`in_memory`] suit
//! tests and single-process deployments.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::types::{EventKey, EventStatus, Webhook, WebhookEvent, WebhookId, WebhookStatus};

pub mod in_memory;

/// A stream of webhook events.
pub type EventStream = Pin<Box<dyn Stream<Item = WebhookEvent> + Send>>;

/// Webhook metadata and status.
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    /// Look up a webhook.
    ///
    /// # Errors
    /// `MissingWebhook` if the id is unknown.
    async fn require_webhook(&self, id: WebhookId) -> Result<Webhook>;

    /// Update a webhook's status.
    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()>;
}

/// Durable event store with new-event and recovery streams.
#[async_trait]
pub trait WebhookEventRepo: Send + Sync {
    /// Subscribe to events as they are published.
    ///
    /// The subscription is observable from the moment this returns: events
    /// published afterwards flow to the stream.
    fn subscribe_to_new_events(&self) -> EventStream;

    /// Stream the events currently in status `Delivering`, for startup
    /// recovery.
    fn recover_events(&self) -> EventStream;

    /// Update one event's status.
    ///
    /// # Errors
    /// `MissingEvent` if the key is unknown.
    async fn set_event_status(&self, key: &EventKey, status: EventStatus) -> Result<()>;

    /// Update several events' statuses.
    ///
    /// # Errors
    /// `MissingEvents` listing every unknown key; known keys are still
    /// updated.
    async fn set_event_status_many(&self, keys: &[EventKey], status: EventStatus) -> Result<()>;

    /// Mark every non-delivered event of a webhook as failed.
    async fn set_all_as_failed_by_webhook_id(&self, id: WebhookId) -> Result<()>;
}

/// Persistent store for the serialized retry checkpoint.
///
/// The blob is opaque to the repository: a UTF-8 JSON rendering of
/// [`crate::state::PersistentServerState`].
#[async_trait]
pub trait WebhookStateRepo: Send + Sync {
    /// Fetch the checkpoint written by the previous run, if any.
    async fn get_state(&self) -> Result<Option<String>>;

    /// Overwrite the checkpoint.
    async fn set_state(&self, raw: String) -> Result<()>;
}
