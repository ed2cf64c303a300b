//! In-memory repository implementations.
//!
//! These store everything in process memory behind locks. Suitable for tests
//! and single-process deployments; contents are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::{CourierError, Result};
use crate::types::{EventKey, EventStatus, Webhook, WebhookEvent, WebhookId, WebhookStatus};

use super::{EventStream, WebhookEventRepo, WebhookRepo, WebhookStateRepo};

/// In-memory implementation of [`WebhookRepo`].
#[derive(Clone)]
pub struct InMemoryWebhookRepo {
    webhooks: Arc<RwLock<HashMap<WebhookId, Webhook>>>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self {
            webhooks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert or replace a webhook.
    pub fn upsert(&self, webhook: Webhook) {
        self.webhooks.write().insert(webhook.id, webhook);
    }

    /// Current record for a webhook, if any.
    pub fn get(&self, id: WebhookId) -> Option<Webhook> {
        self.webhooks.read().get(&id).cloned()
    }
}

impl Default for InMemoryWebhookRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn require_webhook(&self, id: WebhookId) -> Result<Webhook> {
        self.webhooks
            .read()
            .get(&id)
            .cloned()
            .ok_or(CourierError::MissingWebhook(id))
    }

    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()> {
        let mut webhooks = self.webhooks.write();
        let webhook = webhooks
            .get_mut(&id)
            .ok_or(CourierError::MissingWebhook(id))?;
        webhook.status = status;
        Ok(())
    }
}

/// In-memory implementation of [`WebhookEventRepo`].
///
/// New events are fanned out over an internal broadcast channel; subscribe
/// before publishing or the event only lands in the store.
#[derive(Clone)]
pub struct InMemoryEventRepo {
    events: Arc<RwLock<HashMap<EventKey, WebhookEvent>>>,
    new_events: broadcast::Sender<WebhookEvent>,
}

impl InMemoryEventRepo {
    pub fn new() -> Self {
        let (new_events, _) = broadcast::channel(1024);
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
            new_events,
        }
    }

    /// Store an event with status `New` and announce it to subscribers.
    pub fn publish_event(&self, mut event: WebhookEvent) {
        event.status = EventStatus::New;
        self.events.write().insert(event.key, event.clone());
        let _ = self.new_events.send(event);
    }

    /// Seed an event with an explicit status, without announcing it. Used to
    /// stage `Delivering` events for recovery.
    pub fn seed_event(&self, event: WebhookEvent) {
        self.events.write().insert(event.key, event);
    }

    /// Current status of an event, if known.
    pub fn event_status(&self, key: &EventKey) -> Option<EventStatus> {
        self.events.read().get(key).map(|e| e.status)
    }

    /// Statuses of every stored event for a webhook.
    pub fn statuses_for(&self, id: WebhookId) -> Vec<EventStatus> {
        self.events
            .read()
            .values()
            .filter(|e| e.key.webhook_id == id)
            .map(|e| e.status)
            .collect()
    }
}

impl Default for InMemoryEventRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookEventRepo for InMemoryEventRepo {
    fn subscribe_to_new_events(&self) -> EventStream {
        let rx = self.new_events.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|result| result.ok()))
    }

    fn recover_events(&self) -> EventStream {
        let delivering: Vec<WebhookEvent> = self
            .events
            .read()
            .values()
            .filter(|e| e.status == EventStatus::Delivering)
            .cloned()
            .collect();
        Box::pin(tokio_stream::iter(delivering))
    }

    async fn set_event_status(&self, key: &EventKey, status: EventStatus) -> Result<()> {
        let mut events = self.events.write();
        let event = events
            .get_mut(key)
            .ok_or(CourierError::MissingEvent(*key))?;
        event.status = status;
        Ok(())
    }

    async fn set_event_status_many(&self, keys: &[EventKey], status: EventStatus) -> Result<()> {
        let mut events = self.events.write();
        let mut missing = Vec::new();
        for key in keys {
            match events.get_mut(key) {
                Some(event) => event.status = status,
                None => missing.push(*key),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CourierError::MissingEvents(missing))
        }
    }

    async fn set_all_as_failed_by_webhook_id(&self, id: WebhookId) -> Result<()> {
        let mut events = self.events.write();
        for event in events.values_mut() {
            if event.key.webhook_id == id && event.status != EventStatus::Delivered {
                event.status = EventStatus::Failed;
            }
        }
        Ok(())
    }
}

/// In-memory implementation of [`WebhookStateRepo`].
#[derive(Clone)]
pub struct InMemoryStateRepo {
    blob: Arc<RwLock<Option<String>>>,
}

impl InMemoryStateRepo {
    pub fn new() -> Self {
        Self {
            blob: Arc::new(RwLock::new(None)),
        }
    }

    /// Seed the checkpoint a previous run would have written.
    pub fn seed(&self, raw: String) {
        *self.blob.write() = Some(raw);
    }

    /// The checkpoint as last written.
    pub fn current(&self) -> Option<String> {
        self.blob.read().clone()
    }
}

impl Default for InMemoryStateRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookStateRepo for InMemoryStateRepo {
    async fn get_state(&self) -> Result<Option<String>> {
        Ok(self.blob.read().clone())
    }

    async fn set_state(&self, raw: String) -> Result<()> {
        *self.blob.write() = Some(raw);
        Ok(())
    }
}
