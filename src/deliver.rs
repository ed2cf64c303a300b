//! Posting dispatches and interpreting their outcomes.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::ErrorBus;
use crate::config::RetryConfig;
use crate::error::{CourierError, Result};
use crate::http::{WebhookHttpClient, WebhookHttpRequest};
use crate::repo::{WebhookEventRepo, WebhookRepo};
use crate::state::{InternalState, NewRetry, RetryState, WebhookState};
use crate::types::{
    DeliverySemantics, EventKey, EventStatus, WebhookDispatch, WebhookEvent, WebhookId,
    WebhookStatus,
};

/// What a promotion decided under the state-map lock; carried out after the
/// lock is released.
enum Promotion {
    /// Webhook already retrying: offer the events to its queue.
    Enqueue(RetryState),
    /// Webhook out of rotation: settle the events instead.
    Fail,
    /// Fresh retry state installed: announce it to retry-monitoring.
    Announce(NewRetry),
}

/// Shared delivery context: posts one dispatch, interprets the response,
/// updates event statuses, and promotes failing at-least-once webhooks into
/// the retrying state.
///
/// Cheap to clone; every background component holds one. Errors raised along
/// the delivery path are published to the error bus and swallowed; this path
/// never crashes its caller.
#[derive(Clone)]
pub(crate) struct Deliverer {
    pub(crate) webhooks: Arc<dyn WebhookRepo>,
    pub(crate) events: Arc<dyn WebhookEventRepo>,
    pub(crate) http: Arc<dyn WebhookHttpClient>,
    pub(crate) internal: InternalState,
    pub(crate) errors: ErrorBus,
    pub(crate) retry_config: RetryConfig,
    pub(crate) new_retries: mpsc::Sender<NewRetry>,
    pub(crate) shutdown: CancellationToken,
}

impl Deliverer {
    /// Render a dispatch as the single POST it becomes.
    ///
    /// A batch of one posts its payload verbatim; a larger batch posts a JSON
    /// array of the payloads (events batch together only when they share a
    /// content type). Headers are taken from the first event.
    pub(crate) fn build_request(dispatch: &WebhookDispatch) -> WebhookHttpRequest {
        let events = dispatch.events();
        let body = if events.len() == 1 {
            events[0].payload.clone()
        } else {
            let payloads: Vec<&str> = events.iter().map(|e| e.payload.as_str()).collect();
            format!("[{}]", payloads.join(","))
        };
        WebhookHttpRequest {
            url: dispatch.url().to_string(),
            headers: events[0].headers.clone(),
            body,
        }
    }

    /// Fetch the webhook for a new event and, if it accepts deliveries,
    /// deliver a dispatch of one.
    pub(crate) async fn deliver_new_event(&self, event: WebhookEvent) {
        let webhook = match self.webhooks.require_webhook(event.key.webhook_id).await {
            Ok(webhook) => webhook,
            Err(error) => {
                self.errors.publish(error);
                return;
            }
        };
        match webhook.status {
            WebhookStatus::Enabled => {
                if let Some(dispatch) = WebhookDispatch::new(&webhook, vec![event]) {
                    self.deliver(dispatch).await;
                }
            }
            WebhookStatus::Disabled => {
                self.internal.update(webhook.id, WebhookState::Disabled).await;
            }
            WebhookStatus::Unavailable { .. } => {}
        }
    }

    /// Post one dispatch and apply its outcome.
    #[tracing::instrument(skip(self, dispatch), fields(webhook_id = %dispatch.webhook_id(), events = dispatch.events().len()))]
    pub(crate) async fn deliver(&self, dispatch: WebhookDispatch) {
        if let Err(error) = self.deliver_inner(dispatch).await {
            self.errors.publish(error);
        }
    }

    async fn deliver_inner(&self, dispatch: WebhookDispatch) -> Result<()> {
        let keys = dispatch.event_keys();
        self.events
            .set_event_status_many(&keys, EventStatus::Delivering)
            .await?;

        // Transport failure counts as no response at all.
        let request = Self::build_request(&dispatch);
        let response = self.http.post(&request).await.ok();
        let succeeded = response.as_ref().is_some_and(|r| r.is_success());

        match (dispatch.semantics(), succeeded) {
            (_, true) => {
                self.events
                    .set_event_status_many(&keys, EventStatus::Delivered)
                    .await?;
            }
            (DeliverySemantics::AtMostOnce, false) => {
                tracing::debug!(status = ?response.map(|r| r.status), "at-most-once dispatch failed");
                self.events
                    .set_event_status_many(&keys, EventStatus::Failed)
                    .await?;
            }
            (DeliverySemantics::AtLeastOnce, false) => {
                tracing::debug!(status = ?response.map(|r| r.status), "promoting webhook to retrying");
                self.promote_to_retrying(dispatch.webhook_id(), dispatch.into_events())
                    .await?;
            }
        }
        Ok(())
    }

    /// Transition a webhook into the retrying state after a failed
    /// at-least-once dispatch.
    ///
    /// The first failure creates the retry state, advances its backoff
    /// ladder, and hands the events to a requeue that sleeps one backoff
    /// before offering them: the first retry runs a base backoff after the
    /// original failure. Later failures of *new* events join an existing
    /// state's queue directly; their pacing comes from the dispatcher.
    ///
    /// The dispatcher task itself is spawned by retry-monitoring from the
    /// [`NewRetry`] announcement, never from here.
    async fn promote_to_retrying(&self, id: WebhookId, events: Vec<WebhookEvent>) -> Result<()> {
        // Decide under the map lock, but keep bounded-channel operations
        // outside it: an enqueue blocked on a full queue must not hold the
        // lock its consumer needs.
        let action = {
            let mut map = self.internal.lock().await;
            match map.get(&id).cloned() {
                Some(WebhookState::Retrying(state)) => {
                    state.set_active_with_timeout(Utc::now(), self.unavailability_timeout(id));
                    Promotion::Enqueue(state)
                }
                Some(WebhookState::Disabled) | Some(WebhookState::Unavailable) => Promotion::Fail,
                None => {
                    let now = Utc::now();
                    let (state, queue_rx) = RetryState::new(&self.retry_config, now);
                    state.set_active_with_timeout(now, self.unavailability_timeout(id));
                    state.increase_backoff(now);
                    map.insert(id, WebhookState::Retrying(state.clone()));
                    Promotion::Announce(NewRetry {
                        webhook_id: id,
                        state,
                        queue_rx,
                    })
                }
            }
        };
        match action {
            Promotion::Enqueue(state) => state.enqueue_all(events).await?,
            Promotion::Fail => {
                let keys: Vec<EventKey> = events.iter().map(|e| e.key).collect();
                self.events
                    .set_event_status_many(&keys, EventStatus::Failed)
                    .await?;
            }
            Promotion::Announce(announce) => {
                self.spawn_requeue(&announce.state, events);
                self.new_retries.send(announce).await.map_err(|_| {
                    CourierError::Internal("new-retries channel closed".to_string())
                })?;
            }
        }
        Ok(())
    }

    /// Route recovered `Delivering` events into their webhook's retry queue,
    /// creating and announcing a fresh state when none exists yet.
    pub(crate) async fn route_to_retry_queue(
        &self,
        id: WebhookId,
        events: Vec<WebhookEvent>,
    ) -> Result<()> {
        let action = {
            let mut map = self.internal.lock().await;
            match map.get(&id).cloned() {
                Some(WebhookState::Retrying(state)) => {
                    state.set_active_with_timeout(Utc::now(), self.unavailability_timeout(id));
                    Promotion::Enqueue(state)
                }
                Some(WebhookState::Disabled) | Some(WebhookState::Unavailable) => Promotion::Fail,
                None => {
                    let now = Utc::now();
                    let (state, queue_rx) = RetryState::new(&self.retry_config, now);
                    state.set_active_with_timeout(now, self.unavailability_timeout(id));
                    map.insert(id, WebhookState::Retrying(state.clone()));
                    Promotion::Announce(NewRetry {
                        webhook_id: id,
                        state,
                        queue_rx,
                    })
                }
            }
        };
        match action {
            Promotion::Enqueue(state) => state.enqueue_all(events).await?,
            // Recovered events of a disabled or unavailable webhook were
            // already settled by whatever took the webhook out of rotation.
            Promotion::Fail => {}
            Promotion::Announce(announce) => {
                announce.state.enqueue_all(events).await?;
                self.new_retries.send(announce).await.map_err(|_| {
                    CourierError::Internal("new-retries channel closed".to_string())
                })?;
            }
        }
        Ok(())
    }

    /// Sleep one backoff, then offer the events to the retry queue. Runs as
    /// its own task so the delivery path is not parked on the backoff.
    pub(crate) fn spawn_requeue(&self, state: &RetryState, events: Vec<WebhookEvent>) {
        let state = state.clone();
        let errors = self.errors.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = state.requeue(events, &shutdown).await {
                errors.publish(error);
            }
        });
    }

    /// The action the unavailability timer runs when a webhook exhausts its
    /// retry timeout.
    pub(crate) fn unavailability_timeout(
        &self,
        id: WebhookId,
    ) -> impl Future<Output = ()> + Send + 'static {
        let this = self.clone();
        async move { this.mark_webhook_unavailable(id).await }
    }

    /// Fail everything pending for a webhook and mark it unavailable, both
    /// in the repository and in the in-memory state map.
    pub(crate) async fn mark_webhook_unavailable(&self, id: WebhookId) {
        tracing::warn!(webhook_id = %id, "retry timeout expired; marking webhook unavailable");
        if let Err(error) = self.mark_unavailable_inner(id).await {
            self.errors.publish(error);
        }
    }

    async fn mark_unavailable_inner(&self, id: WebhookId) -> Result<()> {
        self.events.set_all_as_failed_by_webhook_id(id).await?;
        self.webhooks
            .set_webhook_status(id, WebhookStatus::Unavailable { since: Utc::now() })
            .await?;
        self.internal.update(id, WebhookState::Unavailable).await;
        Ok(())
    }
}
