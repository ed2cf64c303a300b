//! Startup recovery: rebuild retry state from the checkpoint and replay
//! events that were mid-delivery when the previous run stopped.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::deliver::Deliverer;
use crate::error::CourierError;
use crate::repo::WebhookStateRepo;
use crate::state::{NewRetry, PersistentServerState, RetryState, WebhookState};
use crate::types::WebhookEvent;

/// Rebuild retrying webhooks from the persisted checkpoint, then stream the
/// `Delivering` events back into their retry queues.
///
/// `subscribed` fires once the recovery stream is live; the startup barrier
/// waits on it.
#[tracing::instrument(skip_all)]
pub(crate) async fn run_recovery(
    deliverer: Deliverer,
    state_repo: Arc<dyn WebhookStateRepo>,
    subscribed: oneshot::Sender<()>,
    shutdown: CancellationToken,
) {
    let checkpoint = load_checkpoint(&deliverer, state_repo.as_ref()).await;
    for (webhook_id, entry) in checkpoint.retrying_states {
        let (state, queue_rx) = RetryState::recovered(&deliverer.retry_config, &entry);
        state.set_active_with_timeout(Utc::now(), deliverer.unavailability_timeout(webhook_id));
        deliverer
            .internal
            .update(webhook_id, WebhookState::Retrying(state.clone()))
            .await;
        tracing::info!(
            webhook_id = %webhook_id,
            attempt = entry.attempt,
            backoff = %humantime::format_duration(entry.backoff),
            time_left = %humantime::format_duration(entry.time_left),
            "recovered retrying webhook"
        );
        if deliverer
            .new_retries
            .send(NewRetry {
                webhook_id,
                state,
                queue_rx,
            })
            .await
            .is_err()
        {
            deliverer.errors.publish(CourierError::Internal(
                "new-retries channel closed during recovery".to_string(),
            ));
            return;
        }
    }

    let mut stream = deliverer.events.recover_events();
    let _ = subscribed.send(());

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        replay(&deliverer, event).await;
    }
    tracing::debug!("recovery stream drained");
}

/// Fetch and parse the checkpoint. A missing blob is an empty state; an
/// unreadable one is published as `InvalidState` and treated as empty.
async fn load_checkpoint(
    deliverer: &Deliverer,
    state_repo: &dyn WebhookStateRepo,
) -> PersistentServerState {
    let raw = match state_repo.get_state().await {
        Ok(raw) => raw,
        Err(error) => {
            deliverer.errors.publish(error);
            None
        }
    };
    match raw {
        None => PersistentServerState::default(),
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                deliverer
                    .errors
                    .publish(CourierError::InvalidState(error.to_string()));
                PersistentServerState::default()
            }
        },
    }
}

/// Route one recovered `Delivering` event into its webhook's retry queue.
async fn replay(deliverer: &Deliverer, event: WebhookEvent) {
    let webhook = match deliverer.webhooks.require_webhook(event.key.webhook_id).await {
        Ok(webhook) => webhook,
        Err(error) => {
            deliverer.errors.publish(error);
            return;
        }
    };
    if !webhook.is_available() {
        return;
    }
    if let Err(error) = deliverer.route_to_retry_queue(webhook.id, vec![event]).await {
        deliverer.errors.publish(error);
    }
}
