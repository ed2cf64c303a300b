//! Grouping new events into dispatches.
//!
//! The batcher consumes the new-event stream. Events for batched webhooks are
//! grouped by [`BatchKey`] into bounded per-key queues, each drained by a
//! `do_batching` worker; everything else is delivered individually under the
//! single-dispatch concurrency bound.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::deliver::Deliverer;
use crate::error::CourierError;
use crate::state::WebhookState;
use crate::types::{BatchKey, BatchingMode, WebhookDispatch, WebhookEvent, WebhookStatus};

pub(crate) struct Batcher {
    deliverer: Deliverer,
    batching_capacity: Option<usize>,
    single_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Batcher {
    pub(crate) fn new(
        deliverer: Deliverer,
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            deliverer,
            batching_capacity: config.batching_capacity,
            single_permits: Arc::new(Semaphore::new(config.max_single_dispatch_concurrency.max(1))),
            shutdown,
        }
    }

    /// Consume the new-event stream until shutdown, then drain outstanding
    /// deliveries and batch workers.
    ///
    /// `subscribed` fires once the subscription is live; the startup barrier
    /// waits on it so no event published after `start` returns can be lost.
    #[tracing::instrument(skip_all)]
    pub(crate) async fn run(self, subscribed: oneshot::Sender<()>) {
        let mut stream = self.deliverer.events.subscribe_to_new_events();
        let _ = subscribed.send(());

        let mut workers: HashMap<BatchKey, mpsc::Sender<WebhookEvent>> = HashMap::new();
        let mut tasks = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.route(event, &mut workers, &mut tasks).await;
        }

        // Closing the per-key queues lets idle workers finish; busy ones
        // observe the shutdown token. In-flight posts are awaited, never
        // aborted, so their status updates land before the checkpoint.
        drop(workers);
        while tasks.join_next().await.is_some() {}
        tracing::debug!("new-event ingestion drained");
    }

    async fn route(
        &self,
        event: WebhookEvent,
        workers: &mut HashMap<BatchKey, mpsc::Sender<WebhookEvent>>,
        tasks: &mut JoinSet<()>,
    ) {
        let webhook = match self.deliverer.webhooks.require_webhook(event.key.webhook_id).await {
            Ok(webhook) => webhook,
            Err(error) => {
                self.deliverer.errors.publish(error);
                return;
            }
        };
        match webhook.status {
            WebhookStatus::Enabled => {}
            WebhookStatus::Disabled => {
                self.deliverer
                    .internal
                    .update(webhook.id, WebhookState::Disabled)
                    .await;
                return;
            }
            WebhookStatus::Unavailable { .. } => return,
        }

        match (self.batching_capacity, webhook.delivery.batching) {
            (Some(capacity), BatchingMode::Batched) => {
                let key = event.batch_key();
                let queue = workers.entry(key.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(capacity.max(1));
                    let deliverer = self.deliverer.clone();
                    let shutdown = self.shutdown.clone();
                    tasks.spawn(do_batching(deliverer, key, rx, shutdown));
                    tx
                });
                if queue.send(event).await.is_err() {
                    self.deliverer.errors.publish(CourierError::Internal(
                        "batch queue closed before shutdown".to_string(),
                    ));
                }
            }
            _ => {
                let permit = match self.single_permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let deliverer = self.deliverer.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    if let Some(dispatch) = WebhookDispatch::new(&webhook, vec![event]) {
                        deliverer.deliver(dispatch).await;
                    }
                });
            }
        }
    }
}

/// Per-batch-key worker: take one event, drain whatever else is queued, and
/// deliver the batch in one dispatch.
#[tracing::instrument(skip(deliverer, queue, shutdown), fields(webhook_id = %key.webhook_id))]
async fn do_batching(
    deliverer: Deliverer,
    key: BatchKey,
    mut queue: mpsc::Receiver<WebhookEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = queue.recv() => match next {
                Some(event) => event,
                None => return,
            },
        };
        let mut batch = vec![first];
        while let Ok(event) = queue.try_recv() {
            batch.push(event);
        }

        // Availability can change between grouping and dispatch; check at
        // the last moment.
        let webhook = match deliverer.webhooks.require_webhook(key.webhook_id).await {
            Ok(webhook) => webhook,
            Err(error) => {
                deliverer.errors.publish(error);
                continue;
            }
        };
        if !webhook.is_available() {
            continue;
        }
        if let Some(dispatch) = WebhookDispatch::new(&webhook, batch) {
            deliverer.deliver(dispatch).await;
        }
    }
}
