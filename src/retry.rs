//! Retry monitoring and per-webhook retry dispatch.
//!
//! The monitor watches the new-retries channel and spawns one dispatcher per
//! webhook that enters retrying. A dispatcher consumes its webhook's retry
//! queue either singly (bounded parallelism) or batched (per-batch-key
//! workers), posts, and schedules the backoff-governed requeue on failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::deliver::Deliverer;
use crate::error::CourierError;
use crate::state::{NewRetry, RetryState, WebhookState};
use crate::types::{
    BatchKey, BatchingMode, EventKey, EventStatus, Webhook, WebhookDispatch, WebhookEvent,
};

/// Watch the new-retries channel, spawning one dispatcher per announcement.
/// On shutdown, stops accepting work and drains every dispatcher.
#[tracing::instrument(skip_all)]
pub(crate) async fn run_retry_monitor(
    deliverer: Deliverer,
    config: ServerConfig,
    mut new_retries: mpsc::Receiver<NewRetry>,
    shutdown: CancellationToken,
) {
    let mut dispatchers = JoinSet::new();
    loop {
        let announce = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = new_retries.recv() => match next {
                Some(announce) => announce,
                None => break,
            },
        };
        tracing::debug!(webhook_id = %announce.webhook_id, "spawning retry dispatcher");
        let dispatcher = RetryDispatcher {
            deliverer: deliverer.clone(),
            announce,
            batching_capacity: config.batching_capacity,
            max_single_dispatch_concurrency: config.max_single_dispatch_concurrency,
            shutdown: shutdown.clone(),
        };
        dispatchers.spawn(dispatcher.run());
    }
    while dispatchers.join_next().await.is_some() {}
    tracing::debug!("retry monitoring drained");
}

/// Consumes one webhook's retry queue until shutdown.
struct RetryDispatcher {
    deliverer: Deliverer,
    announce: NewRetry,
    batching_capacity: Option<usize>,
    max_single_dispatch_concurrency: usize,
    shutdown: CancellationToken,
}

impl RetryDispatcher {
    async fn run(self) {
        let webhook = match self
            .deliverer
            .webhooks
            .require_webhook(self.announce.webhook_id)
            .await
        {
            Ok(webhook) => webhook,
            Err(error) => {
                self.deliverer.errors.publish(error);
                return;
            }
        };
        let worker = RetryWorker {
            deliverer: self.deliverer,
            webhook,
            state: self.announce.state,
            shutdown: self.shutdown,
        };
        match (self.batching_capacity, worker.webhook.delivery.batching) {
            (Some(capacity), BatchingMode::Batched) => {
                retry_batched(
                    worker,
                    self.announce.queue_rx,
                    capacity.max(1),
                )
                .await
            }
            _ => {
                retry_singly(
                    worker,
                    self.announce.queue_rx,
                    self.max_single_dispatch_concurrency.max(1),
                )
                .await
            }
        }
    }
}

/// Single-mode retry: each queued event posts on its own, at most
/// `concurrency` in flight at once.
#[tracing::instrument(skip_all, fields(webhook_id = %worker.webhook.id))]
async fn retry_singly(
    worker: RetryWorker,
    mut queue: mpsc::Receiver<WebhookEvent>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut posts = JoinSet::new();
    loop {
        let event = tokio::select! {
            _ = worker.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let worker = worker.clone();
        posts.spawn(async move {
            let _permit = permit;
            worker.retry_events(vec![event], None).await;
        });
    }
    // Drain in-flight posts so their status updates land before shutdown
    // writes the checkpoint.
    while posts.join_next().await.is_some() {}
}

/// Batched-mode retry: group the queue by batch key and hand each key to a
/// `do_retry_batching` worker over a bounded batch queue.
#[tracing::instrument(skip_all, fields(webhook_id = %worker.webhook.id))]
async fn retry_batched(
    worker: RetryWorker,
    mut queue: mpsc::Receiver<WebhookEvent>,
    capacity: usize,
) {
    let mut groups: HashMap<BatchKey, mpsc::Sender<WebhookEvent>> = HashMap::new();
    let mut batchers = JoinSet::new();
    loop {
        let event = tokio::select! {
            _ = worker.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let key = event.batch_key();
        let batch_queue = groups.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(capacity);
            let worker = worker.clone();
            let queue_tx = tx.clone();
            batchers.spawn(do_retry_batching(worker, rx, queue_tx));
            tx
        });
        if batch_queue.send(event).await.is_err() {
            worker.deliverer.errors.publish(CourierError::Internal(
                "retry batch queue closed before shutdown".to_string(),
            ));
        }
    }
    drop(groups);
    while batchers.join_next().await.is_some() {}
}

/// Take one event, drain the rest of the batch queue, retry the batch.
async fn do_retry_batching(
    worker: RetryWorker,
    mut queue: mpsc::Receiver<WebhookEvent>,
    queue_tx: mpsc::Sender<WebhookEvent>,
) {
    loop {
        let first = tokio::select! {
            _ = worker.shutdown.cancelled() => return,
            next = queue.recv() => match next {
                Some(event) => event,
                None => return,
            },
        };
        let mut batch = vec![first];
        while let Ok(event) = queue.try_recv() {
            batch.push(event);
        }
        worker.retry_events(batch, Some(&queue_tx)).await;
    }
}

/// Everything one retry post needs.
#[derive(Clone)]
struct RetryWorker {
    deliverer: Deliverer,
    webhook: Webhook,
    state: RetryState,
    shutdown: CancellationToken,
}

impl RetryWorker {
    /// Post a batch of retried events and apply the outcome to the retry
    /// state.
    async fn retry_events(
        &self,
        events: Vec<WebhookEvent>,
        batch_tx: Option<&mpsc::Sender<WebhookEvent>>,
    ) {
        // The webhook may have left the retrying state while these events
        // were queued or sleeping (timeout fired, operator action). Its
        // pending events were already marked failed; drop them unposted.
        match self.deliverer.internal.get(self.webhook.id).await {
            Some(WebhookState::Retrying(_)) => {}
            _ => return,
        }

        let keys: Vec<EventKey> = events.iter().map(|e| e.key).collect();
        self.state.add_in_flight(&keys);

        let dispatch = match WebhookDispatch::new(&self.webhook, events) {
            Some(dispatch) => dispatch,
            None => return,
        };
        let request = Deliverer::build_request(&dispatch);
        let response = self.deliverer.http.post(&request).await.ok();
        let now = Utc::now();

        if response.as_ref().is_some_and(|r| r.is_success()) {
            self.state.remove_in_flight(&keys);
            if let Err(error) = self
                .deliverer
                .events
                .set_event_status_many(&keys, EventStatus::Delivered)
                .await
            {
                self.deliverer.errors.publish(error);
            }
            // Reset the ladder and wake every sleeping requeue.
            self.state.reset_backoff(now);

            let batch_drained =
                batch_tx.map_or(true, |tx| tx.capacity() == tx.max_capacity());
            if self.state.queue_is_empty()
                && self.state.in_flight_is_empty()
                && batch_drained
            {
                self.state.set_inactive();
                tracing::debug!(webhook_id = %self.webhook.id, "retries drained; parking retry state");
            }
        } else {
            self.state.increase_backoff(now);
            tracing::debug!(
                webhook_id = %self.webhook.id,
                status = ?response.map(|r| r.status),
                attempt = self.state.failure_count(),
                backoff = %humantime::format_duration(self.state.next_backoff()),
                "retry dispatch failed; scheduling requeue"
            );
            let events = dispatch.into_events();
            if batch_tx.is_some() {
                // Requeueing inline could deadlock take-against-offer on our
                // own bounded batch queue; run it as an independent task.
                let state = self.state.clone();
                let errors = self.deliverer.errors.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    let _cleanup = scopeguard::guard((state.clone(), keys), |(state, keys)| {
                        state.remove_in_flight(&keys);
                    });
                    if let Err(error) = state.requeue(events, &shutdown).await {
                        errors.publish(error);
                    }
                });
            } else {
                if let Err(error) = self.state.requeue(events, &self.shutdown).await {
                    self.deliverer.errors.publish(error);
                }
                self.state.remove_in_flight(&keys);
            }
        }
    }
}
