//! In-memory webhook state: per-webhook retry bookkeeping and the
//! serializable retry checkpoint.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{CourierError, Result};
use crate::types::{EventKey, WebhookEvent, WebhookId};

/// Scalar retry bookkeeping for one webhook.
struct RetryTiming {
    base: Duration,
    max_backoff: Duration,
    /// Remaining time budget in the retrying state. Decremented only by
    /// `suspend`; the unavailability timer sleeps this long from activation.
    timeout: Duration,
    active_since: DateTime<Utc>,
    last_retry: DateTime<Utc>,
    failure_count: u32,
    next_backoff: Duration,
    /// Completing this cancels the unavailability timer.
    kill_switch: Option<oneshot::Sender<()>>,
    is_active: bool,
}

/// Per-webhook retry state.
///
/// Cheap to clone; clones share the retry queue, the in-flight set, the
/// backoff-reset channel, and the scalar block. The retry queue's receiving
/// end is handed to the webhook's dispatcher through [`NewRetry`].
#[derive(Clone)]
pub struct RetryState {
    queue_tx: mpsc::Sender<WebhookEvent>,
    resets_tx: mpsc::Sender<oneshot::Sender<()>>,
    resets_rx: Arc<Mutex<mpsc::Receiver<oneshot::Sender<()>>>>,
    in_flight: Arc<Mutex<HashSet<EventKey>>>,
    timing: Arc<Mutex<RetryTiming>>,
}

impl RetryState {
    /// Fresh state for a webhook entering retrying at `now`.
    ///
    /// Returns the state plus the retry queue's consumer end.
    pub fn new(config: &RetryConfig, now: DateTime<Utc>) -> (Self, mpsc::Receiver<WebhookEvent>) {
        Self::build(
            config,
            config.timeout,
            now,
            now,
            0,
            config.exponential_base,
        )
    }

    /// State rebuilt from a persisted checkpoint entry.
    pub fn recovered(
        config: &RetryConfig,
        persisted: &PersistedRetry,
    ) -> (Self, mpsc::Receiver<WebhookEvent>) {
        Self::build(
            config,
            persisted.time_left,
            persisted.since_time,
            persisted.last_retry_time,
            persisted.attempt,
            persisted.backoff,
        )
    }

    fn build(
        config: &RetryConfig,
        timeout: Duration,
        active_since: DateTime<Utc>,
        last_retry: DateTime<Utc>,
        failure_count: u32,
        next_backoff: Duration,
    ) -> (Self, mpsc::Receiver<WebhookEvent>) {
        let capacity = config.capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (resets_tx, resets_rx) = mpsc::channel(capacity);
        let state = Self {
            queue_tx,
            resets_tx,
            resets_rx: Arc::new(Mutex::new(resets_rx)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            timing: Arc::new(Mutex::new(RetryTiming {
                base: config.exponential_base,
                max_backoff: config.max_backoff,
                timeout,
                active_since,
                last_retry,
                failure_count,
                next_backoff,
                kill_switch: None,
                is_active: false,
            })),
        };
        (state, queue_rx)
    }

    /// Record events as posted-but-unconfirmed.
    pub fn add_in_flight(&self, keys: &[EventKey]) {
        let mut in_flight = self.in_flight.lock();
        in_flight.extend(keys.iter().copied());
    }

    /// Confirm events, removing them from the in-flight set.
    pub fn remove_in_flight(&self, keys: &[EventKey]) {
        let mut in_flight = self.in_flight.lock();
        for key in keys {
            in_flight.remove(key);
        }
    }

    pub fn in_flight_is_empty(&self) -> bool {
        self.in_flight.lock().is_empty()
    }

    /// Whether the retry queue holds no buffered events.
    pub fn queue_is_empty(&self) -> bool {
        self.queue_tx.capacity() == self.queue_tx.max_capacity()
    }

    /// Offer events to the retry queue. Blocks while the queue is at
    /// capacity; that backpressure is intentional.
    pub async fn enqueue_all(&self, events: impl IntoIterator<Item = WebhookEvent>) -> Result<()> {
        for event in events {
            self.queue_tx
                .send(event)
                .await
                .map_err(|_| CourierError::Internal("retry queue closed".to_string()))?;
        }
        Ok(())
    }

    /// Advance the backoff ladder after a failed dispatch.
    ///
    /// `next = base * 2^failure_count`, except once the ceiling is reached
    /// the attempt counter stops advancing.
    pub fn increase_backoff(&self, now: DateTime<Utc>) {
        let mut t = self.timing.lock();
        let next_exp = t
            .base
            .checked_mul(2u32.saturating_pow(t.failure_count))
            .unwrap_or(t.max_backoff);
        if next_exp >= t.max_backoff {
            t.next_backoff = t.max_backoff;
        } else {
            t.failure_count += 1;
            t.next_backoff = next_exp;
        }
        t.last_retry = now;
    }

    /// Return the ladder to its base after a successful dispatch, then wake
    /// every requeue currently sleeping its backoff.
    ///
    /// Draining then signalling on the same task gives the happens-before
    /// the wake-up relies on.
    pub fn reset_backoff(&self, now: DateTime<Utc>) {
        {
            let mut t = self.timing.lock();
            t.failure_count = 0;
            t.next_backoff = t.base;
            t.last_retry = now;
        }
        let mut resets = self.resets_rx.lock();
        while let Ok(reset) = resets.try_recv() {
            let _ = reset.send(());
        }
    }

    /// Activate the state, arming the unavailability timer.
    ///
    /// No-op when already active. Otherwise spawns a task racing the kill
    /// switch against `sleep(timeout)`; if the timeout wins, `on_timeout`
    /// runs. `active_since` is stamped on the inactive-to-active edge.
    pub fn set_active_with_timeout<F>(&self, now: DateTime<Utc>, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (timeout, kill_rx) = {
            let mut t = self.timing.lock();
            if t.is_active {
                return;
            }
            let (kill_tx, kill_rx) = oneshot::channel();
            t.kill_switch = Some(kill_tx);
            t.is_active = true;
            t.active_since = now;
            (t.timeout, kill_rx)
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = kill_rx => {}
                _ = tokio::time::sleep(timeout) => {
                    on_timeout.await;
                }
            }
        });
    }

    /// Deactivate: cancel the timer via its kill switch (no-op if none).
    pub fn set_inactive(&self) {
        let mut t = self.timing.lock();
        if let Some(kill) = t.kill_switch.take() {
            let _ = kill.send(());
        }
        t.is_active = false;
    }

    /// Freeze the state for checkpointing at shutdown: the remaining timeout
    /// loses the time spent active, the pending backoff loses the time since
    /// the last retry (both clamped at zero), and the timer is cancelled.
    /// The state stays marked active so the checkpoint projection keeps it.
    pub fn suspend(&self, now: DateTime<Utc>) {
        let mut t = self.timing.lock();
        let active_for = (now - t.active_since).to_std().unwrap_or_default();
        t.timeout = t.timeout.saturating_sub(active_for);
        let since_retry = (now - t.last_retry).to_std().unwrap_or_default();
        t.next_backoff = t.next_backoff.saturating_sub(since_retry);
        if let Some(kill) = t.kill_switch.take() {
            let _ = kill.send(());
        }
    }

    /// Sleep the current backoff (preempted by a backoff reset or shutdown),
    /// then re-add `events` to the retry queue.
    ///
    /// On shutdown the requeue is abandoned: the events are still
    /// `Delivering` in the event repository and recovery replays them.
    pub async fn requeue(
        &self,
        events: Vec<WebhookEvent>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (reset_tx, reset_rx) = oneshot::channel();
        self.resets_tx
            .send(reset_tx)
            .await
            .map_err(|_| CourierError::Internal("backoff-reset channel closed".to_string()))?;

        let backoff = self.next_backoff();
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
            _ = reset_rx => {}
        }

        for event in events {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                sent = self.queue_tx.send(event) => {
                    sent.map_err(|_| CourierError::Internal("retry queue closed".to_string()))?;
                }
            }
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.timing.lock().is_active
    }

    pub fn failure_count(&self) -> u32 {
        self.timing.lock().failure_count
    }

    pub fn next_backoff(&self) -> Duration {
        self.timing.lock().next_backoff
    }

    pub fn remaining_timeout(&self) -> Duration {
        self.timing.lock().timeout
    }

    /// Project the checkpoint entry for this state.
    pub fn persisted(&self) -> PersistedRetry {
        let t = self.timing.lock();
        PersistedRetry {
            since_time: t.active_since,
            last_retry_time: t.last_retry,
            time_left: t.timeout,
            backoff: t.next_backoff,
            attempt: t.failure_count,
        }
    }
}

/// Announcement that a webhook entered retrying, carrying the consumer end
/// of its retry queue. Retry-monitoring spawns one dispatcher per message.
pub struct NewRetry {
    pub webhook_id: WebhookId,
    pub state: RetryState,
    pub queue_rx: mpsc::Receiver<WebhookEvent>,
}

/// In-memory delivery state of a webhook.
#[derive(Clone)]
pub enum WebhookState {
    /// Switched off; terminal until restart.
    Disabled,
    /// Timed out of retrying; no delivery until the operator re-enables.
    Unavailable,
    /// Actively retrying failed dispatches (or parked after a success,
    /// waiting for the next failure).
    Retrying(RetryState),
}

impl WebhookState {
    pub fn as_retrying(&self) -> Option<&RetryState> {
        match self {
            WebhookState::Retrying(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, WebhookState::Retrying(_))
    }
}

/// The in-memory map from webhook id to its current state.
///
/// All mutation goes through one async mutex: a coarse single-writer
/// discipline that makes updates linearizable.
#[derive(Clone)]
pub struct InternalState {
    inner: Arc<tokio::sync::Mutex<HashMap<WebhookId, WebhookState>>>,
}

impl InternalState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, id: WebhookId) -> Option<WebhookState> {
        self.inner.lock().await.get(&id).cloned()
    }

    pub async fn update(&self, id: WebhookId, state: WebhookState) {
        self.inner.lock().await.insert(id, state);
    }

    /// Exclusive access to the whole map, for compound read-then-update
    /// sequences (the promotion path).
    pub(crate) async fn lock(
        &self,
    ) -> tokio::sync::MutexGuard<'_, HashMap<WebhookId, WebhookState>> {
        self.inner.lock().await
    }

    /// Suspend every live retrying entry at `now` (see
    /// [`RetryState::suspend`]).
    pub async fn suspend_all(&self, now: DateTime<Utc>) {
        let map = self.inner.lock().await;
        for state in map.values() {
            if let WebhookState::Retrying(retry) = state {
                if retry.is_active() {
                    retry.suspend(now);
                }
            }
        }
    }

    /// Project every live retrying entry into the persistent checkpoint.
    ///
    /// Inactive entries are husks kept for future failures (empty queue,
    /// cancelled timer); persisting them would resurrect concluded retry
    /// state on the next boot.
    pub async fn snapshot_persistent(&self) -> PersistentServerState {
        let map = self.inner.lock().await;
        let retrying_states = map
            .iter()
            .filter_map(|(id, state)| match state {
                WebhookState::Retrying(retry) if retry.is_active() => {
                    Some((*id, retry.persisted()))
                }
                _ => None,
            })
            .collect();
        PersistentServerState { retrying_states }
    }
}

impl Default for InternalState {
    fn default() -> Self {
        Self::new()
    }
}

/// One webhook's checkpoint entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRetry {
    pub since_time: DateTime<Utc>,
    pub last_retry_time: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub time_left: Duration,
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
    pub attempt: u32,
}

/// The checkpoint written at shutdown and read back at startup.
///
/// Queues are not persisted; events are recovered from the event repository
/// by their `Delivering` status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentServerState {
    pub retrying_states: HashMap<WebhookId, PersistedRetry>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
