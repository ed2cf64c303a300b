//! Server lifecycle: start the concurrent sub-tasks behind a startup
//! barrier, and shut down by draining them and writing the retry checkpoint.

use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::Batcher;
use crate::bus::ErrorBus;
use crate::config::ServerConfig;
use crate::deliver::Deliverer;
use crate::error::{CourierError, Result};
use crate::http::WebhookHttpClient;
use crate::recovery::run_recovery;
use crate::repo::{WebhookEventRepo, WebhookRepo, WebhookStateRepo};
use crate::retry::run_retry_monitor;
use crate::state::{InternalState, WebhookState};
use crate::types::WebhookId;

/// Capacity of the channel announcing webhooks that enter retrying. Sized so
/// recovery can announce a burst of checkpointed webhooks without blocking
/// on the monitor.
const NEW_RETRY_CHANNEL_CAPACITY: usize = 128;

/// The webhook delivery server.
///
/// `start` spawns three concurrent sub-tasks (new-event ingestion, startup
/// recovery, and retry monitoring) and returns once both ingestion and
/// recovery are subscribed to their sources. `shutdown` broadcasts the stop
/// signal, waits for every stream to drain (in-flight POSTs are awaited, not
/// aborted), and checkpoints the suspended retry state.
///
/// # Example
/// ```ignore
/// let server = WebhookServer::start(webhooks, events, state_repo, http, config).await;
/// // ... deliveries flow ...
/// server.shutdown().await?;
/// ```
pub struct WebhookServer {
    internal: InternalState,
    errors: ErrorBus,
    state_repo: Arc<dyn WebhookStateRepo>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WebhookServer {
    /// Start the server and block until the startup barrier clears: both the
    /// new-event subscription and the recovery stream are live.
    ///
    /// Infallible from the caller's point of view; startup problems surface
    /// on the error bus.
    #[tracing::instrument(skip_all)]
    pub async fn start(
        webhooks: Arc<dyn WebhookRepo>,
        events: Arc<dyn WebhookEventRepo>,
        state_repo: Arc<dyn WebhookStateRepo>,
        http: Arc<dyn WebhookHttpClient>,
        config: ServerConfig,
    ) -> Self {
        let errors = ErrorBus::new(config.error_sliding_capacity);
        let internal = InternalState::new();
        let shutdown = CancellationToken::new();
        let (new_retries_tx, new_retries_rx) = mpsc::channel(NEW_RETRY_CHANNEL_CAPACITY);

        let deliverer = Deliverer {
            webhooks,
            events,
            http,
            internal: internal.clone(),
            errors: errors.clone(),
            retry_config: config.retry.clone(),
            new_retries: new_retries_tx,
            shutdown: shutdown.clone(),
        };

        // Retry monitoring first: recovery announces into its channel.
        let monitor = tokio::spawn(run_retry_monitor(
            deliverer.clone(),
            config.clone(),
            new_retries_rx,
            shutdown.clone(),
        ));

        let (recovery_ready_tx, recovery_ready_rx) = oneshot::channel();
        let recovery = tokio::spawn(run_recovery(
            deliverer.clone(),
            state_repo.clone(),
            recovery_ready_tx,
            shutdown.clone(),
        ));

        let (ingest_ready_tx, ingest_ready_rx) = oneshot::channel();
        let batcher = Batcher::new(deliverer, &config, shutdown.clone());
        let ingest = tokio::spawn(batcher.run(ingest_ready_tx));

        // Startup barrier.
        let _ = recovery_ready_rx.await;
        let _ = ingest_ready_rx.await;
        tracing::info!("webhook server started");

        Self {
            internal,
            errors,
            state_repo,
            shutdown,
            tasks: vec![ingest, recovery, monitor],
        }
    }

    /// Subscribe to error records published from this point on.
    pub fn subscribe_errors(&self) -> Pin<Box<dyn Stream<Item = CourierError> + Send>> {
        self.errors.subscribe()
    }

    /// Inspect a webhook's in-memory delivery state.
    pub async fn webhook_state(&self, id: WebhookId) -> Option<WebhookState> {
        self.internal.get(id).await
    }

    /// Stop the server: signal shutdown, drain every sub-task, suspend the
    /// retrying entries, and write the checkpoint.
    ///
    /// # Errors
    /// Only a state-repository failure surfaces here; everything else went to
    /// the error bus while the server ran.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("shutdown requested; draining delivery tasks");
        self.shutdown.cancel();
        for task in self.tasks {
            // A sub-task that panicked already logged through the join error;
            // the checkpoint must still be written.
            let _ = task.await;
        }

        let now = Utc::now();
        self.internal.suspend_all(now).await;
        let checkpoint = self.internal.snapshot_persistent().await;
        let raw = serde_json::to_string(&checkpoint)
            .map_err(|e| CourierError::Internal(format!("checkpoint serialization: {e}")))?;
        self.state_repo.set_state(raw).await?;
        tracing::info!(
            retrying = checkpoint.retrying_states.len(),
            "checkpoint written; shutdown complete"
        );
        Ok(())
    }
}
