//! Reliable webhook delivery server.
//!
//! Courier subscribes to a stream of outbound events, groups them into HTTP
//! POSTs addressed to webhook endpoints, enforces per-webhook delivery
//! semantics (at-most-once or at-least-once), retries failing deliveries with
//! exponential backoff until a per-webhook timeout expires, and persists
//! enough state to resume retrying across restarts.
//!
//! Webhook metadata, the event store, and the checkpoint blob live behind the
//! repository traits in [`repo`]; the in-memory implementations there suit
//! tests and single-process deployments. Delivery POSTs go through the
//! [`http::WebhookHttpClient`] seam.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use courier::{
//!     InMemoryEventRepo, InMemoryStateRepo, InMemoryWebhookRepo,
//!     ReqwestHttpClient, ServerConfig, WebhookServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), courier::CourierError> {
//!     let webhooks = Arc::new(InMemoryWebhookRepo::new());
//!     let events = Arc::new(InMemoryEventRepo::new());
//!     let state_repo = Arc::new(InMemoryStateRepo::new());
//!     let http = Arc::new(ReqwestHttpClient::new());
//!
//!     let server = WebhookServer::start(
//!         webhooks.clone(),
//!         events.clone(),
//!         state_repo,
//!         http,
//!         ServerConfig::default(),
//!     )
//!     .await;
//!
//!     // ... register webhooks, publish events ...
//!
//!     server.shutdown().await
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod repo;
pub mod server;
pub mod state;
pub mod types;

mod batch;
mod deliver;
mod recovery;
mod retry;

// Re-export the types most users touch at the crate root.
pub use bus::ErrorBus;
pub use config::{RetryConfig, ServerConfig};
pub use error::{CourierError, Result};
pub use http::{
    MockHttpClient, ReqwestHttpClient, WebhookHttpClient, WebhookHttpRequest, WebhookHttpResponse,
};
pub use repo::in_memory::{InMemoryEventRepo, InMemoryStateRepo, InMemoryWebhookRepo};
pub use repo::{EventStream, WebhookEventRepo, WebhookRepo, WebhookStateRepo};
pub use server::WebhookServer;
pub use state::{PersistedRetry, PersistentServerState, RetryState, WebhookState};
pub use types::{
    BatchKey, BatchingMode, DeliveryMode, DeliverySemantics, EventId, EventKey, EventStatus,
    Webhook, WebhookDispatch, WebhookEvent, WebhookId, WebhookStatus,
};
