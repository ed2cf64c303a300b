//! End-to-end delivery scenarios against the in-memory repositories.
//!
//! Timing-sensitive scenarios run under a paused tokio clock so backoff and
//! timeout spacing is deterministic; the wiremock test at the bottom drives
//! the real reqwest client over real time.

use std::sync::Arc;
use std::time::Duration;

use courier::{
    BatchingMode, CourierError, DeliveryMode, DeliverySemantics, EventId, EventKey, EventStatus,
    InMemoryEventRepo, InMemoryStateRepo, InMemoryWebhookRepo, MockHttpClient, PersistedRetry,
    PersistentServerState, ReqwestHttpClient, RetryConfig, ServerConfig, Webhook, WebhookEvent,
    WebhookId, WebhookServer, WebhookState, WebhookStatus,
};
use tokio_stream::StreamExt;

struct Harness {
    webhooks: Arc<InMemoryWebhookRepo>,
    events: Arc<InMemoryEventRepo>,
    state_repo: Arc<InMemoryStateRepo>,
    http: Arc<MockHttpClient>,
}

impl Harness {
    fn new() -> Self {
        Self {
            webhooks: Arc::new(InMemoryWebhookRepo::new()),
            events: Arc::new(InMemoryEventRepo::new()),
            state_repo: Arc::new(InMemoryStateRepo::new()),
            http: Arc::new(MockHttpClient::new()),
        }
    }

    async fn start(&self, config: ServerConfig) -> WebhookServer {
        WebhookServer::start(
            self.webhooks.clone(),
            self.events.clone(),
            self.state_repo.clone(),
            self.http.clone(),
            config,
        )
        .await
    }
}

fn webhook(batching: BatchingMode, semantics: DeliverySemantics) -> Webhook {
    Webhook {
        id: WebhookId::new(),
        url: "https://example.com/hook".to_string(),
        delivery: DeliveryMode::new(batching, semantics),
        status: WebhookStatus::Enabled,
    }
}

fn event_for(webhook: &Webhook, n: u32) -> WebhookEvent {
    WebhookEvent {
        key: EventKey::new(webhook.id, EventId::new()),
        payload: format!(r#"{{"n":{n}}}"#),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        status: EventStatus::New,
    }
}

fn retry_config(base_secs: u64, max_secs: u64, timeout_secs: u64) -> RetryConfig {
    RetryConfig {
        capacity: 32,
        exponential_base: Duration::from_secs(base_secs),
        exponential_factor: 2.0,
        max_backoff: Duration::from_secs(max_secs),
        timeout: Duration::from_secs(timeout_secs),
    }
}

/// Poll `cond` under the paused clock, advancing virtual time in small steps.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn parse_checkpoint(harness: &Harness) -> PersistentServerState {
    let raw = harness.state_repo.current().expect("checkpoint written");
    serde_json::from_str(&raw).expect("checkpoint parses")
}

// S1: single at-most-once success.
#[tokio::test(start_paused = true)]
async fn single_at_most_once_success() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Single, DeliverySemantics::AtMostOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.add_status(&webhook.url, 200);

    let server = harness.start(ServerConfig::default()).await;

    let event = event_for(&webhook, 1);
    harness.events.publish_event(event.clone());

    let events = harness.events.clone();
    let key = event.key;
    wait_until(move || events.event_status(&key) == Some(EventStatus::Delivered)).await;

    assert_eq!(harness.http.call_count(), 1);
    assert_eq!(harness.http.get_calls()[0].body, r#"{"n":1}"#);
    // No retry state was ever created.
    assert!(server.webhook_state(webhook.id).await.is_none());

    server.shutdown().await.unwrap();
    assert!(parse_checkpoint(&harness).retrying_states.is_empty());
}

// S2: at-least-once, three failures then success; POSTs at ~0/1/3/7s.
#[tokio::test(start_paused = true)]
async fn at_least_once_retries_until_success() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Single, DeliverySemantics::AtLeastOnce);
    harness.webhooks.upsert(webhook.clone());
    for status in [500, 500, 500, 200] {
        harness.http.add_status(&webhook.url, status);
    }

    let config = ServerConfig {
        retry: retry_config(1, 10, 60),
        ..ServerConfig::default()
    };
    let server = harness.start(config).await;

    let started = tokio::time::Instant::now();
    let event = event_for(&webhook, 2);
    harness.events.publish_event(event.clone());

    let events = harness.events.clone();
    let key = event.key;
    wait_until(move || events.event_status(&key) == Some(EventStatus::Delivered)).await;

    // Backoffs of 1s, 2s, 4s between the four POSTs.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(9), "elapsed {elapsed:?}");
    assert_eq!(harness.http.call_count(), 4);

    // The retry state is parked: inactive, ladder reset.
    match server.webhook_state(webhook.id).await {
        Some(WebhookState::Retrying(state)) => {
            assert!(!state.is_active());
            assert_eq!(state.failure_count(), 0);
        }
        other => panic!(
            "expected parked retry state, got {:?}",
            other.map(|s| s.is_retrying())
        ),
    }

    server.shutdown().await.unwrap();
    assert!(parse_checkpoint(&harness).retrying_states.is_empty());
}

// S4: unending failures exhaust the timeout; the webhook goes unavailable,
// its events fail, and posting stops.
#[tokio::test(start_paused = true)]
async fn timeout_marks_webhook_unavailable() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Single, DeliverySemantics::AtLeastOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.set_default_status(500);

    let config = ServerConfig {
        retry: retry_config(1, 10, 5),
        ..ServerConfig::default()
    };
    let server = harness.start(config).await;

    let event = event_for(&webhook, 4);
    harness.events.publish_event(event.clone());

    let webhooks = harness.webhooks.clone();
    let id = webhook.id;
    wait_until(move || {
        matches!(
            webhooks.get(id).map(|w| w.status),
            Some(WebhookStatus::Unavailable { .. })
        )
    })
    .await;

    assert_eq!(harness.events.event_status(&event.key), Some(EventStatus::Failed));
    assert!(matches!(
        server.webhook_state(webhook.id).await,
        Some(WebhookState::Unavailable)
    ));

    // No further POSTs once unavailable.
    let posts_at_timeout = harness.http.call_count();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.http.call_count(), posts_at_timeout);

    server.shutdown().await.unwrap();
    assert!(parse_checkpoint(&harness).retrying_states.is_empty());
}

// S5: three events published within one scheduler quantum coalesce into one
// POST, in publish order.
#[tokio::test(start_paused = true)]
async fn batched_delivery_coalesces_events() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Batched, DeliverySemantics::AtLeastOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.add_status(&webhook.url, 200);

    let config = ServerConfig {
        batching_capacity: Some(8),
        ..ServerConfig::default()
    };
    let server = harness.start(config).await;

    let published: Vec<WebhookEvent> = (0..3).map(|n| event_for(&webhook, n)).collect();
    for event in &published {
        harness.events.publish_event(event.clone());
    }

    let events = harness.events.clone();
    let keys: Vec<EventKey> = published.iter().map(|e| e.key).collect();
    wait_until(move || {
        keys.iter()
            .all(|k| events.event_status(k) == Some(EventStatus::Delivered))
    })
    .await;

    assert_eq!(harness.http.call_count(), 1);
    assert_eq!(
        harness.http.get_calls()[0].body,
        r#"[{"n":0},{"n":1},{"n":2}]"#
    );

    server.shutdown().await.unwrap();
}

// A batched webhook that fails once retries the whole batch through the
// batched retry dispatcher.
#[tokio::test(start_paused = true)]
async fn batched_retry_redelivers_batch() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Batched, DeliverySemantics::AtLeastOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.add_status(&webhook.url, 500);
    harness.http.add_status(&webhook.url, 200);

    let config = ServerConfig {
        batching_capacity: Some(8),
        retry: retry_config(1, 10, 60),
        ..ServerConfig::default()
    };
    let server = harness.start(config).await;

    let published: Vec<WebhookEvent> = (0..3).map(|n| event_for(&webhook, n)).collect();
    for event in &published {
        harness.events.publish_event(event.clone());
    }

    let events = harness.events.clone();
    let keys: Vec<EventKey> = published.iter().map(|e| e.key).collect();
    wait_until(move || {
        keys.iter()
            .all(|k| events.event_status(k) == Some(EventStatus::Delivered))
    })
    .await;

    // First POST carried the batch and failed; the retry carried it again.
    assert_eq!(harness.http.call_count(), 2);
    let calls = harness.http.get_calls();
    assert_eq!(calls[0].body, calls[1].body);

    server.shutdown().await.unwrap();
    assert!(parse_checkpoint(&harness).retrying_states.is_empty());
}

// S6: recovery from a seeded checkpoint plus delivering events.
#[tokio::test(start_paused = true)]
async fn recovery_resumes_and_concludes_retries() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Single, DeliverySemantics::AtLeastOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.set_default_status(200);

    // Checkpoint left behind by a previous run.
    let mut checkpoint = PersistentServerState::default();
    checkpoint.retrying_states.insert(
        webhook.id,
        PersistedRetry {
            since_time: chrono::Utc::now(),
            last_retry_time: chrono::Utc::now(),
            time_left: Duration::from_secs(30),
            backoff: Duration::from_secs(4),
            attempt: 2,
        },
    );
    harness
        .state_repo
        .seed(serde_json::to_string(&checkpoint).unwrap());

    // Three events mid-delivery at crash time.
    let mut delivering = Vec::new();
    for n in 0..3 {
        let mut event = event_for(&webhook, n);
        event.status = EventStatus::Delivering;
        harness.events.seed_event(event.clone());
        delivering.push(event);
    }

    let config = ServerConfig {
        retry: retry_config(1, 10, 60),
        ..ServerConfig::default()
    };
    let server = harness.start(config).await;

    let events = harness.events.clone();
    let keys: Vec<EventKey> = delivering.iter().map(|e| e.key).collect();
    wait_until(move || {
        keys.iter()
            .all(|k| events.event_status(k) == Some(EventStatus::Delivered))
    })
    .await;

    match server.webhook_state(webhook.id).await {
        Some(WebhookState::Retrying(state)) => assert!(!state.is_active()),
        _ => panic!("expected parked retry state after recovery success"),
    }

    server.shutdown().await.unwrap();
    assert!(parse_checkpoint(&harness).retrying_states.is_empty());
}

// Property 7: the checkpoint written at shutdown round-trips through a
// restart and finishes the delivery.
#[tokio::test(start_paused = true)]
async fn shutdown_checkpoint_roundtrips_through_restart() {
    let harness = Harness::new();
    let webhook = webhook(BatchingMode::Single, DeliverySemantics::AtLeastOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.set_default_status(500);

    let config = ServerConfig {
        retry: retry_config(2, 16, 300),
        ..ServerConfig::default()
    };
    let server = harness.start(config.clone()).await;

    let event = event_for(&webhook, 7);
    harness.events.publish_event(event.clone());

    // Let the ladder climb a few rungs, then stop mid-retry.
    let http = harness.http.clone();
    wait_until(move || http.call_count() >= 3).await;
    server.shutdown().await.unwrap();

    let checkpoint = parse_checkpoint(&harness);
    assert_eq!(checkpoint.retrying_states.len(), 1);
    let entry = &checkpoint.retrying_states[&webhook.id];
    assert!(entry.attempt >= 3);
    assert!(entry.time_left < Duration::from_secs(300));
    assert!(entry.backoff <= Duration::from_secs(16));
    // The event is still owed a delivery.
    assert_eq!(
        harness.events.event_status(&event.key),
        Some(EventStatus::Delivering)
    );

    // Restart against the same repositories; the endpoint has recovered.
    harness.http.set_default_status(200);
    let server = harness.start(config).await;

    let events = harness.events.clone();
    let key = event.key;
    wait_until(move || events.event_status(&key) == Some(EventStatus::Delivered)).await;

    server.shutdown().await.unwrap();
    assert!(parse_checkpoint(&harness).retrying_states.is_empty());
}

// An unreadable checkpoint is reported and treated as empty; delivery still
// works.
#[tokio::test(start_paused = true)]
async fn corrupt_checkpoint_does_not_block_startup() {
    let harness = Harness::new();
    harness.state_repo.seed("not json at all".to_string());

    let webhook = webhook(BatchingMode::Single, DeliverySemantics::AtMostOnce);
    harness.webhooks.upsert(webhook.clone());
    harness.http.add_status(&webhook.url, 200);

    let server = harness.start(ServerConfig::default()).await;

    let event = event_for(&webhook, 9);
    harness.events.publish_event(event.clone());

    let events = harness.events.clone();
    let key = event.key;
    wait_until(move || events.event_status(&key) == Some(EventStatus::Delivered)).await;

    server.shutdown().await.unwrap();
}

// Errors on the delivery path surface on the bus, not to callers.
#[tokio::test(start_paused = true)]
async fn missing_webhook_surfaces_on_error_bus() {
    let harness = Harness::new();
    let server = harness.start(ServerConfig::default()).await;
    let mut errors = server.subscribe_errors();

    let ghost = webhook(BatchingMode::Single, DeliverySemantics::AtMostOnce);
    // Never upserted into the webhook repo.
    harness.events.publish_event(event_for(&ghost, 0));

    let error = tokio::time::timeout(Duration::from_secs(10), errors.next())
        .await
        .expect("error published")
        .expect("bus open");
    assert_eq!(error, CourierError::MissingWebhook(ghost.id));

    server.shutdown().await.unwrap();
}

// The real reqwest client, end to end against a live HTTP server.
#[tokio::test]
async fn reqwest_client_delivers_against_wiremock() -> anyhow::Result<()> {
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(body_string(r#"{"n":0}"#))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let webhooks = Arc::new(InMemoryWebhookRepo::new());
    let events = Arc::new(InMemoryEventRepo::new());
    let state_repo = Arc::new(InMemoryStateRepo::new());
    let http = Arc::new(ReqwestHttpClient::with_timeout(Duration::from_secs(5)));

    let webhook = Webhook {
        id: WebhookId::new(),
        url: format!("{}/hook", mock_server.uri()),
        delivery: DeliveryMode::new(BatchingMode::Single, DeliverySemantics::AtMostOnce),
        status: WebhookStatus::Enabled,
    };
    webhooks.upsert(webhook.clone());

    let server = WebhookServer::start(
        webhooks,
        events.clone(),
        state_repo,
        http,
        ServerConfig::default(),
    )
    .await;

    let event = event_for(&webhook, 0);
    events.publish_event(event.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while events.event_status(&event.key) != Some(EventStatus::Delivered) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    server.shutdown().await?;
    Ok(())
}
