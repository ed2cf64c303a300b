//! HTTP client abstraction for posting dispatches.
//!
//! The `WebhookHttpClient` trait abstracts the single POST a delivery makes,
//! enabling testability with mock implementations. A transport-level `Err`
//! is a delivery failure, not a bus error: the caller feeds it into the retry
//! state machine exactly like a non-200 response.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{CourierError, Result};

/// A single outbound POST carrying one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Serialized payload; a batch of several events is a JSON array of their
    /// payloads, a batch of one is the payload verbatim.
    pub body: String,
}

/// Response from an outbound POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHttpResponse {
    /// HTTP status code. Delivery succeeds iff this is 200.
    pub status: u16,
    /// Response body as a string.
    pub body: String,
}

impl WebhookHttpResponse {
    /// Whether this response confirms the delivery.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Trait for executing delivery POSTs.
#[async_trait]
pub trait WebhookHttpClient: Send + Sync {
    /// POST a dispatch to its webhook URL.
    ///
    /// # Errors
    /// Returns an error on transport failure (network issue, timeout,
    /// invalid URL). Non-200 responses are returned as `Ok`.
    async fn post(&self, request: &WebhookHttpRequest) -> Result<WebhookHttpResponse>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a new reqwest-based client with no per-request timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a client that bounds each POST attempt by `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookHttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(url = %request.url, body_len = request.body.len()))]
    async fn post(&self, request: &WebhookHttpRequest) -> Result<WebhookHttpResponse> {
        let mut req = self.client.post(&request.url);
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        req = req.body(request.body.clone());

        let response = req.send().await.map_err(|e| {
            tracing::debug!(url = %request.url, error = %e, "transport failure");
            CourierError::Internal(format!("transport failure: {e}"))
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CourierError::Internal(format!("transport failure: {e}")))?;

        tracing::debug!(status, response_len = body.len(), "delivery POST completed");

        Ok(WebhookHttpResponse { status, body })
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock HTTP client for testing.
///
/// Scripted responses are keyed by URL and returned in FIFO order; when a
/// URL's queue runs dry the optional default response repeats, otherwise the
/// call fails like a transport error. Every call is recorded.
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<WebhookHttpResponse>>>>>,
    default_response: Arc<Mutex<Option<WebhookHttpResponse>>>,
    calls: Arc<Mutex<Vec<WebhookHttpRequest>>>,
}

impl MockHttpClient {
    /// Create a new mock client with no scripted responses.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            default_response: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script the next response for `url`. Multiple responses for the same
    /// URL are returned in FIFO order.
    pub fn add_response(&self, url: &str, response: Result<WebhookHttpResponse>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push(response);
    }

    /// Script a status-only response for `url`.
    pub fn add_status(&self, url: &str, status: u16) {
        self.add_response(
            url,
            Ok(WebhookHttpResponse {
                status,
                body: String::new(),
            }),
        );
    }

    /// Response repeated once a URL's scripted queue is exhausted.
    pub fn set_default_status(&self, status: u16) {
        *self.default_response.lock() = Some(WebhookHttpResponse {
            status,
            body: String::new(),
        });
    }

    /// All calls made so far, in order.
    pub fn get_calls(&self) -> Vec<WebhookHttpRequest> {
        self.calls.lock().clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookHttpClient for MockHttpClient {
    async fn post(&self, request: &WebhookHttpRequest) -> Result<WebhookHttpResponse> {
        self.calls.lock().push(request.clone());

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&request.url) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        drop(responses);

        if let Some(default) = self.default_response.lock().clone() {
            return Ok(default);
        }

        Err(CourierError::Internal(format!(
            "no mock response configured for {}",
            request.url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(url: &str) -> WebhookHttpRequest {
        WebhookHttpRequest {
            url: url.to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: r#"{"test":true}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mock_client_fifo_responses() {
        let mock = MockHttpClient::new();
        mock.add_status("https://a.example/hook", 500);
        mock.add_status("https://a.example/hook", 200);

        let request = sample_request("https://a.example/hook");
        assert_eq!(mock.post(&request).await.unwrap().status, 500);
        assert_eq!(mock.post(&request).await.unwrap().status, 200);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_client_default_after_queue_drains() {
        let mock = MockHttpClient::new();
        mock.add_status("https://a.example/hook", 200);
        mock.set_default_status(503);

        let request = sample_request("https://a.example/hook");
        assert_eq!(mock.post(&request).await.unwrap().status, 200);
        assert_eq!(mock.post(&request).await.unwrap().status, 503);
        assert_eq!(mock.post(&request).await.unwrap().status, 503);
    }

    #[tokio::test]
    async fn test_mock_client_unconfigured_url_is_transport_failure() {
        let mock = MockHttpClient::new();
        let request = sample_request("https://unknown.example/hook");
        assert!(mock.post(&request).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_client_records_calls() {
        let mock = MockHttpClient::new();
        mock.add_status("https://a.example/hook", 200);

        let request = sample_request("https://a.example/hook");
        mock.post(&request).await.unwrap();

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://a.example/hook");
        assert_eq!(calls[0].body, r#"{"test":true}"#);
    }
}
