//! Configuration for the delivery server.

use std::time::Duration;

/// Retry behavior for at-least-once webhooks.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Capacity of each per-webhook retry queue and backoff-reset channel.
    pub capacity: usize,

    /// Initial backoff after the first failure.
    pub exponential_base: Duration,

    /// Accepted for forward compatibility. The backoff formula is
    /// `base * 2^attempt` capped at `max_backoff`; only a factor of 2 is
    /// honored.
    pub exponential_factor: f64,

    /// Backoff ceiling.
    pub max_backoff: Duration,

    /// Maximum time a webhook may stay retrying before it is marked
    /// unavailable and its pending events failed.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            exponential_base: Duration::from_millis(1000),
            exponential_factor: 2.0,
            max_backoff: Duration::from_secs(60),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Configuration for the delivery server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the sliding error bus. When full, the oldest record is
    /// dropped in favor of the newest.
    pub error_sliding_capacity: usize,

    /// Retry behavior for at-least-once webhooks.
    pub retry: RetryConfig,

    /// Capacity of each per-batch-key queue. `None` disables batching
    /// globally; batched webhooks then fall back to single dispatch.
    pub batching_capacity: Option<usize>,

    /// Parallelism bound for non-batched delivery.
    pub max_single_dispatch_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            error_sliding_capacity: 128,
            retry: RetryConfig::default(),
            batching_capacity: None,
            max_single_dispatch_concurrency: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.error_sliding_capacity, 128);
        assert_eq!(config.retry.capacity, 128);
        assert_eq!(config.retry.exponential_base, Duration::from_secs(1));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(60));
        assert_eq!(config.retry.timeout, Duration::from_secs(600));
        assert!(config.batching_capacity.is_none());
        assert_eq!(config.max_single_dispatch_concurrency, 10);
    }
}
