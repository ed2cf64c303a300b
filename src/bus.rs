//! Sliding-capacity publish/subscribe channel of error records.

use std::pin::Pin;

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::CourierError;

/// Publish/subscribe hub for errors raised on the delivery, retry, and
/// recovery paths.
///
/// Backed by a bounded broadcast channel with sliding semantics: when a
/// subscriber falls more than `capacity` records behind, the oldest records
/// are dropped so the newest are always retained. Subscribers receive only
/// records published after they subscribe. Publishing never blocks.
#[derive(Clone)]
pub struct ErrorBus {
    tx: broadcast::Sender<CourierError>,
}

impl ErrorBus {
    /// Create a bus retaining at most `capacity` records per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a record. A bus with no subscribers drops it silently.
    pub fn publish(&self, error: CourierError) {
        tracing::warn!(error = %error, "publishing error record");
        let _ = self.tx.send(error);
    }

    /// Subscribe to records published from this point on.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = CourierError> + Send>> {
        let rx = self.tx.subscribe();
        // Lag notifications mark dropped records; the stream skips them and
        // resumes at the oldest retained entry.
        Box::pin(BroadcastStream::new(rx).filter_map(|result| result.ok()))
    }

    /// Raw broadcast receiver, for consumers that want lag visibility.
    pub fn receiver(&self) -> broadcast::Receiver<CourierError> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WebhookId;

    fn record(n: u32) -> CourierError {
        CourierError::Internal(format!("record-{n}"))
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_records() {
        let bus = ErrorBus::new(8);
        let mut rx = bus.receiver();

        bus.publish(record(1));
        bus.publish(record(2));

        assert_eq!(rx.recv().await.unwrap(), record(1));
        assert_eq!(rx.recv().await.unwrap(), record(2));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_records() {
        let capacity = 4;
        let bus = ErrorBus::new(capacity);
        let mut stream = bus.subscribe();

        for n in 0..10 {
            bus.publish(record(n));
        }

        // The lag is skipped; what remains is the newest `capacity` records.
        let mut seen = Vec::new();
        for _ in 0..capacity {
            seen.push(stream.next().await.unwrap());
        }
        assert_eq!(seen, vec![record(6), record(7), record(8), record(9)]);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_old_records() {
        let bus = ErrorBus::new(4);
        // Keep one receiver alive so publishes are retained at all.
        let _pin = bus.receiver();

        for n in 0..10 {
            bus.publish(record(n));
        }

        let mut late = bus.receiver();
        bus.publish(CourierError::MissingWebhook(WebhookId::new()));

        let got = late.recv().await.unwrap();
        assert!(matches!(got, CourierError::MissingWebhook(_)));
        assert!(late.try_recv().is_err());
    }
}
