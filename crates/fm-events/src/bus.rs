use crate::types::EventRecord;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Bounded fan-out bus. Publishing never blocks: each subscriber rides a
/// fixed-capacity broadcast queue, and a subscriber that falls behind sees
/// `Lagged` on its receiver instead of stalling the publisher. Consumers are
/// expected to recover from a lag by requesting a fresh queue snapshot.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
    next_seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stamp and publish a body. Returns the record so callers can reuse the
    /// exact frame (e.g. to hand it to a just-connected subscriber).
    pub fn publish(&self, body: Value) -> EventRecord {
        let record = EventRecord {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            body,
        };
        // A send error only means there is no subscriber right now.
        let _ = self.sender.send(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publishes_in_order_with_monotonic_seq() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(json!({"type": "health"}));
        bus.publish(json!({"type": "health"}));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(json!({"type": "health"}));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(2);
        let record = bus.publish(json!({"type": "health"}));
        assert_eq!(record.seq, 1);
    }
}
