//! Notification Publisher
//!
//! Fire-and-forget delivery of domain events. Failures are logged and
//! swallowed: a notification that cannot be sent never fails the business
//! operation that produced it. A batch stops at the first publish that
//! times out, so one stalled broker costs a caller at most one timeout.

use bytes::Bytes;
use serde::Serialize;

use crate::domain::events::{DomainEvent, Topic};

use super::connection::ConnectionManager;
use super::transport::TransportError;

#[derive(Debug, Clone)]
pub struct NotificationPublisher {
    connection: ConnectionManager,
}

impl NotificationPublisher {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &ConnectionManager { &self.connection }

    /// Publishes `event` on its topic. Returns whether the bus accepted it.
    pub async fn publish(&self, event: &DomainEvent) -> bool {
        self.publish_to(event.topic(), event).await
    }

    pub async fn publish_to<T: Serialize + ?Sized>(&self, topic: Topic, payload: &T) -> bool {
        self.send(topic, payload).await.is_ok()
    }

    /// Publishes in order; returns how many were accepted.
    pub async fn publish_all<'a>(&self, events: impl IntoIterator<Item = &'a DomainEvent>) -> usize {
        let mut sent = 0;
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            match self.send(event.topic(), event).await {
                Ok(()) => sent += 1,
                Err(TransportError::Timeout { .. }) => {
                    let skipped = events.count();
                    if skipped > 0 {
                        tracing::warn!(skipped, "bus stalled; remaining notifications dropped");
                    }
                    break;
                }
                Err(_) => {}
            }
        }
        sent
    }

    async fn send<T: Serialize + ?Sized>(&self, topic: Topic, payload: &T) -> Result<(), TransportError> {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "failed to serialize notification");
                return Err(TransportError::Publish { topic: topic.to_string(), reason: e.to_string() });
            }
        };
        match self.connection.publish(topic.as_str(), body).await {
            Ok(()) => {
                tracing::debug!(topic = %topic, "notification published");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "notification dropped");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::StockEvent;
    use crate::messaging::fake::FakeTransport;
    use crate::messaging::{BackoffPolicy, BusTransport, HandlerRegistry, DEFAULT_PUBLISH_TIMEOUT};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn publisher(outcomes: Vec<bool>) -> (NotificationPublisher, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new(outcomes));
        let dyn_transport: Arc<dyn BusTransport> = transport.clone();
        let manager = ConnectionManager::new("nats://bus:4222", dyn_transport, BackoffPolicy::default(), HandlerRegistry::new());
        manager.start().await;
        (NotificationPublisher::new(manager), transport)
    }

    fn stock_event() -> DomainEvent {
        DomainEvent::Stock(StockEvent {
            product_id: Uuid::nil(),
            product_stock: 7,
            stock_available: 7,
            stock_sold: 3,
        })
    }

    #[tokio::test]
    async fn publishes_json_on_event_topic() {
        let (publisher, transport) = publisher(vec![true]).await;
        assert!(publisher.publish(&stock_event()).await);

        let published = transport.link(0).published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "inventory-updates");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["stockAvailable"], 7);
        assert_eq!(body["stockSold"], 3);
    }

    #[tokio::test]
    async fn disconnected_publish_is_swallowed() {
        let (publisher, _) = publisher(vec![false]).await;
        assert!(!publisher.publish(&stock_event()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_bus_costs_one_timeout_per_batch() {
        let (publisher, transport) = publisher(vec![true]).await;
        transport.link(0).stall_publishes();
        let events = [stock_event(), stock_event(), stock_event()];

        let started = tokio::time::Instant::now();
        assert_eq!(publisher.publish_all(events.iter()).await, 0);
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_PUBLISH_TIMEOUT);
        assert!(elapsed < DEFAULT_PUBLISH_TIMEOUT * 2, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn broker_failure_is_swallowed() {
        let (publisher, transport) = publisher(vec![true]).await;
        transport.link(0).fail_publishes();
        let events = [stock_event(), stock_event()];
        assert_eq!(publisher.publish_all(events.iter()).await, 0);
    }
}
