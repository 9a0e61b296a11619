//! Bus transport port and the NATS adapter behind it.
//!
//! Only the connection manager talks to a [`BusTransport`]; everything else
//! goes through the manager.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("publish to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("bus not connected")]
    NotConnected,

    #[error("connection manager stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<non-utf8 payload>")
    }
}

#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BusLink>, TransportError>;
}

/// One live connection.
#[async_trait]
pub trait BusLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, InboundMessage>, TransportError>;

    /// Resolves once the connection has dropped.
    async fn closed(&self);

    /// Releases the connection. Called by the manager when it abandons the
    /// link; later calls on the link fail.
    fn close(&self);
}

// =============================================================================
// NATS
// =============================================================================

#[derive(Debug, Clone)]
pub struct NatsTransport {
    client_name: String,
}

impl NatsTransport {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self { client_name: client_name.into() }
    }
}

#[async_trait]
impl BusTransport for NatsTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BusLink>, TransportError> {
        let (dropped_tx, dropped_rx) = watch::channel(false);
        let dropped_tx = Arc::new(dropped_tx);
        let client = async_nats::ConnectOptions::new()
            .name(&self.client_name)
            .event_callback(move |event| {
                let dropped_tx = Arc::clone(&dropped_tx);
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            dropped_tx.send_replace(true);
                        }
                        other => tracing::debug!(event = ?other, "nats client event"),
                    }
                }
            })
            .connect(address)
            .await
            .map_err(|e| TransportError::Connect { address: address.to_string(), reason: e.to_string() })?;
        Ok(Arc::new(NatsLink { client: Mutex::new(Some(client)), dropped: dropped_rx }))
    }
}

/// A client handed out by [`NatsTransport`]. The client keeps retrying on
/// its own after a disconnect, so the manager closes the link as soon as it
/// gives up on it; dropping the last client handle stops that retry loop.
struct NatsLink {
    client: Mutex<Option<async_nats::Client>>,
    dropped: watch::Receiver<bool>,
}

impl NatsLink {
    fn client(&self) -> Option<async_nats::Client> {
        self.client.lock().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl BusLink for NatsLink {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let fail = |reason: String| TransportError::Publish { topic: topic.to_string(), reason };
        let client = self.client().ok_or_else(|| fail("link closed".into()))?;
        client.publish(topic.to_string(), payload).await.map_err(|e| fail(e.to_string()))?;
        client.flush().await.map_err(|e| fail(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        let fail = |reason: String| TransportError::Subscribe { topic: topic.to_string(), reason };
        let client = self.client().ok_or_else(|| fail("link closed".into()))?;
        let subscriber = client.subscribe(topic.to_string()).await.map_err(|e| fail(e.to_string()))?;
        Ok(subscriber
            .map(|msg| InboundMessage { topic: msg.subject.to_string(), payload: msg.payload })
            .boxed())
    }

    async fn closed(&self) {
        let mut dropped = self.dropped.clone();
        // A closed channel means the client itself is gone.
        let _ = dropped.wait_for(|d| *d).await;
    }

    fn close(&self) {
        let released = match self.client.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if released.is_some() {
            tracing::debug!("nats client released");
        }
    }
}
