//! Message bus: connection lifecycle, inbound dispatch and outbound notifications.

pub mod backoff;
pub mod connection;
pub mod handlers;
pub mod publisher;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionManager, ConnectionState, DEFAULT_PUBLISH_TIMEOUT};
pub use handlers::{Handler, HandlerRegistry, INBOUND_TOPICS};
pub use publisher::NotificationPublisher;
pub use transport::{BusLink, BusTransport, InboundMessage, NatsTransport, TransportError};
