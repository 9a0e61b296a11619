//! Topic → handler registry for inbound bus messages.
//!
//! The connection manager subscribes to every registered topic on each
//! (re)connect and hands each received message to its handler. Business
//! reactions to inbound messages live with whoever registers the handler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::transport::InboundMessage;

/// Topics other services publish for us. Disjoint from the outbound
/// notification topics, so the service never consumes its own messages.
pub const INBOUND_TOPICS: [&str; 4] = ["inventory/alerts", "inventory/orders", "inventory/updates", "sales/notifications"];

pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("topics", &self.handlers.keys().collect::<Vec<_>>()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self { Self::default() }

    /// Logging handlers for [`INBOUND_TOPICS`].
    pub fn with_default_handlers() -> Self {
        INBOUND_TOPICS.into_iter().fold(Self::new(), |registry, topic| {
            registry.register(topic, move |msg: &InboundMessage| {
                tracing::info!(topic, payload = msg.payload_str(), "bus message received");
            })
        })
    }

    /// Registers (or replaces) the handler for `topic`.
    pub fn register(mut self, topic: impl Into<String>, handler: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Self {
        self.handlers.insert(topic.into(), Arc::new(handler));
        self
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Returns `false` when no handler is registered for the message's topic.
    pub fn dispatch(&self, msg: &InboundMessage) -> bool {
        match self.handlers.get(&msg.topic) {
            Some(handler) => {
                tracing::debug!(topic = %msg.topic, bytes = msg.payload.len(), "dispatching bus message");
                handler(msg);
                true
            }
            None => {
                tracing::warn!(topic = %msg.topic, "no handler for bus topic");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::Topic;
    use bytes::Bytes;
    use std::sync::Mutex;

    fn message(topic: &str) -> InboundMessage {
        InboundMessage { topic: topic.to_string(), payload: Bytes::from_static(b"{}") }
    }

    #[test]
    fn default_registry_listens_on_inbound_topics_only() {
        let registry = HandlerRegistry::with_default_handlers();
        let topics: Vec<&str> = registry.topics().collect();
        assert_eq!(topics, INBOUND_TOPICS.to_vec());
        assert!(registry.dispatch(&message("inventory/orders")));
        for outbound in Topic::ALL {
            assert!(!registry.dispatch(&message(outbound.as_str())), "{outbound} would echo back");
        }
    }

    #[test]
    fn dispatch_routes_by_topic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = HandlerRegistry::new().register("inventory/orders", move |m: &InboundMessage| {
            sink.lock().unwrap().push(m.topic.clone());
        });
        assert!(registry.dispatch(&message("inventory/orders")));
        assert!(!registry.dispatch(&message("inventory/alerts")));
        assert_eq!(*seen.lock().unwrap(), vec!["inventory/orders".to_string()]);
    }
}
