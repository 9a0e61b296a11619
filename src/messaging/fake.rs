//! Scripted in-process transport for exercising the connection manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;

use super::transport::{BusLink, BusTransport, InboundMessage, TransportError};

/// Connect outcomes are popped from a script; once it runs dry every
/// attempt fails.
#[derive(Default)]
pub(crate) struct FakeTransport {
    outcomes: Mutex<VecDeque<bool>>,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
    /// When set, each connect waits until the gate is closed.
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeTransport {
    pub(crate) fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self { outcomes: Mutex::new(outcomes.into_iter().collect()), ..Self::default() }
    }

    pub(crate) fn push_outcomes(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub(crate) fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    /// Makes later connects block until [`Self::release_connects`].
    pub(crate) fn hold_connects(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_connects(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.close();
        }
    }

    /// The `n`th link handed out (0-based).
    pub(crate) fn link(&self, n: usize) -> Arc<FakeLink> {
        Arc::clone(&self.links.lock().unwrap()[n])
    }
}

#[async_trait]
impl BusTransport for FakeTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BusLink>, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
        if !ok {
            return Err(TransportError::Connect { address: address.to_string(), reason: "connection refused".into() });
        }
        let link = Arc::new(FakeLink::new());
        self.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

pub(crate) struct FakeLink {
    published: Mutex<Vec<(String, Bytes)>>,
    subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>,
    dropped: watch::Sender<bool>,
    fail_publish: Mutex<bool>,
    stall_publish: AtomicBool,
    closed: AtomicBool,
}

impl FakeLink {
    fn new() -> Self {
        let (dropped, _) = watch::channel(false);
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            dropped,
            fail_publish: Mutex::new(false),
            stall_publish: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().unwrap().clone()
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub(crate) fn drop_connection(&self) {
        self.dropped.send_replace(true);
    }

    pub(crate) fn fail_publishes(&self) {
        *self.fail_publish.lock().unwrap() = true;
    }

    /// Publishes never complete, like a broker that stopped reading.
    pub(crate) fn stall_publishes(&self) {
        self.stall_publish.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn inject(&self, topic: &str, payload: &'static [u8]) {
        for (subscribed, tx) in self.subscriptions.lock().unwrap().iter() {
            if subscribed == topic {
                let _ = tx.send(InboundMessage { topic: topic.to_string(), payload: Bytes::from_static(payload) });
            }
        }
    }
}

#[async_trait]
impl BusLink for FakeLink {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Publish { topic: topic.to_string(), reason: "link closed".into() });
        }
        if self.stall_publish.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if *self.fail_publish.lock().unwrap() {
            return Err(TransportError::Publish { topic: topic.to_string(), reason: "broker rejected".into() });
        }
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push((topic.to_string(), tx));
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|msg| (msg, rx)) }).boxed())
    }

    async fn closed(&self) {
        let mut rx = self.dropped.subscribe();
        let _ = rx.wait_for(|d| *d).await;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
