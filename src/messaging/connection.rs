//! Connection Manager
//!
//! Owns the process-wide bus connection. State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (drop)
//!     -> Reconnecting{1..=N} -> Connected | GaveUp
//! ```
//!
//! Connection state is published through a `watch` channel so publishers
//! read it without taking any lock the reconnect loop holds. Publishing and
//! subscribing while not connected is a logged no-op; nothing is queued.
//! A publish on a live connection is bounded by the publish timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::handlers::HandlerRegistry;
use super::transport::{BusLink, BusTransport, InboundMessage, TransportError};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    GaveUp,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    address: String,
    transport: Arc<dyn BusTransport>,
    policy: BackoffPolicy,
    handlers: HandlerRegistry,
    publish_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<dyn BusLink>>>,
    /// Cancelled when the current connection ends; scopes its watcher and dispatch tasks.
    session: Mutex<CancellationToken>,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        address: impl Into<String>,
        transport: Arc<dyn BusTransport>,
        policy: BackoffPolicy,
        handlers: HandlerRegistry,
    ) -> Self {
        Self::with_publish_timeout(address, transport, policy, handlers, DEFAULT_PUBLISH_TIMEOUT)
    }

    pub fn with_publish_timeout(
        address: impl Into<String>,
        transport: Arc<dyn BusTransport>,
        policy: BackoffPolicy,
        handlers: HandlerRegistry,
        publish_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();
        let session = shutdown.child_token();
        Self {
            inner: Arc::new(Inner {
                address: address.into(),
                transport,
                policy,
                handlers,
                publish_timeout,
                state,
                link: RwLock::new(None),
                session: Mutex::new(session),
                reconnecting: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn address(&self) -> &str { &self.inner.address }

    /// Initial connect. A failure leaves the manager `Disconnected`; the
    /// service keeps running and an operator can call [`Self::reconnect`].
    pub async fn start(&self) -> ConnectionState {
        if let Err(e) = self.connect().await {
            tracing::warn!(error = %e, "bus unavailable at startup; notifications disabled until reconnect");
        }
        self.state()
    }

    /// Stops background tasks and drops the connection. Terminal.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.end_session();
        tracing::info!(address = %self.inner.address, "bus connection manager stopped");
    }

    /// Single connection attempt.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Stopped);
        }
        self.set_state(ConnectionState::Connecting);
        match self.inner.transport.connect(&self.inner.address).await {
            Ok(link) => match self.install(link).await {
                true => Ok(()),
                false => Err(TransportError::Stopped),
            },
            Err(e) => {
                tracing::warn!(address = %self.inner.address, error = %e, "failed to connect to bus");
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Operator-triggered reconnect: one immediate attempt, then the bounded
    /// backoff loop if that fails.
    pub async fn reconnect(&self) -> ConnectionState {
        if self.state() == ConnectionState::Connected || self.inner.reconnecting.load(Ordering::SeqCst) {
            return self.state();
        }
        if self.connect().await.is_err() && !self.inner.shutdown.is_cancelled() {
            self.spawn_reconnect_loop();
        }
        self.state()
    }

    /// Hands `payload` to the bus. Returns `NotConnected` without blocking
    /// when there is no live connection, and `Timeout` when the link does
    /// not accept the message within the publish timeout.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let Some(link) = self.live_link() else {
            tracing::debug!(topic, state = ?self.state(), "bus not connected; message dropped");
            return Err(TransportError::NotConnected);
        };
        let timeout = self.inner.publish_timeout;
        match tokio::time::timeout(timeout, link.publish(topic, payload)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { topic: topic.to_string(), timeout }),
        }
    }

    /// Subscribes the live connection to `topic`, dispatching through the
    /// handler registry. No-op while not connected.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let Some(link) = self.live_link() else {
            tracing::debug!(topic, "bus not connected; subscribe skipped");
            return Err(TransportError::NotConnected);
        };
        let stream = link.subscribe(topic).await?;
        self.spawn_dispatch(topic, stream, self.current_session());
        Ok(())
    }

    fn live_link(&self) -> Option<Arc<dyn BusLink>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.inner.link.read().ok().and_then(|slot| slot.as_ref().cloned())
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.inner.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "bus connection state changed");
        }
    }

    /// Session changes happen under this lock so `stop`, `install` and
    /// `connection_lost` never interleave.
    fn lock_session(&self) -> MutexGuard<'_, CancellationToken> {
        match self.inner.session.lock() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_session(&self) -> CancellationToken {
        self.lock_session().clone()
    }

    fn swap_link(&self, next: Option<Arc<dyn BusLink>>) -> Option<Arc<dyn BusLink>> {
        match self.inner.link.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }

    /// Cancels the current session's tasks and closes its link.
    fn end_session(&self) {
        let previous = {
            let session = self.lock_session();
            session.cancel();
            self.set_state(ConnectionState::Disconnected);
            self.swap_link(None)
        };
        if let Some(link) = previous {
            link.close();
        }
    }

    /// Makes `link` the live connection. Refuses (and closes the link) once
    /// the manager has been stopped.
    async fn install(&self, link: Arc<dyn BusLink>) -> bool {
        let (session, previous) = {
            let mut current = self.lock_session();
            if self.inner.shutdown.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                drop(current);
                link.close();
                tracing::debug!(address = %self.inner.address, "connection arrived after stop; discarded");
                return false;
            }
            current.cancel();
            let session = self.inner.shutdown.child_token();
            *current = session.clone();
            let previous = self.swap_link(Some(Arc::clone(&link)));
            self.set_state(ConnectionState::Connected);
            (session, previous)
        };
        if let Some(previous) = previous {
            previous.close();
        }
        tracing::info!(address = %self.inner.address, "connected to bus");

        for topic in self.inner.handlers.topics() {
            match link.subscribe(topic).await {
                Ok(stream) => {
                    tracing::info!(topic, "subscribed to bus topic");
                    self.spawn_dispatch(topic, stream, session.clone());
                }
                Err(e) => tracing::warn!(topic, error = %e, "bus subscribe failed"),
            }
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let lost = tokio::select! {
                _ = session.cancelled() => false,
                _ = link.closed() => true,
            };
            if lost {
                manager.connection_lost(&session);
            }
        });
        true
    }

    fn spawn_dispatch(&self, topic: &str, mut stream: BoxStream<'static, InboundMessage>, session: CancellationToken) {
        let handlers = self.inner.handlers.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    next = stream.next() => match next {
                        Some(msg) => { handlers.dispatch(&msg); }
                        None => break,
                    },
                }
            }
            tracing::debug!(topic = %topic, "bus subscription ended");
        });
    }

    fn connection_lost(&self, session: &CancellationToken) {
        let dropped = {
            let current = self.lock_session();
            if session.is_cancelled() || self.inner.shutdown.is_cancelled() {
                return;
            }
            current.cancel();
            self.set_state(ConnectionState::Disconnected);
            self.swap_link(None)
        };
        if let Some(link) = dropped {
            link.close();
        }
        tracing::warn!(address = %self.inner.address, "bus connection dropped");
        self.spawn_reconnect_loop();
    }

    fn spawn_reconnect_loop(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect_loop().await });
    }

    async fn reconnect_loop(&self) {
        if self.attempt_reconnects().await {
            return;
        }
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.set_state(ConnectionState::GaveUp);
        tracing::error!(
            attempts = self.inner.policy.max_attempts(),
            address = %self.inner.address,
            "giving up on bus; notifications dropped until operator reconnect"
        );
    }

    /// Runs the bounded backoff schedule. `true` once a connection is
    /// installed, in which case the `reconnecting` flag is already clear.
    async fn attempt_reconnects(&self) -> bool {
        let policy = self.inner.policy;
        for attempt in 1..=policy.max_attempts() {
            let Some(delay) = policy.delay(attempt) else { break };
            {
                let _session = self.lock_session();
                if self.inner.shutdown.is_cancelled() {
                    return false;
                }
                self.set_state(ConnectionState::Reconnecting { attempt });
            }
            tracing::info!(attempt, delay_secs = delay.as_secs_f64(), "reconnecting to bus");
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.inner.transport.connect(&self.inner.address).await {
                Ok(link) => {
                    // Cleared before install so a drop seen by the new watcher can start a fresh loop.
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    if !self.install(link).await {
                        return false;
                    }
                    tracing::info!(attempt, "reconnected to bus");
                    return true;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "bus reconnect attempt failed"),
            }
        }
        false
    }
}
