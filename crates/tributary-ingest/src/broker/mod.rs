//! Broker adapter: connection state machine, pull loop, and positional acks.
//!
//! The adapter owns the `ConnectionState` and the reconnect policy. A
//! [`BrokerTransport`] only knows how to open a session, stream deliveries
//! and acknowledge a delivery tag, so the same state machine drives AMQP in
//! production and the in-memory broker in tests and replays.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use tributary_core::{AckToken, ConnectionError, ConnectionErrorKind, ConnectionState, RawMessage};

use crate::backoff::reconnect_delay;
use crate::config::BrokerConfig;
use crate::error::{IngestError, Result};

pub use amqp::AmqpTransport;
pub use memory::MemoryBroker;

// ── Transport Seam ───────────────────────────────────────────────

/// One message as handed over by a transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery tag, unique and increasing within one connection.
    pub tag: u64,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

pub type DeliveryStream = BoxStream<'static, std::result::Result<Delivery, ConnectionError>>;

/// Opens sessions against a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn connect(
        &self,
        config: &BrokerConfig,
    ) -> std::result::Result<Arc<dyn BrokerConnection>, ConnectionError>;
}

/// An authenticated broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Start consuming `topic`, resuming after the last acknowledged message.
    async fn consume(&self, topic: &str) -> std::result::Result<DeliveryStream, ConnectionError>;

    /// Acknowledge one delivery tag of this session.
    async fn ack(&self, tag: u64) -> std::result::Result<(), ConnectionError>;

    async fn close(&self);
}

// ── Health ───────────────────────────────────────────────────────

/// Point-in-time adapter health for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub state: ConnectionState,
    /// Milliseconds since the last delivery, if any arrived yet.
    pub last_message_age_ms: Option<u64>,
    pub session: u64,
    pub reconnects: u64,
    pub fatal_error: Option<String>,
}

/// What an [`BrokerAdapter::acknowledge`] call did to the committed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The broker position moved past the token.
    Acknowledged,
    /// The token belongs to an earlier session; nothing was sent.
    Stale,
}

// ── Adapter ──────────────────────────────────────────────────────

struct Shared {
    state: Mutex<ConnectionState>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    session: AtomicU64,
    /// Highest tag acknowledged in the current session.
    last_acked: Mutex<Option<AckToken>>,
    last_message_at: Mutex<Option<Instant>>,
    reconnects: AtomicU64,
    fatal: Mutex<Option<ConnectionError>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Apply a state transition if the state machine allows it.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        let current = *state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            tracing::debug!(from = %current, to = %next, "Ignoring disallowed connection transition");
            return false;
        }
        tracing::info!(from = %current, to = %next, "Broker connection state changed");
        *state = next;
        true
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Install a fresh connection and start a new ack session.
    fn install(&self, connection: Arc<dyn BrokerConnection>) -> u64 {
        *self.connection.lock() = Some(connection);
        *self.last_acked.lock() = None;
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Reliable, ordered delivery from one broker topic with automatic reconnection.
pub struct BrokerAdapter {
    config: BrokerConfig,
    buffer_capacity: usize,
    transport: Arc<dyn BrokerTransport>,
    shared: Arc<Shared>,
}

impl BrokerAdapter {
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn BrokerTransport>,
        buffer_capacity: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            buffer_capacity: buffer_capacity.max(1),
            transport,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                connection: Mutex::new(None),
                session: AtomicU64::new(0),
                last_acked: Mutex::new(None),
                last_message_at: Mutex::new(None),
                reconnects: AtomicU64::new(0),
                fatal: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Open and authenticate a broker session.
    ///
    /// Transient failures (refused or dropped sockets) are retried with the
    /// reconnect policy's backoff and attempt limit. Handshake and credential
    /// failures are returned at once and recorded as fatal.
    pub async fn connect(&self) -> std::result::Result<(), ConnectionError> {
        if !self.shared.transition(ConnectionState::Connecting) {
            return Err(ConnectionError::closed(format!(
                "cannot connect while {}",
                self.shared.state()
            )));
        }

        let policy = &self.config.reconnect;
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut attempt: u32 = 0;
        let failure = loop {
            attempt += 1;
            let e = match self.transport.connect(&self.config).await {
                Ok(connection) => {
                    let session = self.shared.install(connection);
                    tracing::info!(
                        host = %self.config.host,
                        port = self.config.port,
                        session,
                        attempt,
                        "Connected to broker"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            let retry = e.is_transient() && policy.max_attempts.map_or(true, |max| attempt < max);
            if !retry {
                break e;
            }
            let delay = reconnect_delay(attempt, policy.initial_backoff_ms, policy.max_backoff_ms);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Broker connection attempt failed; retrying"
            );
            tokio::select! {
                _ = wait_for_signal(&mut shutdown) => {
                    return Err(ConnectionError::closed("shutdown during connect"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        tracing::error!(attempt, error = %failure, "Broker connection failed");
        self.shared.transition(ConnectionState::Disconnected);
        *self.shared.fatal.lock() = Some(failure.clone());
        Err(failure)
    }

    /// Subscribe to `topic` and return the raw message stream.
    ///
    /// Messages arrive in broker order. The stream survives transient
    /// disconnects; it ends only on shutdown or a fatal connection error,
    /// which [`BrokerAdapter::fatal_error`] then reports.
    pub async fn subscribe(&self, topic: &str) -> std::result::Result<MessageStream, ConnectionError> {
        let connection = self
            .shared
            .connection
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::closed("subscribe called before connect"))?;

        let deliveries = match connection.consume(topic).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.shared.transition(ConnectionState::Disconnected);
                *self.shared.fatal.lock() = Some(e.clone());
                return Err(e);
            }
        };

        if !self.shared.transition(ConnectionState::Subscribed) {
            return Err(ConnectionError::closed("adapter closed during subscribe"));
        }
        tracing::info!(topic, "Subscribed to topic");

        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let pull = PullLoop {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            topic: topic.to_string(),
        };
        tokio::spawn(pull.run(deliveries, tx));

        Ok(MessageStream { rx })
    }

    /// Advance the broker's committed position past `token`.
    ///
    /// Tokens from an earlier session are ignored and reported as
    /// [`AckOutcome::Stale`]: that session's unacked deliveries were already
    /// returned to the queue and will be redelivered.
    pub async fn acknowledge(&self, token: AckToken) -> Result<AckOutcome> {
        let session = self.shared.session.load(Ordering::SeqCst);
        if token.session() != session {
            tracing::debug!(token = %token, session, "Skipping ack from a previous session");
            return Ok(AckOutcome::Stale);
        }

        {
            let last = self.shared.last_acked.lock();
            if let Some(last) = *last {
                if token.tag() <= last.tag() {
                    return Err(IngestError::AckRegression {
                        token: token.to_string(),
                        last: last.to_string(),
                    });
                }
            }
        }

        let connection = self
            .shared
            .connection
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::closed("no broker session to acknowledge on"))?;
        connection.ack(token.tag()).await?;

        let mut last = self.shared.last_acked.lock();
        // A reconnect may have replaced the session while the ack was on the wire.
        if self.shared.session.load(Ordering::SeqCst) == token.session() {
            *last = Some(token);
        }
        Ok(AckOutcome::Acknowledged)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Current ack session; increments on every (re)connection.
    pub fn session(&self) -> u64 {
        self.shared.session.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> AdapterHealth {
        AdapterHealth {
            state: self.shared.state(),
            last_message_age_ms: self
                .shared
                .last_message_at
                .lock()
                .map(|at| at.elapsed().as_millis() as u64),
            session: self.shared.session.load(Ordering::SeqCst),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            fatal_error: self.shared.fatal.lock().as_ref().map(|e| e.to_string()),
        }
    }

    /// The error that stopped the stream, if it stopped on its own.
    pub fn fatal_error(&self) -> Option<ConnectionError> {
        self.shared.fatal.lock().clone()
    }

    /// Close the session and move to the terminal `Closed` state.
    pub async fn shutdown(&self) {
        self.shared.transition(ConnectionState::Closed);
        self.shared.shutdown.send_replace(true);
        let connection = self.shared.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        tracing::info!("Broker adapter closed");
    }
}

// ── Pull Loop ────────────────────────────────────────────────────

struct PullLoop {
    shared: Arc<Shared>,
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    topic: String,
}

impl PullLoop {
    async fn run(self, mut deliveries: DeliveryStream, tx: mpsc::Sender<RawMessage>) {
        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            let next = tokio::select! {
                _ = wait_for_signal(&mut shutdown) => break,
                next = deliveries.next() => next,
            };

            let failure = match next {
                Some(Ok(delivery)) => {
                    let message = self.stamp(delivery);
                    // A full buffer suspends the pull loop, which in turn
                    // stops pulling from the broker.
                    let sent = tokio::select! {
                        _ = wait_for_signal(&mut shutdown) => break,
                        sent = tx.send(message) => sent,
                    };
                    if sent.is_err() {
                        tracing::debug!(topic = %self.topic, "Message stream dropped by consumer");
                        break;
                    }
                    continue;
                }
                Some(Err(e)) => e,
                None => ConnectionError::io("delivery stream ended"),
            };

            if self.shared.is_shutting_down() {
                break;
            }
            if !failure.is_transient() {
                self.fail(failure);
                break;
            }

            tracing::warn!(topic = %self.topic, error = %failure, "Broker connection degraded");
            match self.reconnect(&mut shutdown).await {
                Ok(stream) => deliveries = stream,
                Err(e) if e.kind == ConnectionErrorKind::Closed => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }

        tracing::debug!(topic = %self.topic, "Pull loop stopped");
    }

    fn stamp(&self, delivery: Delivery) -> RawMessage {
        let session = self.shared.session.load(Ordering::SeqCst);
        *self.shared.last_message_at.lock() = Some(Instant::now());
        RawMessage {
            topic: self.topic.clone(),
            payload: delivery.payload,
            headers: delivery.headers,
            received_at: Utc::now(),
            ack_token: AckToken::new(session, delivery.tag),
        }
    }

    fn fail(&self, error: ConnectionError) {
        tracing::error!(topic = %self.topic, error = %error, "Broker stream stopped on fatal error");
        *self.shared.fatal.lock() = Some(error);
        self.shared.transition(ConnectionState::Disconnected);
    }

    /// Reconnect with capped, jittered backoff and resume consuming.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<DeliveryStream, ConnectionError> {
        if !self.shared.transition(ConnectionState::Degraded) {
            return Err(ConnectionError::closed("adapter closed"));
        }
        let stale = self.shared.connection.lock().take();
        if let Some(stale) = stale {
            stale.close().await;
        }

        let policy = &self.config.reconnect;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(max) = policy.max_attempts {
                if attempt > max {
                    return Err(ConnectionError::io(format!(
                        "gave up reconnecting after {max} attempts"
                    )));
                }
            }

            let delay: Duration =
                reconnect_delay(attempt, policy.initial_backoff_ms, policy.max_backoff_ms);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to broker");
            tokio::select! {
                _ = wait_for_signal(shutdown) => {
                    return Err(ConnectionError::closed("shutdown during reconnect"));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let connection = match self.transport.connect(&self.config).await {
                Ok(connection) => connection,
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match connection.consume(&self.topic).await {
                Ok(stream) => {
                    let session = self.shared.install(connection);
                    if !self.shared.transition(ConnectionState::Subscribed) {
                        return Err(ConnectionError::closed("adapter closed during reconnect"));
                    }
                    self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(topic = %self.topic, session, attempt, "Broker subscription resumed");
                    return Ok(stream);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "Resubscribe attempt failed");
                    connection.close().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Resolve once the flag turns true. A dropped sender never signals.
pub(crate) async fn wait_for_signal(rx: &mut watch::Receiver<bool>) {
    let signalled = rx.wait_for(|flag| *flag).await.map(|_| ());
    if signalled.is_err() {
        std::future::pending::<()>().await;
    }
}

// ── Message Stream ───────────────────────────────────────────────

/// Raw messages from a subscription, bounded by the adapter's buffer.
pub struct MessageStream {
    rx: mpsc::Receiver<RawMessage>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<RawMessage> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = RawMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RawMessage>> {
        self.rx.poll_recv(cx)
    }
}
