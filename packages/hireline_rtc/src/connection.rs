//! Connection manager: one duplex channel per client session.
//!
//! The manager owns a supervisor task per connect cycle. The supervisor opens
//! the link, pumps inbound events into the session's channel, and on an
//! unintentional drop backs off exponentially before reopening. An explicit
//! `disconnect()` cancels the supervisor, so no reconnect follows it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::protocol::{ClientEvent, Reply, ServerEvent};

/// One outbound event. `reply` is set for requests that expect an ack.
#[derive(Debug)]
pub struct Outbound {
    pub event: ClientEvent,
    pub reply: Option<oneshot::Sender<Reply>>,
}

/// An open duplex channel. The link is considered dropped when `inbound`
/// yields `None`.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

pub type OpenFuture = Pin<Box<dyn Future<Output = Result<Link, ConnectionError>> + Send>>;

/// Opens links. Implemented by the transport adapter (websocket, QUIC, ...).
pub trait Connector: Send + Sync + 'static {
    fn open(&self, token: &str) -> OpenFuture;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, next_delay: Duration },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Connecting => f.write_str("Connecting..."),
            Self::Connected => f.write_str("Connected"),
            Self::Reconnecting {
                attempt,
                next_delay,
            } => write!(
                f,
                "Reconnecting (attempt {}, retrying in {}s)",
                attempt,
                next_delay.as_secs().max(1)
            ),
        }
    }
}

/// Connection lifecycle, delivered in order with inbound server events.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connect,
    Disconnect {
        reason: String,
    },
    ConnectError {
        attempt: u32,
        next_delay: Duration,
        error: ConnectionError,
    },
    Reconnecting {
        attempt: u32,
    },
    Reconnect {
        attempt: u32,
    },
    ReconnectFailed,
}

/// What the manager feeds into the session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Lifecycle(ConnectionEvent),
    Server(ServerEvent),
}

/// Sending side of the current link.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget. Events queued this way go out in call order.
    pub fn try_emit(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        self.tx
            .try_send(Outbound { event, reply: None })
            .map_err(|e| ConnectionError::Network(format!("outbound queue: {e}")))
    }

    /// Queue a request and hand back the ack slot to await elsewhere. The
    /// slot is dropped by the transport if the link dies before the ack.
    pub fn try_request(&self, event: ClientEvent) -> Result<oneshot::Receiver<Reply>, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .try_send(Outbound {
                event,
                reply: Some(tx),
            })
            .map_err(|e| ConnectionError::Network(format!("outbound queue: {e}")))?;
        Ok(rx)
    }

    /// The transport has released its end of the link.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Inner {
    /// Present while a supervisor is alive (connecting, connected or backing off).
    cancel: Option<CancellationToken>,
    generation: u64,
    outbox: Option<Outbox>,
}

struct Shared {
    inner: Mutex<Inner>,
    status: watch::Sender<ConnectionStatus>,
    /// Outcome of the latest open attempt; `None` while one is in flight.
    outcome: watch::Sender<Option<Result<(), ConnectionError>>>,
    retry_now: Notify,
}

/// Owns the session's duplex channel and its reconnect policy.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (outcome, _) = watch::channel(None);
        Self {
            connector,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    cancel: None,
                    generation: 0,
                    outbox: None,
                }),
                status,
                outcome,
                retry_now: Notify::new(),
            }),
            events,
        }
    }

    /// Open the channel. A call while a cycle is already running joins it
    /// instead of opening a second channel.
    ///
    /// Returns the outcome of the first attempt. A network failure leaves the
    /// manager backing off in the background; an auth failure is terminal.
    pub async fn connect(&self, token: &str) -> Result<(), ConnectionError> {
        let mut outcome_rx = self.shared.outcome.subscribe();
        // Set when the current outcome is stale and only the next one counts.
        let mut await_next = false;
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.cancel.is_some() {
                let status = self.status();
                let link_alive = inner.outbox.as_ref().is_some_and(|o| !o.is_closed());
                if status.is_connected() && link_alive {
                    return Ok(());
                }
                if status.is_connected() || matches!(status, ConnectionStatus::Reconnecting { .. }) {
                    // The link is gone or backing off; only the next attempt counts.
                    await_next = true;
                    self.shared.retry_now.notify_waiters();
                }
                debug!("connect already in progress, joining it");
            } else {
                let cancel = CancellationToken::new();
                inner.cancel = Some(cancel.clone());
                inner.generation += 1;
                self.shared.outcome.send_replace(None);
                self.shared.status.send_replace(ConnectionStatus::Connecting);

                let supervisor = Supervisor {
                    connector: self.connector.clone(),
                    token: token.to_string(),
                    config: self.config.clone(),
                    shared: self.shared.clone(),
                    events: self.events.clone(),
                    cancel,
                    generation: inner.generation,
                };
                tokio::spawn(supervisor.run());
            }
        }

        loop {
            let current = outcome_rx.borrow_and_update().clone();
            if !std::mem::take(&mut await_next) {
                if let Some(outcome) = current {
                    return outcome;
                }
            }
            if outcome_rx.changed().await.is_err() {
                return Err(ConnectionError::Network(
                    "connection manager dropped".to_string(),
                ));
            }
        }
    }

    /// Close the channel and suppress auto-reconnect.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        let Some(cancel) = inner.cancel.take() else {
            return;
        };
        cancel.cancel();
        inner.outbox = None;
        self.shared.status.send_replace(ConnectionStatus::Disconnected);
        self.shared
            .outcome
            .send_replace(Some(Err(ConnectionError::Network(
                "disconnected by client".to_string(),
            ))));
        info!("connection closed by client");
        let _ = self
            .events
            .send(ChannelEvent::Lifecycle(ConnectionEvent::Disconnect {
                reason: "client disconnect".to_string(),
            }));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Human-readable status line for the UI.
    pub fn status_text(&self) -> String {
        self.status().to_string()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Manual escape hatch: cut the current backoff short.
    pub fn retry_now(&self) {
        if matches!(self.status(), ConnectionStatus::Reconnecting { .. }) {
            self.shared.retry_now.notify_waiters();
        }
    }

    /// The sending side of the live link, if connected.
    pub async fn outbox(&self) -> Option<Outbox> {
        self.shared.inner.lock().await.outbox.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    token: String,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
    generation: u64,
}

impl Supervisor {
    async fn run(self) {
        let mut attempt = 0u32;
        let mut ever_connected = false;

        loop {
            if attempt > 0 {
                self.begin_attempt();
            }
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = tokio::time::timeout(
                    self.config.connect_timeout(),
                    self.connector.open(&self.token),
                ) => opened.unwrap_or_else(|_| {
                    Err(ConnectionError::Network("connect timed out".to_string()))
                }),
            };

            let failure = match opened {
                Ok(link) => {
                    if !self.attach(link.outbound).await {
                        break;
                    }
                    self.shared.outcome.send_replace(Some(Ok(())));
                    self.shared.status.send_replace(ConnectionStatus::Connected);
                    let lifecycle = if ever_connected {
                        info!(attempt, "reconnected");
                        ConnectionEvent::Reconnect { attempt }
                    } else {
                        info!("connected");
                        ConnectionEvent::Connect
                    };
                    self.emit(lifecycle);
                    ever_connected = true;
                    attempt = 0;

                    let Some(reason) = self.pump(link.inbound).await else {
                        break;
                    };
                    self.detach().await;
                    warn!(%reason, "connection lost");
                    self.emit(ConnectionEvent::Disconnect { reason });
                    None
                }
                Err(error) if !error.is_retryable() => {
                    warn!(%error, "connect rejected, not retrying");
                    self.shared.outcome.send_replace(Some(Err(error.clone())));
                    self.emit(ConnectionEvent::ConnectError {
                        attempt,
                        next_delay: Duration::ZERO,
                        error,
                    });
                    break;
                }
                Err(error) => {
                    self.shared.outcome.send_replace(Some(Err(error.clone())));
                    Some(error)
                }
            };

            attempt += 1;
            let max = self.config.max_reconnect_attempts;
            if max > 0 && attempt > max {
                warn!(attempts = max, "giving up on reconnect");
                self.emit(ConnectionEvent::ReconnectFailed);
                break;
            }

            let next_delay = self.config.backoff(attempt);
            if let Some(error) = failure {
                debug!(%error, attempt, ?next_delay, "connect attempt failed");
                self.emit(ConnectionEvent::ConnectError {
                    attempt,
                    next_delay,
                    error,
                });
            }
            // Registered before the status flips so a retry_now() seeing
            // Reconnecting always reaches this sleep and nothing later.
            let retry = self.shared.retry_now.notified();
            tokio::pin!(retry);
            retry.as_mut().enable();
            self.shared.status.send_replace(ConnectionStatus::Reconnecting {
                attempt,
                next_delay,
            });
            self.emit(ConnectionEvent::Reconnecting { attempt });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(next_delay) => {}
                _ = &mut retry => {
                    debug!(attempt, "manual retry, skipping backoff");
                }
            }
        }

        self.finish().await;
    }

    /// Forward inbound events until the link drops (`Some(reason)`) or the
    /// cycle is cancelled (`None`).
    async fn pump(&self, mut inbound: mpsc::Receiver<ServerEvent>) -> Option<String> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                event = inbound.recv() => match event {
                    Some(event) => {
                        if self.events.send(ChannelEvent::Server(event)).is_err() {
                            return None;
                        }
                    }
                    None => return Some("transport closed".to_string()),
                },
            }
        }
    }

    async fn attach(&self, tx: mpsc::Sender<Outbound>) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != self.generation || self.cancel.is_cancelled() {
            return false;
        }
        inner.outbox = Some(Outbox::new(tx));
        true
    }

    /// Link dropped: stop reporting Connected before the backoff starts.
    async fn detach(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation == self.generation {
            inner.outbox = None;
            self.shared.outcome.send_replace(None);
            self.shared.status.send_replace(ConnectionStatus::Connecting);
        }
    }

    fn begin_attempt(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.shared.outcome.send_replace(None);
        self.shared.status.send_replace(ConnectionStatus::Connecting);
    }

    async fn finish(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != self.generation {
            return;
        }
        inner.outbox = None;
        if !self.cancel.is_cancelled() {
            inner.cancel = None;
            self.shared.status.send_replace(ConnectionStatus::Disconnected);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(ChannelEvent::Lifecycle(event));
    }
}
