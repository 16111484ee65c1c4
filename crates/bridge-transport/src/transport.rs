//! Connection lifecycle: backoff reconnect, heartbeat, outbound queue.
//!
//! The transport runs as a background actor that owns the socket. A thin
//! `BridgeTransport` facade talks to it over channels, so the same actor
//! can be addressed either directly (in-process, "inline" mode) or via a
//! handle obtained from a sidecar task that keeps running across a
//! controller-host teardown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, info, warn};

use core_types::{AgentError, AgentErrorKind, ConnectionState};

use crate::messages::{parse_server_message, ControllerMessage, ServerMessage};
use crate::socket::Socket;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const SIDECAR_READY_DEADLINE: Duration = Duration::from_millis(500);
const SIDECAR_HANDSHAKE_RETRIES: u32 = 3;
const SIDECAR_HANDSHAKE_INTERVAL: Duration = Duration::from_millis(300);

#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn send(&self, message: ControllerMessage) -> Result<(), AgentError>;
    async fn recv(&self) -> Option<ServerMessage>;
    fn connection_state(&self) -> ConnectionState;
}

fn state_from_u8(value: u8) -> ConnectionState {
    match value {
        0 => ConnectionState::Disconnected,
        1 => ConnectionState::Connecting,
        2 => ConnectionState::Connected,
        _ => ConnectionState::Error,
    }
}

fn state_to_u8(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Error => 3,
    }
}

/// Factory that produces a fresh socket on (re)connect. Boxed so the same
/// transport type works whether the underlying channel is TCP or an
/// in-process pair.
pub type SocketFactory =
    Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<Box<dyn Socket>, AgentError>> + Send + Sync>;

struct Shared {
    state: AtomicU8,
    reconnect_attempt: AtomicU32,
    outbound: Mutex<VecDeque<ControllerMessage>>,
    wake: Notify,
}

/// Runs directly in the controller's process.
pub struct InlineBridge {
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::Receiver<ServerMessage>>,
    outbound_tx: mpsc::Sender<ControllerMessage>,
    _actor: tokio::task::JoinHandle<()>,
}

impl InlineBridge {
    pub fn spawn(factory: SocketFactory) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(state_to_u8(ConnectionState::Disconnected)),
            reconnect_attempt: AtomicU32::new(0),
            outbound: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControllerMessage>(1024);

        let actor_shared = shared.clone();
        let actor = tokio::spawn(async move {
            // Re-enqueue everything handed to us through the channel into
            // the durable FIFO queue the reconnect loop drains.
            let enqueue_shared = actor_shared.clone();
            let enqueue_task = tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    enqueue_shared.outbound.lock().await.push_back(message);
                    enqueue_shared.wake.notify_one();
                }
            });

            run_connection_loop(actor_shared, factory, inbound_tx).await;
            enqueue_task.abort();
        });

        Self {
            shared,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            _actor: actor,
        }
    }
}

#[async_trait]
impl BridgeTransport for InlineBridge {
    async fn send(&self, message: ControllerMessage) -> Result<(), AgentError> {
        self.outbound_tx.send(message).await.map_err(|_| {
            AgentError::new(AgentErrorKind::Transport).with_hint("bridge actor has stopped")
        })
    }

    async fn recv(&self) -> Option<ServerMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    fn connection_state(&self) -> ConnectionState {
        state_from_u8(self.shared.state.load(Ordering::Relaxed))
    }
}

/// Runs on top of an `InlineBridge` hosted by a sidecar task, adding the
/// probe/handshake dance the controller performs when it comes back up
/// after its own process was torn down and the sidecar was not.
pub struct SidecarBridge {
    inner: Arc<InlineBridge>,
}

impl SidecarBridge {
    pub fn new(inner: Arc<InlineBridge>) -> Self {
        Self { inner }
    }

    /// Probes the sidecar for readiness, then retries a handshake ping up
    /// to `SIDECAR_HANDSHAKE_RETRIES` times. Returns once the sidecar
    /// reports `Connected`, or the error from the final attempt.
    pub async fn reconnect(&self) -> Result<(), AgentError> {
        let probe_deadline = tokio::time::Instant::now() + SIDECAR_READY_DEADLINE;
        while tokio::time::Instant::now() < probe_deadline {
            if self.inner.connection_state() != ConnectionState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut last_err = AgentError::new(AgentErrorKind::Transport)
            .with_hint("sidecar never became ready")
            .retriable(true);

        for attempt in 1..=SIDECAR_HANDSHAKE_RETRIES {
            match self.inner.send(ControllerMessage::Ping).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(target: "bridge-transport", attempt, ?err, "sidecar handshake attempt failed");
                    last_err = err;
                    tokio::time::sleep(SIDECAR_HANDSHAKE_INTERVAL).await;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl BridgeTransport for SidecarBridge {
    async fn send(&self, message: ControllerMessage) -> Result<(), AgentError> {
        self.inner.send(message).await
    }

    async fn recv(&self) -> Option<ServerMessage> {
        self.inner.recv().await
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }
}

async fn run_connection_loop(
    shared: Arc<Shared>,
    factory: SocketFactory,
    inbound_tx: mpsc::Sender<ServerMessage>,
) {
    loop {
        shared
            .state
            .store(state_to_u8(ConnectionState::Connecting), Ordering::Relaxed);

        let socket = match factory().await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(target: "bridge-transport", ?err, "connect failed");
                if !backoff_and_continue(&shared).await {
                    shared
                        .state
                        .store(state_to_u8(ConnectionState::Error), Ordering::Relaxed);
                    return;
                }
                continue;
            }
        };

        shared.reconnect_attempt.store(0, Ordering::Relaxed);
        shared
            .state
            .store(state_to_u8(ConnectionState::Connected), Ordering::Relaxed);
        info!(target: "bridge-transport", "connected");

        drain_and_serve(&shared, socket, &inbound_tx).await;

        shared
            .state
            .store(state_to_u8(ConnectionState::Disconnected), Ordering::Relaxed);
        info!(target: "bridge-transport", "disconnected");

        if !backoff_and_continue(&shared).await {
            shared
                .state
                .store(state_to_u8(ConnectionState::Error), Ordering::Relaxed);
            return;
        }
    }
}

async fn backoff_and_continue(shared: &Arc<Shared>) -> bool {
    let attempt = shared.reconnect_attempt.fetch_add(1, Ordering::Relaxed) + 1;
    if attempt > MAX_RECONNECT_ATTEMPTS {
        warn!(target: "bridge-transport", attempt, "exhausted reconnect attempts");
        return false;
    }
    let delay = BACKOFF_BASE * 2u32.pow(attempt.saturating_sub(1));
    debug!(target: "bridge-transport", attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
    tokio::time::sleep(delay).await;
    true
}

async fn drain_and_serve(
    shared: &Arc<Shared>,
    mut socket: Box<dyn Socket>,
    inbound_tx: &mpsc::Sender<ServerMessage>,
) {
    // Drain anything queued while disconnected, FIFO.
    loop {
        let next = shared.outbound.lock().await.pop_front();
        match next {
            Some(message) => {
                if write_message(&mut socket, &message).await.is_err() {
                    shared.outbound.lock().await.push_front(message);
                    return;
                }
            }
            None => break,
        }
    }

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if write_message(&mut socket, &ControllerMessage::Ping).await.is_err() {
                    return;
                }
            }
            _ = shared.wake.notified() => {
                loop {
                    let next = shared.outbound.lock().await.pop_front();
                    match next {
                        Some(message) => {
                            if write_message(&mut socket, &message).await.is_err() {
                                shared.outbound.lock().await.push_front(message);
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }
            line = socket.read_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if let Some(message) = parse_server_message(&raw) {
                            if inbound_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) | Err(_) => return,
                }
            }
        }
    }
}

async fn write_message(
    socket: &mut Box<dyn Socket>,
    message: &ControllerMessage,
) -> Result<(), AgentError> {
    let line = serde_json::to_string(message).map_err(|err| {
        AgentError::new(AgentErrorKind::Internal).with_hint(format!("encode message: {err}"))
    })?;
    socket.write_line(&line).await
}
