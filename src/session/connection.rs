//! Connection manager: exactly one live duplex socket per session.
//!
//! The manager is an explicit state machine. Every asynchronous transport
//! event (open result, stream end, retry timer, end-call) is reduced to a
//! [`ConnEvent`] and folded through the pure [`transition`] function, which
//! returns the next status plus the effects to execute. The async driver
//! in [`ConnectionManager::run`] only produces events and interprets
//! effects; it makes no state decisions of its own.
//!
//! Recovery: a lost socket schedules exactly one retry after a fixed delay
//! while the session is still live. Attempts reset on every successful
//! open. Exhausting the configured ceiling parks the session in the
//! terminal `Disconnected` state; an explicit end-call parks it in
//! `Closed`. Both are final — no further effects are produced.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectConfig;
use crate::session::protocol::{classify_binary, classify_text, InboundMessage, OutboundMessage};
use crate::session::SessionConfig;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

// ── Status & state machine ────────────────────────────────────────

/// Connection status, reflected to the UI at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Socket open in progress.
    Connecting,
    /// Socket live; config has been (re)sent.
    Connected,
    /// Socket lost; a retry is pending.
    Reconnecting,
    /// Retry ceiling exhausted. Terminal.
    Disconnected,
    /// Ended by the user. Terminal, reachable only via end-call.
    Closed,
}

/// Discrete events the transport produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// `connect` succeeded.
    Opened,
    /// `connect` failed.
    OpenFailed,
    /// The live stream ended — peer close and socket error are the same
    /// event; error is not a distinct state.
    StreamEnded,
    /// The fixed reconnect delay elapsed.
    RetryElapsed,
    /// The user ended the call.
    EndRequested,
}

/// Effects the driver executes after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEffect {
    /// Establish the socket.
    Open,
    /// Send the current session config, then pump inbound messages until
    /// the stream ends.
    SendConfigAndReceive,
    /// Sleep the fixed delay, cancellable by end-call.
    ScheduleRetry(Duration),
}

/// Retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub last_delay: Duration,
}

impl ReconnectState {
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Pure transition function: `(state, event) → (state, effects)`.
///
/// Reconnection is attempted only while the session is live
/// (`ended_by_user == false`) and the attempt ceiling has not been hit.
pub fn transition(
    status: ConnectionStatus,
    event: ConnEvent,
    ended_by_user: bool,
    reconnect: &mut ReconnectState,
    policy: &ReconnectConfig,
) -> (ConnectionStatus, Vec<ConnEffect>) {
    use ConnectionStatus::*;

    if matches!(event, ConnEvent::EndRequested) {
        return (Closed, Vec::new());
    }

    match (status, event) {
        (Connecting, ConnEvent::Opened) => {
            reconnect.reset();
            (Connected, vec![ConnEffect::SendConfigAndReceive])
        }
        (Connecting, ConnEvent::OpenFailed) | (Connected, ConnEvent::StreamEnded) => {
            if ended_by_user {
                return (Closed, Vec::new());
            }
            reconnect.attempts += 1;
            reconnect.last_delay = policy.delay();
            if let Some(max) = policy.max_attempts {
                if reconnect.attempts > max {
                    return (Disconnected, Vec::new());
                }
            }
            (Reconnecting, vec![ConnEffect::ScheduleRetry(policy.delay())])
        }
        (Reconnecting, ConnEvent::RetryElapsed) => (Connecting, vec![ConnEffect::Open]),
        // Stale or out-of-order event — hold position.
        (status, _) => (status, Vec::new()),
    }
}

// ── Handle ────────────────────────────────────────────────────────

/// Cheap-to-clone handle other components use to reach the socket.
///
/// The sink slot is the single mutable access point to the underlying
/// socket; no free-standing reference to it exists anywhere else.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: Arc<Mutex<Option<WsSink>>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch stream of status transitions.
    pub fn status_stream(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Send an outbound message, best-effort.
    ///
    /// Fails silently when no socket is open: outbound audio is live-only
    /// and is never buffered or retransmitted.
    pub async fn send(&self, msg: &OutboundMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound message");
                return;
            }
        };

        let mut guard = self.sender.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    tracing::warn!(error = %e, "socket send failed, dropping message");
                }
            }
            None => {
                tracing::debug!("no socket open, dropping outbound message");
            }
        }
    }

    /// End-call path: cancel the driver (including any pending retry) and
    /// close the socket. Irreversible.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut guard = self.sender.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
    }
}

// ── Driver ────────────────────────────────────────────────────────

/// Owns the socket lifecycle for one session.
pub struct ConnectionManager {
    url: String,
    policy: ReconnectConfig,
    session_config: watch::Receiver<SessionConfig>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
    sender: Arc<Mutex<Option<WsSink>>>,
    reconnect: ReconnectState,
    cancel: CancellationToken,
    /// Receive half of the live socket, held between open and receive.
    stream: Option<futures_util::stream::SplitStream<WsStream>>,
}

impl ConnectionManager {
    pub fn new(
        url: String,
        policy: ReconnectConfig,
        session_config: watch::Receiver<SessionConfig>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> (Self, ConnectionHandle) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let sender = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let handle = ConnectionHandle {
            sender: Arc::clone(&sender),
            status_rx,
            cancel: cancel.clone(),
        };

        (
            Self {
                url,
                policy,
                session_config,
                inbound_tx,
                status_tx,
                sender,
                reconnect: ReconnectState::default(),
                cancel,
                stream: None,
            },
            handle,
        )
    }

    /// Drive the connection until a terminal state.
    pub async fn run(mut self) {
        let mut status = ConnectionStatus::Connecting;
        let mut effects: VecDeque<ConnEffect> = VecDeque::from([ConnEffect::Open]);

        while let Some(effect) = effects.pop_front() {
            let event = match effect {
                ConnEffect::Open => self.do_open().await,
                ConnEffect::SendConfigAndReceive => {
                    self.send_current_config().await;
                    self.do_receive().await
                }
                ConnEffect::ScheduleRetry(delay) => self.do_wait(delay).await,
            };

            let (next, new_effects) = transition(
                status,
                event,
                self.cancel.is_cancelled(),
                &mut self.reconnect,
                &self.policy,
            );
            if next != status {
                tracing::info!(from = ?status, to = ?next, event = ?event, "connection transition");
                status = next;
                self.status_tx.send_replace(status);
            }
            effects.extend(new_effects);
        }

        if status == ConnectionStatus::Disconnected {
            tracing::error!(
                attempts = self.reconnect.attempts,
                "reconnect attempts exhausted, giving up"
            );
        }
        // Make sure the sink slot never outlives the driver.
        self.sender.lock().await.take();
    }

    async fn do_open(&mut self) -> ConnEvent {
        tracing::info!(url = %self.url, "opening socket");
        let attempt = tokio::select! {
            result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
            () = self.cancel.cancelled() => return ConnEvent::EndRequested,
        };
        match attempt {
            Ok((ws, _response)) => {
                let (sink, stream) = ws.split();
                *self.sender.lock().await = Some(sink);
                self.stream = Some(stream);
                ConnEvent::Opened
            }
            Err(e) => {
                tracing::warn!(error = %e, "socket open failed");
                ConnEvent::OpenFailed
            }
        }
    }

    /// The remote must learn the session config before any audio arrives.
    async fn send_current_config(&mut self) {
        let config = self.session_config.borrow().clone();
        let msg = OutboundMessage::config(&config);
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize config message");
                return;
            }
        };
        let mut guard = self.sender.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                tracing::warn!(error = %e, "failed to send config after connect");
            }
        }
    }

    /// Pump inbound messages until the stream ends one way or another.
    async fn do_receive(&mut self) -> ConnEvent {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => return ConnEvent::StreamEnded,
        };

        let outcome = loop {
            let message = tokio::select! {
                msg = stream.next() => msg,
                () = self.cancel.cancelled() => break ConnEvent::EndRequested,
            };

            match message {
                Some(Ok(WsMessage::Binary(data))) => {
                    if !self.route(classify_binary(data.to_vec())).await {
                        break ConnEvent::EndRequested;
                    }
                }
                Some(Ok(WsMessage::Text(text))) => {
                    if !self.route(classify_text(&text)).await {
                        break ConnEvent::EndRequested;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(frame = ?frame, "socket closed by peer");
                    break ConnEvent::StreamEnded;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    // Error and close share the recovery path.
                    tracing::warn!(error = %e, "socket error, treating as close");
                    break ConnEvent::StreamEnded;
                }
                None => {
                    tracing::info!("socket stream ended");
                    break ConnEvent::StreamEnded;
                }
            }
        };

        // Drop the dead sink so send() fails silently from here on.
        self.sender.lock().await.take();
        outcome
    }

    /// Forward a classified message upward; false when the session
    /// controller is gone.
    async fn route(&self, message: InboundMessage) -> bool {
        match message {
            InboundMessage::Unrecognized => {
                tracing::warn!("unrecognized inbound payload, dropping");
                true
            }
            other => {
                if self.inbound_tx.send(other).await.is_err() {
                    tracing::debug!("session controller gone, stopping receive");
                    return false;
                }
                true
            }
        }
    }

    async fn do_wait(&self, delay: Duration) -> ConnEvent {
        tracing::info!(delay_secs = delay.as_secs(), "scheduling reconnect");
        tokio::select! {
            () = tokio::time::sleep(delay) => ConnEvent::RetryElapsed,
            () = self.cancel.cancelled() => ConnEvent::EndRequested,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
