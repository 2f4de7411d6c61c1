//! Connection Manager
//!
//! Owns the broker transport and drives the session state machine on a
//! single event-loop task. Everything else talks to it through a cloneable
//! [`ConnectionHandle`]: commands go in over an `mpsc` channel, state comes
//! out over a `watch` channel and every accepted transition is broadcast.
//!
//! Each transition is published (watch, broadcast, health condition,
//! metrics) before the loop moves on.
//!
//! Snapshot answers are not handed back to the caller directly: the loop
//! stages them on the event pipeline at the point the response was read, so
//! they are applied in stream order with the events around them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use crate::application::backoff::{BackoffConfig, BackoffPolicy};
use crate::application::health::HealthMonitor;
use crate::application::pipeline::{PipelineSender, SnapshotOutcome};
use crate::application::ports::{
    BrokerRequest, BrokerResponse, BrokerSession, BrokerTransport, Credentials, InboundMessage,
    OutboundEnvelope, RequestId, TransportError,
};
use crate::domain::connection::{ConnectionState, StateTransition, TransitionReason};
use crate::domain::{AccountId, EventId};
use crate::error::GatewayError;

const COMMAND_BUFFER: usize = 256;
const TRANSITION_BUFFER: usize = 64;

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Login credentials.
    pub credentials: Credentials,
    /// Upper bound on establishing the transport.
    pub connect_timeout: Duration,
    /// Upper bound on the login exchange.
    pub auth_timeout: Duration,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl ConnectionSettings {
    /// Settings with default timing.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

#[derive(Debug)]
enum Command {
    Start,
    Reconnect,
    Shutdown { done: oneshot::Sender<()> },
    Send { request: BrokerRequest, reply: Reply<()> },
    Request { request: BrokerRequest, reply: Reply<BrokerResponse> },
    Snapshot {
        account_id: AccountId,
        order_cursor: Option<EventId>,
        reply: Reply<SnapshotOutcome>,
    },
}

/// Where a correlated response goes.
#[derive(Debug)]
enum Pending {
    Caller(Reply<BrokerResponse>),
    /// Staged on the pipeline; the caller hears once it is applied.
    Snapshot {
        account_id: AccountId,
        reply: Reply<SnapshotOutcome>,
    },
}

impl Pending {
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Caller(reply) => reply.is_closed(),
            Self::Snapshot { reply, .. } => reply.is_closed(),
        }
    }

    fn fail(self, error: GatewayError) {
        match self {
            Self::Caller(reply) => {
                let _ = reply.send(Err(error));
            }
            Self::Snapshot { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// What a busy phase should do after a command arrived.
enum Interrupt {
    None,
    Reconnect,
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Answer a command that arrives while no session is usable.
fn refuse(command: Option<Command>, state: ConnectionState) -> Interrupt {
    match command {
        None => Interrupt::Shutdown(None),
        Some(Command::Shutdown { done }) => Interrupt::Shutdown(Some(done)),
        Some(Command::Reconnect) => Interrupt::Reconnect,
        Some(Command::Start) => Interrupt::None,
        Some(Command::Send { reply, .. }) => {
            let _ = reply.send(Err(GatewayError::NotConnected(state)));
            Interrupt::None
        }
        Some(Command::Request { reply, .. }) => {
            let _ = reply.send(Err(GatewayError::NotConnected(state)));
            Interrupt::None
        }
        Some(Command::Snapshot { reply, .. }) => {
            let _ = reply.send(Err(GatewayError::NotConnected(state)));
            Interrupt::None
        }
    }
}

async fn await_reply<T>(
    rx: oneshot::Receiver<Result<T, GatewayError>>,
    timeout: Duration,
    kind: &'static str,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GatewayError::SessionLost),
        Err(_) => {
            metrics::counter!("gateway_request_timeouts_total", "request" => kind).increment(1);
            Err(GatewayError::Timeout(kind.to_string()))
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Cloneable handle to the connection event loop.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    last_error: Arc<Mutex<Option<GatewayError>>>,
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Begin connecting. No-op unless disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShuttingDown`] if the event loop has stopped.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.command(Command::Start).await
    }

    /// Drop the current session and connect again.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShuttingDown`] if the event loop has stopped.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        self.command(Command::Reconnect).await
    }

    /// Close the session and stop the event loop. Waits until it has
    /// stopped.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observe state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Receive every accepted transition from now on.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// The error behind the most recent failure transition.
    #[must_use]
    pub fn last_error(&self) -> Option<GatewayError> {
        self.last_error.lock().clone()
    }

    /// Correlated requests still awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait until the state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShuttingDown`] if the event loop stops first.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(ConnectionState) -> bool,
    ) -> Result<ConnectionState, GatewayError> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| predicate(*s))
            .await
            .map_err(|_| GatewayError::ShuttingDown)?;
        Ok(*state)
    }

    async fn command(&self, command: Command) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::ShuttingDown)
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected(state))
        }
    }
}

#[async_trait]
impl BrokerSession for ConnectionHandle {
    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    async fn send(&self, request: BrokerRequest) -> Result<(), GatewayError> {
        self.ensure_ready()?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { request, reply }).await?;
        rx.await.map_err(|_| GatewayError::SessionLost)?
    }

    async fn request(
        &self,
        request: BrokerRequest,
        timeout: Duration,
    ) -> Result<BrokerResponse, GatewayError> {
        self.ensure_ready()?;
        let kind = request.kind();
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request { request, reply }).await?;
        await_reply(rx, timeout, kind).await
    }

    async fn snapshot(
        &self,
        account_id: &AccountId,
        order_cursor: Option<EventId>,
        timeout: Duration,
    ) -> Result<SnapshotOutcome, GatewayError> {
        self.ensure_ready()?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot {
            account_id: account_id.clone(),
            order_cursor,
            reply,
        })
        .await?;
        await_reply(rx, timeout, "snapshot").await
    }
}

/// The connection event loop.
pub struct ConnectionManager {
    transport: Box<dyn BrokerTransport>,
    settings: ConnectionSettings,
    commands: mpsc::Receiver<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    last_error: Arc<Mutex<Option<GatewayError>>>,
    health: Arc<HealthMonitor>,
    pipeline: PipelineSender,
    backoff: BackoffPolicy,
    pending: HashMap<RequestId, Pending>,
    in_flight: Arc<AtomicUsize>,
    next_request_id: RequestId,
    fatal: Option<GatewayError>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create the event loop and its handle. Nothing happens until
    /// [`run`](Self::run) is spawned and [`ConnectionHandle::start`] called.
    #[must_use]
    pub fn new(
        transport: Box<dyn BrokerTransport>,
        settings: ConnectionSettings,
        pipeline: PipelineSender,
        health: Arc<HealthMonitor>,
        cancel: CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        let last_error = Arc::new(Mutex::new(None));
        let in_flight = Arc::new(AtomicUsize::new(0));

        health.set_connection_state(ConnectionState::Disconnected, None);
        metrics::gauge!("gateway_connection_state")
            .set(f64::from(ConnectionState::Disconnected.code()));

        let handle = ConnectionHandle {
            commands: command_tx,
            state_rx,
            transitions: transitions.clone(),
            last_error: Arc::clone(&last_error),
            in_flight: Arc::clone(&in_flight),
        };
        let manager = Self {
            transport,
            backoff: BackoffPolicy::new(settings.backoff),
            settings,
            commands,
            state: ConnectionState::Disconnected,
            state_tx,
            transitions,
            last_error,
            health,
            pipeline,
            pending: HashMap::new(),
            in_flight,
            next_request_id: 1,
            fatal: None,
            cancel,
        };
        (manager, handle)
    }

    /// Drive the state machine until shutdown.
    pub async fn run(mut self) {
        tracing::info!("Connection manager started");
        loop {
            let flow = match self.state {
                ConnectionState::Disconnected | ConnectionState::FailedPermanently => {
                    self.idle().await
                }
                ConnectionState::Connecting => self.connect().await,
                ConnectionState::Authenticating => self.authenticate().await,
                ConnectionState::Ready => self.serve().await,
                ConnectionState::Reconnecting => self.wait_backoff().await,
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        tracing::info!("Connection manager stopped");
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    async fn idle(&mut self) -> Flow {
        let command = tokio::select! {
            () = self.cancel.cancelled() => None,
            command = self.commands.recv() => command,
        };

        match command {
            Some(Command::Start) if self.state == ConnectionState::Disconnected => {
                self.transition(ConnectionState::Connecting, TransitionReason::Requested);
                Flow::Continue
            }
            Some(Command::Start | Command::Reconnect) => {
                tracing::warn!(state = %self.state, "Connect request ignored");
                Flow::Continue
            }
            other => match refuse(other, self.state) {
                Interrupt::Shutdown(done) => self.stop(done).await,
                Interrupt::None | Interrupt::Reconnect => Flow::Continue,
            },
        }
    }

    async fn connect(&mut self) -> Flow {
        let timeout = self.settings.connect_timeout;
        let state = self.state;
        let outcome = {
            let connect = tokio::time::timeout(timeout, self.transport.connect());
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break Err(Interrupt::Shutdown(None)),
                    command = self.commands.recv() => match refuse(command, state) {
                        Interrupt::None | Interrupt::Reconnect => {}
                        shutdown @ Interrupt::Shutdown(_) => break Err(shutdown),
                    },
                    result = &mut connect => break Ok(result),
                }
            }
        };

        match outcome {
            Err(Interrupt::Shutdown(done)) => self.stop(done).await,
            Err(_) => Flow::Continue,
            Ok(Ok(Ok(()))) => {
                self.transition(
                    ConnectionState::Authenticating,
                    TransitionReason::TransportEstablished,
                );
                Flow::Continue
            }
            Ok(Ok(Err(err))) => {
                self.fail(err).await;
                Flow::Continue
            }
            Ok(Err(_)) => {
                self.fail(TransportError::ConnectFailed(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )))
                .await;
                Flow::Continue
            }
        }
    }

    async fn authenticate(&mut self) -> Flow {
        let timeout = self.settings.auth_timeout;
        let state = self.state;
        let credentials = self.settings.credentials.clone();
        let outcome = {
            let login = tokio::time::timeout(timeout, self.transport.authenticate(&credentials));
            tokio::pin!(login);
            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break Err(Interrupt::Shutdown(None)),
                    command = self.commands.recv() => match refuse(command, state) {
                        Interrupt::None | Interrupt::Reconnect => {}
                        shutdown @ Interrupt::Shutdown(_) => break Err(shutdown),
                    },
                    result = &mut login => break Ok(result),
                }
            }
        };

        match outcome {
            Err(Interrupt::Shutdown(done)) => self.stop(done).await,
            Err(_) => Flow::Continue,
            Ok(Ok(Ok(info))) => {
                let account = credentials.account_id();
                if !info.accounts.is_empty() && !info.accounts.contains(account) {
                    self.fail(TransportError::AuthenticationRejected(format!(
                        "account {account} is not available to this login"
                    )))
                    .await;
                    return Flow::Continue;
                }

                tracing::info!(
                    accounts = info.accounts.len(),
                    server_time = %info.server_time,
                    "Broker session authenticated"
                );
                self.backoff.reset();
                *self.last_error.lock() = None;
                self.transition(ConnectionState::Ready, TransitionReason::Authenticated);
                Flow::Continue
            }
            Ok(Ok(Err(err))) => {
                self.fail(err).await;
                Flow::Continue
            }
            Ok(Err(_)) => {
                self.fail(TransportError::Protocol(format!(
                    "authentication timed out after {}ms",
                    timeout.as_millis()
                )))
                .await;
                Flow::Continue
            }
        }
    }

    async fn serve(&mut self) -> Flow {
        let session_cancel = self.cancel.child_token();
        let heartbeat = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(8);
        tokio::spawn(
            HeartbeatMonitor::new(
                self.settings.heartbeat,
                Arc::clone(&heartbeat),
                heartbeat_tx,
                session_cancel.clone(),
            )
            .run(),
        );

        let flow = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break self.stop(None).await,

                command = self.commands.recv() => {
                    if let Some(flow) = self.on_command(command).await {
                        break flow;
                    }
                }

                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        self.sweep_abandoned();
                        let envelope = OutboundEnvelope {
                            request_id: None,
                            request: BrokerRequest::Heartbeat,
                        };
                        if let Err(err) = self.transport.send(envelope).await {
                            self.fail(err).await;
                            break Flow::Continue;
                        }
                    }
                    Some(HeartbeatEvent::Timeout) => {
                        *self.last_error.lock() =
                            Some(GatewayError::Timeout("heartbeat acknowledgment".to_string()));
                        self.drop_session(TransitionReason::HeartbeatTimeout).await;
                        break Flow::Continue;
                    }
                    None => {}
                },

                message = self.transport.recv() => match message {
                    Ok(message) => {
                        if let Some(flow) = self.on_inbound(message, &heartbeat).await {
                            break flow;
                        }
                    }
                    Err(err) => {
                        self.fail(err).await;
                        break Flow::Continue;
                    }
                },
            }
        };

        session_cancel.cancel();
        flow
    }

    async fn wait_backoff(&mut self) -> Flow {
        if let Some(err) = self.fatal.take() {
            let reason = err.to_string();
            *self.last_error.lock() = Some(err);
            self.transition(
                ConnectionState::FailedPermanently,
                TransitionReason::AuthenticationFatal(reason),
            );
            return Flow::Continue;
        }

        let Some(delay) = self.backoff.next_delay() else {
            let attempts = self.backoff.attempt_count();
            tracing::error!(attempts, "Reconnect attempts exhausted");
            self.transition(
                ConnectionState::FailedPermanently,
                TransitionReason::MaxAttemptsExceeded(attempts),
            );
            return Flow::Continue;
        };

        let attempt = self.backoff.attempt_count();
        metrics::counter!("gateway_reconnect_attempts_total").increment(1);
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting to broker after backoff"
        );

        let state = self.state;
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let interrupt = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Interrupt::Shutdown(None),
                command = self.commands.recv() => match refuse(command, state) {
                    Interrupt::None => {}
                    other => break other,
                },
                () = &mut sleep => break Interrupt::None,
            }
        };

        match interrupt {
            Interrupt::Shutdown(done) => self.stop(done).await,
            Interrupt::Reconnect => {
                self.transition(ConnectionState::Connecting, TransitionReason::Requested);
                Flow::Continue
            }
            Interrupt::None => {
                self.transition(ConnectionState::Connecting, TransitionReason::BackoffElapsed);
                Flow::Continue
            }
        }
    }

    // ------------------------------------------------------------------------
    // Ready-state handlers
    // ------------------------------------------------------------------------

    async fn on_command(&mut self, command: Option<Command>) -> Option<Flow> {
        match command {
            None => Some(self.stop(None).await),
            Some(Command::Shutdown { done }) => Some(self.stop(Some(done)).await),
            Some(Command::Start) => None,
            Some(Command::Reconnect) => {
                tracing::info!("Reconnect requested");
                self.drop_session(TransitionReason::Requested).await;
                Some(Flow::Continue)
            }
            Some(Command::Send { request, reply }) => {
                let envelope = OutboundEnvelope {
                    request_id: None,
                    request,
                };
                match self.transport.send(envelope).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        None
                    }
                    Err(err) => {
                        let _ = reply.send(Err(GatewayError::Transport(err.to_string())));
                        self.fail(err).await;
                        Some(Flow::Continue)
                    }
                }
            }
            Some(Command::Request { request, reply }) => {
                self.send_correlated(request, Pending::Caller(reply)).await
            }
            Some(Command::Snapshot {
                account_id,
                order_cursor,
                reply,
            }) => {
                let request = BrokerRequest::Snapshot {
                    account_id: account_id.clone(),
                    order_cursor,
                };
                self.send_correlated(request, Pending::Snapshot { account_id, reply })
                    .await
            }
        }
    }

    async fn send_correlated(&mut self, request: BrokerRequest, pending: Pending) -> Option<Flow> {
        self.sweep_abandoned();
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let envelope = OutboundEnvelope {
            request_id: Some(request_id),
            request,
        };
        match self.transport.send(envelope).await {
            Ok(()) => {
                self.pending.insert(request_id, pending);
                self.record_in_flight();
                None
            }
            Err(err) => {
                pending.fail(GatewayError::Transport(err.to_string()));
                self.fail(err).await;
                Some(Flow::Continue)
            }
        }
    }

    fn on_response(&mut self, request_id: RequestId, result: Result<BrokerResponse, String>) {
        let Some(pending) = self.pending.remove(&request_id) else {
            tracing::debug!(request_id, "Late or unknown response discarded");
            return;
        };
        self.record_in_flight();

        match (pending, result) {
            (Pending::Caller(reply), result) => {
                let _ = reply.send(result.map_err(GatewayError::ProtocolRejection));
            }
            (Pending::Snapshot { account_id, reply }, Ok(BrokerResponse::Snapshot(snapshot))) => {
                self.pipeline.stage_snapshot(&account_id, snapshot, reply);
            }
            (Pending::Snapshot { reply, .. }, Ok(other)) => {
                let _ = reply.send(Err(GatewayError::UnexpectedResponse(format!(
                    "expected a snapshot, got {other:?}"
                ))));
            }
            (Pending::Snapshot { reply, .. }, Err(message)) => {
                let _ = reply.send(Err(GatewayError::ProtocolRejection(message)));
            }
        }
    }

    /// Forget requests whose callers stopped waiting.
    fn sweep_abandoned(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, pending| !pending.is_abandoned());
        let swept = before - self.pending.len();
        if swept > 0 {
            tracing::debug!(swept, "Dropped requests nobody is waiting for");
            self.record_in_flight();
        }
    }

    fn record_in_flight(&self) {
        let count = self.pending.len();
        self.in_flight.store(count, Ordering::Relaxed);
        metrics::gauge!("gateway_requests_in_flight")
            .set(f64::from(u32::try_from(count).unwrap_or(u32::MAX)));
    }

    async fn on_inbound(
        &mut self,
        message: InboundMessage,
        heartbeat: &HeartbeatState,
    ) -> Option<Flow> {
        match message {
            InboundMessage::Event(event) => {
                if self.pipeline.publish(event).is_err() {
                    tracing::warn!("Event pipeline closed, inbound event discarded");
                }
                None
            }
            InboundMessage::HeartbeatAck => {
                heartbeat.record_ack();
                None
            }
            InboundMessage::Response { request_id, result } => {
                self.on_response(request_id, result);
                None
            }
            InboundMessage::SessionRejected {
                reason,
                concurrent_session,
            } => {
                tracing::error!(reason = %reason, concurrent_session, "Broker rejected session");
                let error = if concurrent_session {
                    GatewayError::ConcurrentSession
                } else {
                    GatewayError::ProtocolRejection(reason.clone())
                };
                if concurrent_session {
                    self.fatal = Some(error.clone());
                }
                *self.last_error.lock() = Some(error);
                self.drop_session(TransitionReason::ProtocolRejection(reason))
                    .await;
                Some(Flow::Continue)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Route a transport failure to `Reconnecting`, or straight to
    /// `FailedPermanently` when it is fatal and the current state allows it.
    async fn fail(&mut self, err: TransportError) {
        let error = match &err {
            TransportError::ConcurrentSession(_) => GatewayError::ConcurrentSession,
            TransportError::AuthenticationRejected(m) => GatewayError::AuthenticationRejected(m.clone()),
            TransportError::Protocol(m) => GatewayError::ProtocolRejection(m.clone()),
            other => GatewayError::Transport(other.to_string()),
        };
        tracing::warn!(
            state = %self.state,
            error = %err,
            reason = err.kind().reason(),
            "Broker session failure"
        );
        *self.last_error.lock() = Some(error.clone());

        if err.is_fatal() && self.state.can_transition_to(ConnectionState::FailedPermanently) {
            self.transport.close().await;
            self.fail_pending();
            self.transition(
                ConnectionState::FailedPermanently,
                TransitionReason::AuthenticationFatal(err.to_string()),
            );
            return;
        }
        if err.is_fatal() {
            self.fatal = Some(error);
        }

        let reason = match err {
            TransportError::Protocol(m) => TransitionReason::ProtocolRejection(m),
            other => TransitionReason::TransportError(other.to_string()),
        };
        self.drop_session(reason).await;
    }

    async fn drop_session(&mut self, reason: TransitionReason) {
        self.transport.close().await;
        self.fail_pending();
        self.transition(ConnectionState::Reconnecting, reason);
    }

    async fn stop(&mut self, done: Option<oneshot::Sender<()>>) -> Flow {
        tracing::info!(state = %self.state, "Connection shutting down");
        if self.state != ConnectionState::Disconnected {
            self.transport.close().await;
            self.fail_pending();
            self.transition(ConnectionState::Disconnected, TransitionReason::Shutdown);
        }
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            if let Interrupt::Shutdown(Some(done)) = refuse(Some(command), self.state) {
                let _ = done.send(());
            }
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
        Flow::Stop
    }

    fn fail_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::debug!(pending = self.pending.len(), "Failing in-flight requests");
        for (_, pending) in self.pending.drain() {
            pending.fail(GatewayError::SessionLost);
        }
        self.record_in_flight();
    }

    fn transition(&mut self, to: ConnectionState, reason: TransitionReason) {
        let from = self.state;
        if !from.can_transition_to(to) {
            tracing::error!(from = %from, to = %to, reason = %reason, "Illegal transition ignored");
            return;
        }

        let transition = StateTransition {
            from,
            to,
            attempt: self.backoff.attempt_count(),
            reason,
            at: Utc::now(),
        };
        self.state = to;
        self.state_tx.send_replace(to);
        let health_reason = match &transition.reason {
            TransitionReason::Requested | TransitionReason::Authenticated => None,
            other => Some(format!("{to}: {other}")),
        };
        self.health.set_connection_state(to, health_reason);

        metrics::gauge!("gateway_connection_state").set(f64::from(to.code()));
        metrics::counter!("gateway_state_transitions_total", "to" => to.as_str()).increment(1);
        tracing::info!(
            from = %from,
            to = %to,
            attempt = transition.attempt,
            reason = %transition.reason,
            "Connection state changed"
        );

        let _ = self.transitions.send(transition);
    }
}
