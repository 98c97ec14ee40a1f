//! Realtime session: one long-lived, authenticated channel to the
//! collaboration service, with automatic reconnection.
//!
//! State machine:
//! ```text
//!              connect()
//! Disconnected ────────► Connecting ──success──► Connected
//!      ▲                     │                       │
//!      │   backoff expired   │ failure               │ transport drop
//!      │  (delay = base·2^n) ▼                       ▼
//!      └───────────── reconnect scheduled ◄──────────┘
//!
//! attempt == max ──► ReconnectExhausted (stops; connect() resets)
//! deliberate server close / 401 ──► terminal until connect()
//! disconnect() ──► Disconnected, any scheduled reconnect suppressed
//! ```
//!
//! The session owns its transport exclusively; the rest of the system
//! sees only the [`EventRouter`] listener API, the status watch and the
//! signal channel. Room membership is intent, independent of transport
//! state: joins requested while disconnected are replayed on every
//! successful connection, before the state is reported as connected, so
//! room-scoped events are never missed to a connect/join race.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use uuid::Uuid;

use crate::protocol::{ClientFrame, PresenceStatus, ServerFrame};
use crate::router::EventRouter;

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Published snapshot of the session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Resets to zero only on a successful `Connected` transition.
    pub reconnect_attempt: u32,
}

/// Out-of-band notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    StateChanged(ConnectionState),
    /// The reconnect budget is spent; no further automatic attempts
    /// until `connect()` is called again.
    ReconnectExhausted,
    /// A 401-equivalent was seen; no automatic retry until the
    /// credential is refreshed and `connect()` is called.
    AuthExpired,
    /// The server closed the channel and asked us not to come back.
    TerminatedByServer,
}

/// Result of a typed send. Collaboration signals are transient: when
/// the session is not connected they are dropped with this explicit
/// outcome, never queued silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotConnected,
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Transport handshake failed.
    Handshake(String),
    /// 401-equivalent from the service or the token provider.
    AuthExpired,
    /// Handshake did not resolve within the configured timeout.
    Timeout,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake(e) => write!(f, "Handshake failed: {e}"),
            Self::AuthExpired => write!(f, "Credential expired"),
            Self::Timeout => write!(f, "Connect timed out"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Inbound item from an established link.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(ServerFrame),
    /// The transport closed. `reconnect: false` means the server
    /// deliberately asked the client not to reconnect.
    Closed { reconnect: bool },
}

/// An established bidirectional link.
pub struct Link {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Opens links to the collaboration service. The production
/// implementation is [`crate::ws::WsConnector`]; tests substitute
/// in-memory channels.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, bearer_token: &str) -> Result<Link, SessionError>;
}

/// Supplies the bearer credential, refreshed out of band.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, SessionError>;
}

/// A fixed token, for tests and short-lived tools.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, SessionError> {
        Ok(self.0.clone())
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First reconnect delay; doubles per attempt. Default: 1s.
    pub base_delay: Duration,
    /// Reconnect attempts before `ReconnectExhausted`. Default: 5.
    pub max_reconnect_attempts: u32,
    /// Handshake timeout. Default: 10s.
    pub connect_timeout: Duration,
    /// Signal channel capacity.
    pub signal_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            signal_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Config for testing (short handshake timeout).
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            signal_capacity: 16,
            ..Self::default()
        }
    }
}

/// Backoff doubling stops here; the delay stays at
/// `base_delay * 2^16` for any later attempts.
const MAX_BACKOFF_EXPONENT: u32 = 16;

enum Command {
    Connect,
    Disconnect,
    ReconnectNow,
    Join(String),
    Leave(String),
    Send {
        frame: ClientFrame,
        reply: oneshot::Sender<SendOutcome>,
    },
}

/// Handle to the session actor. Cheap to clone; the actor stops when
/// every handle is dropped.
#[derive(Clone)]
pub struct RealtimeSession {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    signal_tx: broadcast::Sender<SessionSignal>,
    rooms: Arc<RwLock<HashSet<String>>>,
}

impl RealtimeSession {
    /// Spawn the session actor. It starts `Disconnected` and does
    /// nothing until [`connect`](Self::connect).
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        router: Arc<EventRouter>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
        });
        let (signal_tx, _) = broadcast::channel(config.signal_capacity);
        let rooms = Arc::new(RwLock::new(HashSet::new()));

        let actor = SessionActor {
            config,
            connector,
            tokens,
            router,
            cmd_rx,
            status_tx,
            signal_tx: signal_tx.clone(),
            rooms: rooms.clone(),
            attempt: 0,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            status_rx,
            signal_tx,
            rooms,
        }
    }

    /// Begin connecting. Resets the reconnect attempt counter.
    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect).await;
    }

    /// Transition to `Disconnected` and suppress any scheduled
    /// reconnect.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    /// Skip the current backoff wait, if one is in progress. A no-op
    /// while deliberately disconnected or exhausted — user intent and
    /// the spent budget both require an explicit `connect()`.
    pub async fn reconnect_now(&self) {
        let _ = self.cmd_tx.send(Command::ReconnectNow).await;
    }

    /// Record the intent to be in `room` and, if connected, join it
    /// immediately. Honored on the next connection otherwise.
    pub async fn join_room(&self, room: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Join(room.into())).await;
    }

    /// Drop the intent to be in `room` and, if connected, leave it
    /// immediately.
    pub async fn leave_room(&self, room: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Leave(room.into())).await;
    }

    /// Rooms the session intends to be joined to.
    pub async fn rooms(&self) -> Vec<String> {
        self.rooms.read().await.iter().cloned().collect()
    }

    /// Current lifecycle snapshot.
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Subscribe to out-of-band signals.
    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signal_tx.subscribe()
    }

    /// Send a typing indicator. Fire-and-forget: no delivery
    /// confirmation beyond the transport accepting the frame.
    pub async fn send_typing(
        &self,
        room: impl Into<String>,
        context: impl Into<String>,
        active: bool,
    ) -> SendOutcome {
        self.send_frame(ClientFrame::Typing {
            room: room.into(),
            context: context.into(),
            active,
        })
        .await
    }

    /// Send a presence update.
    pub async fn send_presence(
        &self,
        room: impl Into<String>,
        status: PresenceStatus,
    ) -> SendOutcome {
        self.send_frame(ClientFrame::Presence {
            room: room.into(),
            status,
        })
        .await
    }

    /// Send a comment.
    pub async fn send_comment(
        &self,
        room: impl Into<String>,
        entity_id: Uuid,
        body: impl Into<String>,
    ) -> SendOutcome {
        self.send_frame(ClientFrame::Comment {
            room: room.into(),
            entity_id,
            body: body.into(),
        })
        .await
    }

    /// Announce a shared file.
    pub async fn send_file_share(
        &self,
        room: impl Into<String>,
        name: impl Into<String>,
        size_bytes: u64,
        file_ref: impl Into<String>,
    ) -> SendOutcome {
        self.send_frame(ClientFrame::FileShare {
            room: room.into(),
            name: name.into(),
            size_bytes,
            file_ref: file_ref.into(),
        })
        .await
    }

    async fn send_frame(&self, frame: ClientFrame) -> SendOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Send { frame, reply })
            .await
            .is_err()
        {
            return SendOutcome::NotConnected;
        }
        rx.await.unwrap_or(SendOutcome::NotConnected)
    }
}

/// Why the connected loop ended.
enum ConnectedExit {
    /// Transport dropped; schedule a reconnect.
    Dropped,
    /// Caller asked to disconnect; stop.
    Deliberate,
    /// Server asked us not to reconnect; stop.
    Terminal,
    /// All handles gone; shut the actor down.
    HandleGone,
}

struct SessionActor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    router: Arc<EventRouter>,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<SessionStatus>,
    signal_tx: broadcast::Sender<SessionSignal>,
    rooms: Arc<RwLock<HashSet<String>>>,
    attempt: u32,
}

impl SessionActor {
    async fn run(mut self) {
        // Idle: disconnected, no reconnect scheduled. Only an explicit
        // Connect starts (or restarts) the lifecycle.
        loop {
            match self.cmd_rx.recv().await {
                None => return,
                Some(Command::Connect) => {
                    self.attempt = 0;
                    if self.connect_loop().await.is_break() {
                        return;
                    }
                }
                Some(Command::Disconnect) | Some(Command::ReconnectNow) => {}
                Some(Command::Join(room)) => {
                    self.rooms.write().await.insert(room);
                }
                Some(Command::Leave(room)) => {
                    self.rooms.write().await.remove(&room);
                }
                Some(Command::Send { reply, .. }) => {
                    let _ = reply.send(SendOutcome::NotConnected);
                }
            }
        }
    }

    /// Drive the Connecting/Connected/backoff cycle until a deliberate
    /// disconnect, exhaustion, a terminal close, or handle drop
    /// (`Break`).
    async fn connect_loop(&mut self) -> ControlFlow<()> {
        loop {
            self.set_state(ConnectionState::Connecting);

            let token = match self.tokens.bearer_token().await {
                Ok(token) => token,
                Err(e) => {
                    log::warn!("token provider failed: {e}");
                    self.signal(SessionSignal::AuthExpired);
                    self.set_state(ConnectionState::Disconnected);
                    return ControlFlow::Continue(());
                }
            };

            let attempt_result =
                tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&token))
                    .await;

            match attempt_result {
                Ok(Ok(mut link)) => {
                    if self.replay_rooms(&mut link).await {
                        self.attempt = 0;
                        self.set_state(ConnectionState::Connected);
                        match self.connected(&mut link).await {
                            ConnectedExit::Dropped => {
                                log::warn!("transport dropped, scheduling reconnect");
                            }
                            ConnectedExit::Deliberate => {
                                log::info!("session disconnected by caller");
                                self.set_state(ConnectionState::Disconnected);
                                return ControlFlow::Continue(());
                            }
                            ConnectedExit::Terminal => {
                                log::warn!("server closed the session and declined reconnects");
                                self.signal(SessionSignal::TerminatedByServer);
                                self.set_state(ConnectionState::Disconnected);
                                return ControlFlow::Continue(());
                            }
                            ConnectedExit::HandleGone => return ControlFlow::Break(()),
                        }
                    } else {
                        log::warn!("link dropped during room replay, scheduling reconnect");
                    }
                }
                Ok(Err(SessionError::AuthExpired)) => {
                    log::warn!("authentication rejected by collaboration service");
                    self.signal(SessionSignal::AuthExpired);
                    self.set_state(ConnectionState::Disconnected);
                    return ControlFlow::Continue(());
                }
                Ok(Err(e)) => {
                    log::warn!("connect failed: {e}");
                }
                Err(_) => {
                    log::warn!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    );
                }
            }

            // Failure path: schedule a reconnect, or give up.
            self.set_state(ConnectionState::Disconnected);
            if self.attempt >= self.config.max_reconnect_attempts {
                log::warn!(
                    "reconnect budget spent after {} attempts",
                    self.attempt
                );
                self.signal(SessionSignal::ReconnectExhausted);
                return ControlFlow::Continue(());
            }

            // Cap the exponent: past it the shift (and the Duration
            // multiply) would overflow for large attempt budgets.
            let exponent = self.attempt.min(MAX_BACKOFF_EXPONENT);
            let delay = self.config.base_delay.saturating_mul(1u32 << exponent);
            self.attempt += 1;
            log::info!(
                "reconnect attempt {} of {} in {:?}",
                self.attempt,
                self.config.max_reconnect_attempts,
                delay
            );

            match self.backoff_wait(delay).await {
                ControlFlow::Continue(true) => {}  // retry now
                ControlFlow::Continue(false) => return ControlFlow::Continue(()),
                ControlFlow::Break(()) => return ControlFlow::Break(()),
            }
        }
    }

    /// Wait out the backoff delay while still servicing commands.
    /// `Continue(true)` means retry, `Continue(false)` means a
    /// deliberate disconnect cancelled the reconnect.
    async fn backoff_wait(&mut self, delay: Duration) -> ControlFlow<(), bool> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return ControlFlow::Continue(true),
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return ControlFlow::Break(()),
                    Some(Command::Disconnect) => {
                        log::info!("reconnect cancelled by caller");
                        return ControlFlow::Continue(false);
                    }
                    Some(Command::ReconnectNow) => {
                        log::info!("backoff wait bypassed");
                        return ControlFlow::Continue(true);
                    }
                    Some(Command::Connect) => {
                        self.attempt = 0;
                        return ControlFlow::Continue(true);
                    }
                    Some(Command::Join(room)) => {
                        self.rooms.write().await.insert(room);
                    }
                    Some(Command::Leave(room)) => {
                        self.rooms.write().await.remove(&room);
                    }
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(SendOutcome::NotConnected);
                    }
                }
            }
        }
    }

    /// Rejoin every intended room before any other traffic. Returns
    /// false if the link died mid-replay.
    async fn replay_rooms(&self, link: &mut Link) -> bool {
        let rooms: Vec<String> = {
            let set = self.rooms.read().await;
            let mut rooms: Vec<String> = set.iter().cloned().collect();
            rooms.sort(); // deterministic replay order
            rooms
        };
        for room in rooms {
            log::debug!("replaying join for room {room}");
            if link
                .outbound
                .send(ClientFrame::JoinRoom { room })
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// Serve the established link until it drops or the caller
    /// intervenes.
    async fn connected(&mut self, link: &mut Link) -> ConnectedExit {
        loop {
            tokio::select! {
                inbound = link.inbound.recv() => match inbound {
                    Some(LinkEvent::Frame(frame)) => self.router.dispatch(&frame),
                    Some(LinkEvent::Closed { reconnect: true }) | None => {
                        return ConnectedExit::Dropped;
                    }
                    Some(LinkEvent::Closed { reconnect: false }) => {
                        return ConnectedExit::Terminal;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return ConnectedExit::HandleGone,
                    Some(Command::Disconnect) => return ConnectedExit::Deliberate,
                    // Already connected
                    Some(Command::Connect) | Some(Command::ReconnectNow) => {}
                    Some(Command::Join(room)) => {
                        self.rooms.write().await.insert(room.clone());
                        if link
                            .outbound
                            .send(ClientFrame::JoinRoom { room })
                            .await
                            .is_err()
                        {
                            return ConnectedExit::Dropped;
                        }
                    }
                    Some(Command::Leave(room)) => {
                        self.rooms.write().await.remove(&room);
                        if link
                            .outbound
                            .send(ClientFrame::LeaveRoom { room })
                            .await
                            .is_err()
                        {
                            return ConnectedExit::Dropped;
                        }
                    }
                    Some(Command::Send { frame, reply }) => {
                        let outcome = if link.outbound.send(frame).await.is_ok() {
                            SendOutcome::Sent
                        } else {
                            SendOutcome::NotConnected
                        };
                        let _ = reply.send(outcome);
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = *self.status_tx.borrow();
        let next = SessionStatus {
            state,
            reconnect_attempt: self.attempt,
        };
        if previous != next {
            let _ = self.status_tx.send(next);
        }
        if previous.state != state {
            let _ = self.signal_tx.send(SessionSignal::StateChanged(state));
        }
    }

    fn signal(&self, signal: SessionSignal) {
        let _ = self.signal_tx.send(signal);
    }
}
