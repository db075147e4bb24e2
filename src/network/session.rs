//! Session Connector
//!
//! Owns joining or hosting a session, reports connection status, turns
//! substrate events into spawn/despawn signals, and tears everything down
//! when the session ends. Lives for the whole process; level swaps never
//! touch it.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::game::state::PeerId;
use crate::game::world::{Authority, World};
use crate::network::protocol::{ConnectFailedReason, GameMode, ShutdownReason};
use crate::network::transport::{StartArgs, Transport, TransportError, TransportEvent, DEFAULT_MAX_PLAYERS};

/// Reason reported when a member leaves.
pub const PLAYER_LEFT: &str = "Player Left";

/// Reason reported when a connect attempt runs out of time.
pub const CONNECT_TIMED_OUT: &str = "Connection attempt timed out";

// =============================================================================
// TYPES
// =============================================================================

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No session
    #[default]
    Disconnected,
    /// Attempt in progress
    Connecting,
    /// Attempt failed
    Failed,
    /// In a session
    Connected,
}

/// Status change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// New status
    pub status: ConnectionStatus,
    /// Short human-readable reason, possibly empty
    pub reason: String,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Give up connecting after this long
    pub connect_timeout: Duration,
    /// Capacity when creating a session
    pub max_players: usize,
    /// Buffered status notifications per subscriber
    pub status_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_players: DEFAULT_MAX_PLAYERS,
            status_capacity: 64,
        }
    }
}

/// The session this peer is in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session id
    pub session_id: Uuid,
    /// Session name
    pub name: String,
    /// How this peer joined
    pub mode: GameMode,
    /// This peer's id
    pub local_peer: PeerId,
    /// This peer hosts the session
    pub is_server: bool,
    /// This peer is the shared-mode master
    pub is_master: bool,
}

impl SessionHandle {
    /// Whether this peer should hold the match authority.
    pub fn is_authoritative(&self) -> bool {
        self.is_server || self.is_master
    }
}

/// What the peer runtime should do after a substrate event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Spawn the match authority entity
    SpawnAuthority,
    /// Spawn a player for this peer
    SpawnPlayer(PeerId),
    /// Despawn that peer's player
    DespawnPlayer(PeerId),
    /// Someone joined; re-send what they need to catch up
    PeerJoined(PeerId),
    /// The shared-mode master moved
    AuthorityMigrated(PeerId),
    /// A frame arrived
    Frame {
        /// Sender
        from: PeerId,
        /// Encoded envelope
        bytes: Vec<u8>,
    },
    /// The session is over and has been torn down
    Ended(ShutdownReason),
}

/// Session errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The substrate refused the attempt
    #[error("connect failed: {0}")]
    ConnectFailed(ConnectFailedReason),

    /// The attempt took longer than the configured timeout
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Already in a session
    #[error("already connected")]
    AlreadyConnected,

    /// Not in a session
    #[error("not connected")]
    NotConnected,

    /// Other substrate failure
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectFailed(reason) => SessionError::ConnectFailed(reason),
            TransportError::NotConnected => SessionError::NotConnected,
            other => SessionError::Transport(other),
        }
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Session lifecycle over some [`Transport`].
#[derive(Debug)]
pub struct SessionConnector<T: Transport> {
    transport: T,
    config: SessionConfig,
    status: ConnectionStatus,
    status_tx: broadcast::Sender<StatusUpdate>,
    session: Option<SessionHandle>,
    authority_requested: bool,
}

impl<T: Transport> SessionConnector<T> {
    /// Create a connector.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_capacity.max(1));
        Self {
            transport,
            config,
            status: ConnectionStatus::Disconnected,
            status_tx,
            session: None,
            authority_requested: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    /// The current session, if any.
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Join or host a session.
    #[instrument(skip(self))]
    pub async fn connect(&mut self, mode: GameMode, session_name: &str) -> Result<SessionHandle, SessionError> {
        if self.session.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        self.set_status(ConnectionStatus::Connecting, "");

        let args = StartArgs {
            mode,
            session_name: session_name.to_string(),
            max_players: self.config.max_players,
        };
        let timeout = self.config.connect_timeout;
        let started = tokio::time::timeout(timeout, self.transport.start(args)).await;

        let info = match started {
            Err(_) => {
                warn!(?timeout, "Connect timed out");
                self.transport.shutdown(ShutdownReason::Error);
                self.set_status(ConnectionStatus::Failed, CONNECT_TIMED_OUT);
                return Err(SessionError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                let error = SessionError::from(e);
                warn!(%error, "Connect failed");
                let reason = match &error {
                    SessionError::ConnectFailed(reason) => reason.to_string(),
                    other => other.to_string(),
                };
                self.set_status(ConnectionStatus::Failed, &reason);
                return Err(error);
            }
            Ok(Ok(info)) => info,
        };

        let handle = SessionHandle {
            session_id: info.session_id,
            name: session_name.to_string(),
            mode,
            local_peer: info.local_peer,
            is_server: info.is_server,
            is_master: info.is_master,
        };
        info!(
            session = %handle.session_id,
            peer = %handle.local_peer,
            authoritative = handle.is_authoritative(),
            "Connected"
        );
        self.session = Some(handle.clone());
        self.authority_requested = false;
        self.set_status(ConnectionStatus::Connected, "");
        Ok(handle)
    }

    /// Take every pending substrate event.
    pub fn poll(&mut self) -> Vec<TransportEvent> {
        self.transport.poll()
    }

    /// Send an encoded envelope to every member.
    pub fn send(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        if self.session.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.transport.send(frame).map_err(SessionError::from)
    }

    /// Close or reopen the session to new joins.
    pub fn set_session_open(&mut self, open: bool, visible: bool) {
        debug!(open, visible, "Session visibility changed");
        self.transport.set_session_open(open, visible);
    }

    /// Turn one substrate event into signals for the peer runtime.
    pub fn handle_event(&mut self, event: TransportEvent, world: &mut World) -> Vec<SessionSignal> {
        let mut signals = Vec::new();
        let Some(session) = self.session.clone() else {
            debug!(?event, "Event outside a session ignored");
            return signals;
        };

        match event {
            TransportEvent::ConnectedToServer => {
                if self.status != ConnectionStatus::Connected {
                    self.set_status(ConnectionStatus::Connected, "");
                }
                if session.mode == GameMode::Shared {
                    self.instantiate(&session, session.local_peer, &mut signals);
                }
            }
            TransportEvent::PlayerJoined(peer) => match session.mode {
                GameMode::Host => self.instantiate(&session, peer, &mut signals),
                GameMode::Shared if peer != session.local_peer => signals.push(SessionSignal::PeerJoined(peer)),
                _ => {}
            },
            TransportEvent::PlayerLeft(peer) => {
                info!(%peer, "Player left");
                signals.push(SessionSignal::DespawnPlayer(peer));
                self.set_status(self.status, PLAYER_LEFT);
            }
            TransportEvent::MasterChanged(master) => {
                if let Some(current) = self.session.as_mut() {
                    current.is_master = master == current.local_peer;
                    if current.is_master {
                        // The claim moves; no second authority entity
                        self.authority_requested = true;
                    }
                }
                signals.push(SessionSignal::AuthorityMigrated(master));
            }
            TransportEvent::Frame { from, bytes } => signals.push(SessionSignal::Frame { from, bytes }),
            TransportEvent::DisconnectedFromServer => {
                warn!("Host left the session");
                self.shutdown(ShutdownReason::Error, world);
                signals.push(SessionSignal::Ended(ShutdownReason::Error));
            }
            TransportEvent::Shutdown(reason) => {
                self.shutdown(reason, world);
                signals.push(SessionSignal::Ended(reason));
            }
        }
        signals
    }

    /// A peer needs a player. The authority entity is requested first, once.
    fn instantiate(&mut self, session: &SessionHandle, peer: PeerId, signals: &mut Vec<SessionSignal>) {
        if session.is_authoritative() && !self.authority_requested {
            self.authority_requested = true;
            signals.push(SessionSignal::SpawnAuthority);
        }
        signals.push(SessionSignal::SpawnPlayer(peer));
    }

    /// Tear the session down.
    ///
    /// Order: final status, despawn every entity, reset the registry,
    /// clear pools, release the session. A second call does nothing.
    pub fn shutdown(&mut self, reason: ShutdownReason, world: &mut World) {
        let Some(session) = self.session.take() else {
            debug!(%reason, "Shutdown without a session");
            return;
        };
        info!(session = %session.session_id, ?reason, "Session shutdown");

        self.set_status(ConnectionStatus::Disconnected, reason.message());

        let live = world.bridge.live_entities().len();
        world.clear_entities();
        world.bridge.clear_pools();
        world.authority = Authority::default();
        debug!(despawned = live, "World cleared");

        self.transport.shutdown(reason);
        self.authority_requested = false;
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: &str) {
        self.status = status;
        debug!(?status, reason, "Connection status");
        // No subscribers is fine
        let _ = self.status_tx.send(StatusUpdate {
            status,
            reason: reason.to_string(),
        });
    }
}
