//! Transport Substrate
//!
//! [`Transport`] is what the session layer needs from a network: start or
//! join a named session, send a frame to every member (the sender included),
//! poll membership events and frames, and shut down.
//!
//! [`LoopbackHub`] is an in-process implementation. Every endpoint created
//! from the same hub sees the same sessions; delivery is reliable and
//! ordered per sender, which is all the coordination layer assumes.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::state::PeerId;
use crate::network::protocol::{ConnectFailedReason, GameMode, ShutdownReason};

/// Default capacity of a session.
pub const DEFAULT_MAX_PLAYERS: usize = 4;

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Start refused
    #[error("connect failed: {0}")]
    ConnectFailed(ConnectFailedReason),

    /// Operation needs a running session
    #[error("not connected")]
    NotConnected,

    /// Peer already started a session
    #[error("already started")]
    AlreadyStarted,
}

/// Arguments to [`Transport::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartArgs {
    /// Participation mode
    pub mode: GameMode,
    /// Session (room) name
    pub session_name: String,
    /// Capacity when creating the session
    pub max_players: usize,
}

/// What [`Transport::start`] reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartInfo {
    /// Session id
    pub session_id: Uuid,
    /// Id assigned to this peer
    pub local_peer: PeerId,
    /// This peer is the session's host
    pub is_server: bool,
    /// This peer is the shared-mode master
    pub is_master: bool,
}

/// Something the substrate reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Joined a session as a non-host
    ConnectedToServer,
    /// A peer joined (the host sees itself join too)
    PlayerJoined(PeerId),
    /// A peer left
    PlayerLeft(PeerId),
    /// The host went away
    DisconnectedFromServer,
    /// The session ended for this peer
    Shutdown(ShutdownReason),
    /// The shared-mode master changed
    MasterChanged(PeerId),
    /// A frame from some member, possibly this peer
    Frame {
        /// Sender
        from: PeerId,
        /// Encoded envelope
        bytes: Vec<u8>,
    },
}

/// Session substrate.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Start or join a session.
    async fn start(&mut self, args: StartArgs) -> Result<StartInfo, TransportError>;

    /// Send a frame to every member, this peer included.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Take every pending event.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Open or close the session to new joins, and show or hide it.
    fn set_session_open(&mut self, open: bool, visible: bool);

    /// Leave the session and release it. Safe to call when not started.
    fn shutdown(&mut self, reason: ShutdownReason);
}

// =============================================================================
// LOOPBACK
// =============================================================================

#[derive(Debug)]
struct HubSession {
    id: Uuid,
    mode: GameMode,
    host: Option<PeerId>,
    master: Option<PeerId>,
    open: bool,
    visible: bool,
    max_players: usize,
    members: BTreeMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
}

impl HubSession {
    fn notify(&self, peer: PeerId, event: TransportEvent) {
        if let Some(tx) = self.members.get(&peer) {
            // Receiver gone means the peer is already leaving
            let _ = tx.send(event);
        }
    }

    fn notify_all(&self, event: TransportEvent) {
        for tx in self.members.values() {
            let _ = tx.send(event.clone());
        }
    }

    fn notify_others(&self, except: PeerId, event: TransportEvent) {
        for (peer, tx) in &self.members {
            if *peer != except {
                let _ = tx.send(event.clone());
            }
        }
    }
}

#[derive(Debug, Default)]
struct HubInner {
    next_peer: u32,
    sessions: BTreeMap<String, HubSession>,
}

/// In-process session registry shared by loopback endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint bound to this hub.
    pub fn endpoint(&self) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            joined: None,
            rx: None,
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Members of a session, in id order.
    pub fn members(&self, session_name: &str) -> Vec<PeerId> {
        self.inner
            .lock()
            .sessions
            .get(session_name)
            .map(|s| s.members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a session accepts joins and is listed.
    pub fn is_open(&self, session_name: &str) -> Option<(bool, bool)> {
        self.inner.lock().sessions.get(session_name).map(|s| (s.open, s.visible))
    }

    /// End a session from the substrate side; every member gets
    /// [`TransportEvent::Shutdown`].
    pub fn close_session(&self, session_name: &str, reason: ShutdownReason) {
        if let Some(session) = self.inner.lock().sessions.remove(session_name) {
            info!(session = session_name, %reason, "Session closed by substrate");
            session.notify_all(TransportEvent::Shutdown(reason));
        }
    }
}

/// One peer's endpoint on a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    joined: Option<(String, PeerId)>,
    rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl LoopbackTransport {
    /// This endpoint's peer id once started.
    pub fn local_peer(&self) -> Option<PeerId> {
        self.joined.as_ref().map(|(_, peer)| *peer)
    }
}

impl Transport for LoopbackTransport {
    async fn start(&mut self, args: StartArgs) -> Result<StartInfo, TransportError> {
        if self.joined.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let mut hub = self.hub.inner.lock();
        let refuse = |reason| Err(TransportError::ConnectFailed(reason));

        match (hub.sessions.get(&args.session_name), args.mode) {
            (Some(_), GameMode::Host) => return refuse(ConnectFailedReason::Rejected(ShutdownReason::ServerInRoom)),
            (None, GameMode::Client) => return refuse(ConnectFailedReason::NotFound),
            (Some(session), mode) => {
                let compatible = match mode {
                    GameMode::Client => session.mode == GameMode::Host,
                    _ => session.mode == mode,
                };
                if !compatible {
                    return refuse(ConnectFailedReason::Rejected(ShutdownReason::IncompatibleConfiguration));
                }
                if !session.open {
                    return refuse(ConnectFailedReason::Closed);
                }
                if session.members.len() >= session.max_players {
                    return refuse(ConnectFailedReason::Full);
                }
            }
            (None, _) => {}
        }

        hub.next_peer += 1;
        let peer = PeerId(hub.next_peer);
        let (tx, rx) = mpsc::unbounded_channel();

        let session = hub
            .sessions
            .entry(args.session_name.clone())
            .or_insert_with(|| HubSession {
                id: Uuid::new_v4(),
                mode: args.mode,
                host: None,
                master: None,
                open: true,
                visible: true,
                max_players: args.max_players,
                members: BTreeMap::new(),
            });
        session.members.insert(peer, tx);

        match args.mode {
            GameMode::Host => {
                session.host = Some(peer);
                session.notify(peer, TransportEvent::PlayerJoined(peer));
            }
            GameMode::Client => {
                session.notify(peer, TransportEvent::ConnectedToServer);
                if let Some(host) = session.host {
                    session.notify(host, TransportEvent::PlayerJoined(peer));
                }
            }
            GameMode::Shared => {
                if session.master.is_none() {
                    session.master = Some(peer);
                }
                session.notify(peer, TransportEvent::ConnectedToServer);
                session.notify_all(TransportEvent::PlayerJoined(peer));
            }
        }

        let info = StartInfo {
            session_id: session.id,
            local_peer: peer,
            is_server: session.host == Some(peer),
            is_master: session.master == Some(peer),
        };
        debug!(session = %args.session_name, %peer, mode = ?args.mode, "Loopback endpoint started");

        drop(hub);
        self.joined = Some((args.session_name, peer));
        self.rx = Some(rx);
        Ok(info)
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let (name, peer) = self.joined.as_ref().ok_or(TransportError::NotConnected)?;
        let hub = self.hub.inner.lock();
        let session = hub.sessions.get(name).ok_or(TransportError::NotConnected)?;
        session.notify_all(TransportEvent::Frame { from: *peer, bytes: frame });
        Ok(())
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let Some(rx) = self.rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        events
    }

    fn set_session_open(&mut self, open: bool, visible: bool) {
        let Some((name, _)) = self.joined.as_ref() else {
            return;
        };
        if let Some(session) = self.hub.inner.lock().sessions.get_mut(name) {
            session.open = open;
            session.visible = visible;
        }
    }

    fn shutdown(&mut self, reason: ShutdownReason) {
        self.rx = None;
        let Some((name, peer)) = self.joined.take() else {
            return;
        };

        let mut hub = self.hub.inner.lock();
        let Some(session) = hub.sessions.get_mut(&name) else {
            return;
        };
        session.members.remove(&peer);
        debug!(session = %name, %peer, %reason, "Loopback endpoint left");

        if session.host == Some(peer) {
            session.notify_all(TransportEvent::DisconnectedFromServer);
            hub.sessions.remove(&name);
            return;
        }

        match session.mode {
            GameMode::Shared => {
                session.notify_all(TransportEvent::PlayerLeft(peer));
                if session.master == Some(peer) {
                    session.master = session.members.keys().next().copied();
                    if let Some(master) = session.master {
                        session.notify_all(TransportEvent::MasterChanged(master));
                    }
                }
            }
            _ => {
                if let Some(host) = session.host {
                    session.notify(host, TransportEvent::PlayerLeft(peer));
                }
            }
        }

        if session.members.is_empty() {
            hub.sessions.remove(&name);
        }
    }
}
