//! Peer Runtime
//!
//! One per process. Routes substrate events through the session connector,
//! applies envelopes exactly once, owns the local match state machine
//! instance and advances everything one tick at a time.
//!
//! Tick order:
//! 1. run a restart handed out on the previous tick
//! 2. drain substrate events (joins, leaves, frames)
//! 3. advance the match state machine
//! 4. start the match once everyone in the lobby is ready (authority only)
//! 5. send the machine's outputs

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::config::ArenaConfig;
use crate::core::hash::StateHash;
use crate::core::rng::derive_session_seed;
use crate::core::vec2::Transform;
use crate::game::entity::{EntityBridge, EntityKind};
use crate::game::events::GameEvent;
use crate::game::level::LevelSet;
use crate::game::machine::{
    AuthorityClaim, MatchConfig, MatchError, MatchOutput, MatchStateMachine, RestartCause,
};
use crate::game::state::{MatchPhase, MatchState, PeerId, PlayerId, PlayerRecord, PlayerState};
use crate::game::world::{Authority, World};
use crate::network::protocol::{Envelope, GameMode, Payload, ShutdownReason};
use crate::network::session::{
    ConnectionStatus, SessionConnector, SessionError, SessionHandle, SessionSignal, StatusUpdate,
};
use crate::network::transport::Transport;

/// Peer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    /// Session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Match rule violation
    #[error(transparent)]
    Match(#[from] MatchError),

    /// No match authority has been seen yet
    #[error("no match in progress")]
    NoMatch,
}

/// A participant in an arena session.
#[derive(Debug)]
pub struct Peer<T: Transport> {
    connector: SessionConnector<T>,
    world: World,
    machine: Option<MatchStateMachine>,
    rules: MatchConfig,
    events: broadcast::Sender<GameEvent>,
    seq: u64,
    last_seen: BTreeMap<PeerId, u64>,
    restart_due: Option<RestartCause>,
    ended: Option<ShutdownReason>,
}

impl<T: Transport> Peer<T> {
    /// Create a disconnected peer.
    pub fn new(transport: T, bridge: Box<dyn EntityBridge>, config: &ArenaConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            connector: SessionConnector::new(transport, config.session.clone()),
            world: World::new(LevelSet::standard(config.level_count), bridge),
            machine: None,
            rules: config.rules.clone(),
            events,
            seq: 0,
            last_seen: BTreeMap::new(),
            restart_due: None,
            ended: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Local world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Local match instance, once the authority has been seen.
    pub fn machine(&self) -> Option<&MatchStateMachine> {
        self.machine.as_ref()
    }

    /// Current phase, once the authority has been seen.
    pub fn phase(&self) -> Option<MatchPhase> {
        self.machine.as_ref().map(|m| m.phase())
    }

    /// Whether a level transition is running locally.
    pub fn is_transitioning(&self) -> bool {
        self.machine.as_ref().map(|m| m.is_transitioning()).unwrap_or(false)
    }

    /// Whether local input is accepted.
    pub fn input_enabled(&self) -> bool {
        self.machine.as_ref().map(|m| m.input_enabled()).unwrap_or(false)
    }

    /// Connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.connector.status()
    }

    /// Current session.
    pub fn session(&self) -> Option<&SessionHandle> {
        self.connector.session()
    }

    /// Why the last session ended, if it did.
    pub fn ended(&self) -> Option<ShutdownReason> {
        self.ended
    }

    /// This peer's own player.
    pub fn local_player(&self) -> Option<PlayerId> {
        self.connector.session().map(|s| s.local_peer.player_id())
    }

    /// Subscribe to presentation events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    /// Subscribe to connection status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.connector.subscribe_status()
    }

    /// Hash of the mirrored match state and registry.
    pub fn state_hash(&self) -> Option<StateHash> {
        self.machine.as_ref().map(|m| m.state().compute_hash(&self.world.players))
    }

    /// [`Peer::state_hash`] as hex, for logs.
    pub fn state_hash_hex(&self) -> String {
        self.state_hash().map(hex::encode).unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    /// Join or host a session.
    #[instrument(skip(self))]
    pub async fn connect(&mut self, mode: GameMode, session_name: &str) -> Result<SessionHandle, PeerError> {
        let handle = self.connector.connect(mode, session_name).await?;
        self.world.authority = Authority {
            local_peer: handle.local_peer,
            owns_match: false,
        };
        self.seq = 0;
        self.last_seen.clear();
        self.restart_due = None;
        self.ended = None;
        Ok(handle)
    }

    /// Leave the session and reset to a fresh lobby.
    pub fn shutdown(&mut self, reason: ShutdownReason) {
        if let Some(mut machine) = self.machine.take() {
            machine.abort();
        }
        self.connector.shutdown(reason, &mut self.world);
        self.reset_local(reason);
    }

    /// Ask for a restart. Runs through the machine when one exists so the
    /// teardown happens at a tick boundary.
    pub fn request_restart(&mut self) {
        match self.machine.as_mut() {
            Some(machine) => machine.request_restart(RestartCause::Requested),
            None => self.shutdown(ShutdownReason::Ok),
        }
    }

    fn restart(&mut self, cause: RestartCause) {
        let reason = match cause {
            RestartCause::GameAlreadyRunning => ShutdownReason::GameAlreadyRunning,
            RestartCause::Requested => ShutdownReason::Ok,
        };
        info!(?cause, "Restarting");
        self.shutdown(reason);
    }

    fn reset_local(&mut self, reason: ShutdownReason) {
        self.world.levels.return_to_lobby(self.world.bridge.as_mut());
        self.seq = 0;
        self.last_seen.clear();
        self.restart_due = None;
        self.ended = Some(reason);
    }

    // -------------------------------------------------------------------------
    // Gameplay
    // -------------------------------------------------------------------------

    /// Set a player's ready flag. The record owner only.
    pub fn set_ready(&mut self, id: PlayerId, ready: bool) -> Result<(), PeerError> {
        let machine = self.machine.as_mut().ok_or(PeerError::NoMatch)?;
        machine.set_ready(&mut self.world, id, ready)?;
        Ok(())
    }

    /// A player's avatar was destroyed. The record owner only.
    pub fn record_death(&mut self, id: PlayerId) -> Result<(), PeerError> {
        let machine = self.machine.as_mut().ok_or(PeerError::NoMatch)?;
        machine.record_death(&mut self.world, id)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Advance one tick.
    pub fn tick(&mut self) {
        if let Some(cause) = self.restart_due.take() {
            self.restart(cause);
            return;
        }

        for event in self.connector.poll() {
            for signal in self.connector.handle_event(event, &mut self.world) {
                self.on_signal(signal);
            }
        }

        if let Some(machine) = self.machine.as_mut() {
            machine.tick(&mut self.world);

            let min_players = machine.config().min_players_to_start;
            if self.world.authority.owns_match
                && machine.phase() == MatchPhase::Lobby
                && self.world.players.all_ready(min_players)
            {
                if let Err(e) = machine.on_all_players_ready(&mut self.world) {
                    warn!(error = %e, "Ready-up failed");
                }
            }
        }

        self.flush();
    }

    fn flush(&mut self) {
        let outputs = match self.machine.as_mut() {
            Some(machine) => machine.drain_outputs(),
            None => return,
        };
        for output in outputs {
            match output {
                MatchOutput::Call(call) => self.send(Payload::Call(call)),
                MatchOutput::Phase(update) => self.send(Payload::Phase(update)),
                MatchOutput::Record(record) => self.send(Payload::PlayerUpsert(record)),
                MatchOutput::CloseSession => self.connector.set_session_open(false, false),
                MatchOutput::Restart(cause) => self.restart_due = Some(cause),
            }
        }
    }

    fn send(&mut self, payload: Payload) {
        let Some(session) = self.connector.session() else {
            debug!(?payload, "Not in a session, frame dropped");
            return;
        };
        self.seq += 1;
        let envelope = Envelope {
            session: session.session_id,
            sender: session.local_peer,
            seq: self.seq,
            payload,
        };
        match envelope.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.connector.send(bytes) {
                    warn!(error = %e, "Send failed");
                }
            }
            Err(e) => warn!(error = %e, "Encode failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Session signals
    // -------------------------------------------------------------------------

    fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::SpawnAuthority => self.spawn_authority(),
            SessionSignal::SpawnPlayer(peer) => self.spawn_player(peer),
            SessionSignal::PeerJoined(peer) => {
                debug!(%peer, "Peer joined, resyncing");
                self.resync();
            }
            SessionSignal::DespawnPlayer(peer) => self.despawn_player(peer),
            SessionSignal::AuthorityMigrated(master) => self.migrate_authority(master),
            SessionSignal::Frame { from, bytes } => self.on_frame(from, &bytes),
            SessionSignal::Ended(reason) => {
                info!(%reason, "Session ended");
                if let Some(mut machine) = self.machine.take() {
                    machine.abort();
                }
                self.reset_local(reason);
            }
        }
    }

    fn spawn_authority(&mut self) {
        if self.machine.is_some() {
            debug!("Match authority already present");
            return;
        }
        let Some(session) = self.connector.session().cloned() else {
            return;
        };
        let local = session.local_peer;
        let handle = self.world.bridge.spawn(EntityKind::MatchAuthority, Transform::IDENTITY, local);
        self.world.authority.owns_match = true;

        let claim = AuthorityClaim { owner: local, handle };
        let mut machine = self.new_machine(claim, MatchState::new(), &session);
        if let Err(e) = machine.on_joined_authority(&self.world) {
            warn!(error = %e, "Fresh authority not in the lobby");
        }
        let state = machine.state().clone();
        self.machine = Some(machine);
        self.send(Payload::AuthoritySpawned { claim, state });
    }

    fn new_machine(&self, claim: AuthorityClaim, state: MatchState, session: &SessionHandle) -> MatchStateMachine {
        let seed = self
            .rules
            .seed
            .unwrap_or_else(|| derive_session_seed(session.session_id.as_bytes(), claim.owner.0));
        MatchStateMachine::new(claim, state, self.rules.clone(), seed, self.events.clone())
    }

    fn spawn_player(&mut self, peer: PeerId) {
        let local = self.world.authority.local_peer;
        if self.world.authority.owns_match && peer != local {
            self.resync();
        }
        if let Some(phase) = self.phase() {
            if phase != MatchPhase::Lobby {
                let err = MatchError::StaleJoin(phase);
                warn!(%peer, error = %err, "Player not spawned");
                return;
            }
        }

        let id = peer.player_id();
        if self.world.players.contains(id) {
            debug!(player = %id, "Player already spawned");
            return;
        }

        let record = PlayerRecord::new(id, local, self.rules.max_lives, self.rules.max_health);
        let mut state = PlayerState::mirrored(record.clone());
        let transform = self.world.levels.spawn_point(id);
        state.entity = Some(self.world.bridge.spawn(EntityKind::Player(id), transform, local));
        state.avatar = Some(self.world.bridge.spawn(EntityKind::Avatar(id), transform, local));
        state.avatar_active = true;
        self.world.players.insert(state);
        info!(player = %id, %peer, %transform, "Player spawned");

        self.send(Payload::PlayerUpsert(record));
    }

    /// Re-send what a newcomer needs: the authority snapshot when held here,
    /// and every record this peer owns.
    fn resync(&mut self) {
        if self.world.authority.owns_match {
            if let Some(machine) = self.machine.as_ref() {
                let claim = machine.claim();
                let state = machine.state().clone();
                self.send(Payload::AuthoritySpawned { claim, state });
            }
        }
        for id in self.world.owned_records() {
            if let Some(player) = self.world.players.get(id) {
                let record = player.record.clone();
                self.send(Payload::PlayerUpsert(record));
            }
        }
    }

    fn despawn_player(&mut self, peer: PeerId) {
        let id = peer.player_id();
        let Some(player) = self.world.players.remove(id) else {
            return;
        };
        if player.record.owner == self.world.authority.local_peer {
            for handle in player.entity.into_iter().chain(player.avatar) {
                self.world.bridge.despawn(handle);
            }
        }
        info!(player = %id, "Player despawned");

        if self.world.authority.owns_match {
            self.send(Payload::PlayerRemoved { id });
            if let Some(machine) = self.machine.as_mut() {
                if let Err(e) = machine.on_player_eliminated(&self.world) {
                    warn!(error = %e, "Elimination check failed");
                }
            }
        }
    }

    fn migrate_authority(&mut self, master: PeerId) {
        let local = self.world.authority.local_peer;
        if let Some(machine) = self.machine.as_mut() {
            machine.transfer_claim(master);
        }
        if master != local {
            return;
        }

        self.world.authority.owns_match = true;
        match self.machine.as_mut() {
            Some(machine) => {
                if let Err(e) = machine.on_joined_authority(&self.world) {
                    warn!(error = %e, "Inherited a running match");
                }
                self.resync();
            }
            None => self.spawn_authority(),
        }
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    fn on_frame(&mut self, from: PeerId, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from, error = %e, "Undecodable frame");
                return;
            }
        };
        let Some(session) = self.connector.session() else {
            return;
        };
        if envelope.session != session.session_id {
            debug!(%from, "Frame for another session dropped");
            return;
        }
        if envelope.sender != from {
            warn!(%from, sender = %envelope.sender, "Frame sender mismatch");
            return;
        }

        let last = self.last_seen.entry(from).or_insert(0);
        if envelope.seq <= *last {
            debug!(%from, seq = envelope.seq, "Duplicate frame dropped");
            return;
        }
        *last = envelope.seq;

        self.apply_payload(from, envelope.payload);
    }

    fn apply_payload(&mut self, from: PeerId, payload: Payload) {
        let local = self.world.authority.local_peer;
        match payload {
            Payload::AuthoritySpawned { claim, state } => self.on_authority_spawned(claim, state),
            Payload::Call(call) => {
                let Some(machine) = self.machine.as_mut() else {
                    debug!(id = call.id, "Call before authority, dropped");
                    return;
                };
                if from != machine.claim().owner {
                    warn!(%from, "Call from a non-authority ignored");
                    return;
                }
                if let Err(e) = machine.apply_call(&call, &mut self.world) {
                    warn!(id = call.id, error = %e, "Call rejected");
                }
            }
            Payload::Phase(update) => {
                if let Some(machine) = self.machine.as_mut() {
                    if from == machine.claim().owner {
                        machine.apply_phase_update(&update);
                    }
                }
            }
            Payload::PlayerUpsert(record) => {
                if record.owner == local {
                    return;
                }
                if record.owner != from {
                    warn!(%from, player = %record.id, "Record from a non-owner ignored");
                    return;
                }
                match self.machine.as_mut() {
                    Some(machine) => machine.apply_record(&mut self.world, record),
                    None => {
                        self.world.players.apply_record(record);
                    }
                }
            }
            Payload::PlayerRemoved { id } => {
                let owner = self.machine.as_ref().map(|m| m.claim().owner);
                if owner != Some(from) {
                    warn!(%from, player = %id, "Removal from a non-authority ignored");
                    return;
                }
                if self.world.players.remove(id).is_some() {
                    debug!(player = %id, "Player removed by authority");
                }
            }
        }
    }

    fn on_authority_spawned(&mut self, claim: AuthorityClaim, state: MatchState) {
        let local = self.world.authority.local_peer;
        match self.machine.as_mut() {
            Some(machine) if machine.claim() == claim => machine.sync_state(&state),
            Some(machine) => {
                let err = MatchError::AuthorityConflict(claim.owner);
                warn!(error = %err, held = %machine.claim().owner, "Second authority claim");
                if claim.owner == local {
                    self.world.bridge.despawn(claim.handle);
                }
            }
            None => {
                let Some(session) = self.connector.session().cloned() else {
                    return;
                };
                let mut machine = self.new_machine(claim, state, &session);
                if let Err(e) = machine.on_joined_authority(&self.world) {
                    warn!(error = %e, "Joined a running match");
                }
                self.machine = Some(machine);
            }
        }
    }
}
