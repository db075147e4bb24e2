//! Match State Machine
//!
//! Drives a match through Lobby → Transition → Level → Transition → …
//!
//! Every peer runs one instance. Decisions (round over, everyone ready) are
//! taken only where the match authority lives and leave as [`BroadcastCall`]s.
//! Calls are applied through [`MatchStateMachine::apply_call`] on every peer,
//! the issuer included, once the transport delivers them back. Replicated
//! fields are written only by their owner: the phase by the match authority,
//! a player record by the peer in its `owner` field. Writes made on a peer
//! without that right are skipped.

use std::time::Duration;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::rng::DeterministicRng;
use crate::game::entity::EntityHandle;
use crate::game::events::{GameEvent, GameEventData};
use crate::game::level::LevelTarget;
use crate::game::sequencer::{
    LevelTransitionSequencer, Milestone, SequencerEvent, TransitionPlan, TransitionTimings,
};
use crate::game::state::{
    MatchPhase, MatchState, PeerId, PhaseUpdate, PlayerId, PlayerRecord, RecordApply,
};
use crate::game::timer::TimerQueue;
use crate::game::world::World;

// =============================================================================
// CONFIG
// =============================================================================

/// Match rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchConfig {
    /// Rounds needed to win the match
    pub max_score: u8,
    /// Lives per level
    pub max_lives: u8,
    /// Health on (re)spawn
    pub max_health: u8,
    /// Players required before ready-up starts a match
    pub min_players_to_start: usize,
    /// Pause between the winning round and the lobby transition
    pub match_won_delay: Duration,
    /// Countdown before a level starts, in seconds
    pub countdown_seconds: u8,
    /// Sequencer step delays
    pub timings: TransitionTimings,
    /// Fixed level-selection seed; derived from the session when unset
    pub seed: Option<u64>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_score: 3,
            max_lives: 3,
            max_health: 100,
            min_players_to_start: 2,
            match_won_delay: Duration::from_millis(500),
            countdown_seconds: 3,
            timings: TransitionTimings::default(),
            seed: None,
        }
    }
}

// =============================================================================
// CALLS & OUTPUTS
// =============================================================================

/// Authoritative call applied identically on every peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchCall {
    /// Round over: credit the winner and load the next level
    ScoreAndLoad {
        /// Round winner; `None` for a draw or match start
        winner: Option<PlayerId>,
        /// Winner's score after this round
        winning_score: u8,
        /// Gameplay level to load
        next_level: usize,
    },
    /// Match over: return everyone to the lobby
    LobbyTransition {
        /// Match winner, if any
        winner: Option<PlayerId>,
    },
}

/// A call stamped with the issuer's monotonically increasing id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastCall {
    /// Call id; a peer applies each id at most once
    pub id: u64,
    /// The call
    pub call: MatchCall,
}

/// The single claim to match authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityClaim {
    /// Peer holding the claim
    pub owner: PeerId,
    /// Entity representing the match state
    pub handle: EntityHandle,
}

/// Why a restart was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartCause {
    /// Joined or inherited a match past the lobby
    GameAlreadyRunning,
    /// Asked for explicitly
    Requested,
}

/// Work for the owning peer to carry out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchOutput {
    /// Send a call to every peer, this one included
    Call(BroadcastCall),
    /// Replicate a phase write
    Phase(PhaseUpdate),
    /// Replicate a player record write
    Record(PlayerRecord),
    /// Close the session to new joins and hide it
    CloseSession,
    /// Tear the session down
    Restart(RestartCause),
}

/// Match errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    /// Operation reserved for the match authority
    #[error("peer does not hold match authority")]
    NotAuthority,

    /// Record write by a peer that does not own it
    #[error("peer does not own the record of {0}")]
    NotRecordOwner(PlayerId),

    /// Player id not in the registry
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// Level index outside the level set
    #[error("unknown level index {0}")]
    UnknownLevel(usize),

    /// A second authority claim was seen
    #[error("duplicate authority claim by {0}")]
    AuthorityConflict(PeerId),

    /// Joined a match that already left the lobby
    #[error("match already in {0} phase")]
    StaleJoin(MatchPhase),

    /// Phase write outside the legal edges
    #[error("illegal phase transition {from} -> {to}")]
    IllegalPhaseTransition {
        /// Phase before the write
        from: MatchPhase,
        /// Rejected target phase
        to: MatchPhase,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Deferred {
    LobbyTransition { winner: Option<PlayerId> },
    Countdown { remaining: u8 },
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Per-peer match orchestrator.
#[derive(Debug)]
pub struct MatchStateMachine {
    claim: AuthorityClaim,
    state: MatchState,
    config: MatchConfig,
    sequencer: LevelTransitionSequencer,
    plan: Option<TransitionPlan>,
    timers: TimerQueue<Deferred>,
    rng: DeterministicRng,
    outputs: Vec<MatchOutput>,
    events: broadcast::Sender<GameEvent>,
    tick: u64,
    next_call_id: u64,
    last_applied_call: u64,
    call_in_flight: bool,
    input_enabled: bool,
    phase_before_transition: MatchPhase,
    restart_pending: Option<RestartCause>,
}

impl MatchStateMachine {
    /// Create the local instance for a claim.
    pub fn new(
        claim: AuthorityClaim,
        state: MatchState,
        config: MatchConfig,
        seed: u64,
        events: broadcast::Sender<GameEvent>,
    ) -> Self {
        let sequencer = LevelTransitionSequencer::new(config.timings.clone());
        let phase = state.phase;
        Self {
            claim,
            state,
            config,
            sequencer,
            plan: None,
            timers: TimerQueue::new(),
            rng: DeterministicRng::new(seed),
            outputs: Vec::new(),
            events,
            tick: 0,
            next_call_id: 0,
            last_applied_call: 0,
            call_in_flight: false,
            input_enabled: phase != MatchPhase::Transition,
            phase_before_transition: phase,
            restart_pending: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The authority claim this instance belongs to.
    pub fn claim(&self) -> AuthorityClaim {
        self.claim
    }

    /// Current replicated state.
    pub fn state(&self) -> &MatchState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> MatchPhase {
        self.state.phase
    }

    /// Rules in force.
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Whether local input is accepted.
    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// Whether a transition is in flight.
    pub fn is_transitioning(&self) -> bool {
        self.sequencer.is_running()
    }

    /// Ticks advanced so far.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Whether a restart has been flagged but not yet handed out.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending.is_some()
    }

    /// Take everything the owning peer has to act on.
    pub fn drain_outputs(&mut self) -> Vec<MatchOutput> {
        std::mem::take(&mut self.outputs)
    }

    // -------------------------------------------------------------------------
    // Authority lifecycle
    // -------------------------------------------------------------------------

    /// This peer now holds (or confirmed) the claim, or just joined a match
    /// through it. A match found past the lobby flags a restart that is
    /// handed out on the next tick.
    pub fn on_joined_authority(&mut self, world: &World) -> Result<(), MatchError> {
        let phase = self.state.phase;
        if phase != MatchPhase::Lobby {
            warn!(%phase, authority = world.authority.owns_match, "Match already running, restart flagged");
            self.restart_pending = Some(RestartCause::GameAlreadyRunning);
            return Err(MatchError::StaleJoin(phase));
        }
        if world.authority.owns_match {
            info!(owner = %self.claim.owner, handle = %self.claim.handle, "Match authority established");
        } else {
            debug!(owner = %self.claim.owner, "Mirroring match authority");
        }
        Ok(())
    }

    /// Hand the claim to a new owner after the previous one left.
    pub fn transfer_claim(&mut self, owner: PeerId) {
        info!(from = %self.claim.owner, to = %owner, "Match authority transferred");
        self.claim.owner = owner;
    }

    /// Adopt a full state snapshot from the authority.
    pub fn sync_state(&mut self, snapshot: &MatchState) {
        let previous = self.state.phase;
        if self.state.sync(snapshot) && previous != snapshot.phase {
            self.emit(GameEventData::PhaseChanged { from: previous, to: snapshot.phase });
        }
    }

    /// Flag a restart, handed out on the next tick.
    pub fn request_restart(&mut self, cause: RestartCause) {
        self.restart_pending.get_or_insert(cause);
    }

    /// Drop pending steps and timers. Used on teardown.
    pub fn abort(&mut self) {
        self.sequencer.abort();
        self.timers.clear();
        self.plan = None;
        self.outputs.clear();
    }

    // -------------------------------------------------------------------------
    // Authority decisions
    // -------------------------------------------------------------------------

    /// A player lost their last life. Ends the round when at most one player
    /// is left standing. Returns whether a call was issued.
    pub fn on_player_eliminated(&mut self, world: &World) -> Result<bool, MatchError> {
        if !world.authority.owns_match {
            return Err(MatchError::NotAuthority);
        }
        if self.state.phase != MatchPhase::Level || self.call_in_flight {
            return Ok(false);
        }

        let alive = world.players.alive_count();
        debug!(alive, "Player eliminated");

        let call = match alive {
            0 => {
                info!("No player left standing, round is a draw");
                MatchCall::ScoreAndLoad {
                    winner: None,
                    winning_score: 0,
                    next_level: world.levels.random_level_index(&mut self.rng),
                }
            }
            1 => {
                let Some(winner) = world.players.first_alive() else {
                    return Ok(false);
                };
                let winner_id = winner.id();
                let winning_score = winner.record.score.saturating_add(1);
                info!(winner = %winner_id, score = winning_score, "Round won");
                MatchCall::ScoreAndLoad {
                    winner: Some(winner_id),
                    winning_score,
                    next_level: world.levels.random_level_index(&mut self.rng),
                }
            }
            _ => return Ok(false),
        };

        self.issue_call(call);
        Ok(true)
    }

    /// Every player readied up. Starts the match from the lobby; anywhere
    /// else this is a no-op. Returns whether a call was issued.
    pub fn on_all_players_ready(&mut self, world: &mut World) -> Result<bool, MatchError> {
        if !world.authority.owns_match {
            return Err(MatchError::NotAuthority);
        }
        if self.state.phase != MatchPhase::Lobby || self.call_in_flight {
            return Ok(false);
        }

        info!(players = world.players.len(), "All players ready, starting match");
        let (max_lives, max_health) = (self.config.max_lives, self.config.max_health);
        for id in world.owned_records() {
            self.write_record(world, id, |r| {
                r.score = 0;
                r.lives = max_lives;
                r.health = max_health;
            })?;
        }

        self.outputs.push(MatchOutput::CloseSession);
        let next_level = world.levels.random_level_index(&mut self.rng);
        self.issue_call(MatchCall::ScoreAndLoad {
            winner: None,
            winning_score: 0,
            next_level,
        });
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Record owner operations
    // -------------------------------------------------------------------------

    /// A player's avatar was destroyed. The record owner consumes a life;
    /// losing the last one eliminates the player. Ignored outside a level.
    pub fn record_death(&mut self, world: &mut World, id: PlayerId) -> Result<(), MatchError> {
        if self.state.phase != MatchPhase::Level {
            debug!(player = %id, phase = %self.state.phase, "Death outside a level ignored");
            return Ok(());
        }
        let max_health = self.config.max_health;
        self.write_record(world, id, |r| {
            r.lives = r.lives.saturating_sub(1);
            if r.lives == 0 {
                r.alive = false;
            } else {
                r.health = max_health;
            }
        })?;

        let eliminated = world.players.get(id).map(|p| !p.record.alive).unwrap_or(false);
        if eliminated && world.authority.owns_match {
            self.on_player_eliminated(world)?;
        }
        Ok(())
    }

    /// Set a player's ready flag.
    pub fn set_ready(&mut self, world: &mut World, id: PlayerId, ready: bool) -> Result<(), MatchError> {
        self.write_record(world, id, |r| r.ready = ready)
    }

    // -------------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------------

    /// Apply a phase write from the authority.
    pub fn apply_phase_update(&mut self, update: &PhaseUpdate) {
        let from = self.state.phase;
        if let Some(previous) = self.state.apply(update) {
            if !previous.can_transition_to(update.phase) && previous != update.phase {
                warn!(%previous, next = %update.phase, "Authority wrote an unexpected phase edge");
            }
            if from != update.phase {
                self.emit(GameEventData::PhaseChanged { from, to: update.phase });
            }
        }
    }

    /// Apply a player record from its owner. The authority re-checks the
    /// round when a player drops out.
    pub fn apply_record(&mut self, world: &mut World, record: PlayerRecord) {
        let alive = record.alive;
        let id = record.id;
        let outcome = world.players.apply_record(record);
        if outcome == (RecordApply::Updated { was_alive: true }) && !alive && world.authority.owns_match {
            debug!(player = %id, "Remote player eliminated");
            if let Err(e) = self.on_player_eliminated(world) {
                warn!(error = %e, "Elimination check failed");
            }
        }
    }

    /// Apply an authoritative call. Each call id is applied at most once.
    pub fn apply_call(&mut self, call: &BroadcastCall, world: &mut World) -> Result<(), MatchError> {
        if call.id <= self.last_applied_call {
            debug!(id = call.id, last = self.last_applied_call, "Duplicate call ignored");
            return Ok(());
        }
        self.last_applied_call = call.id;
        self.call_in_flight = false;

        match &call.call {
            MatchCall::ScoreAndLoad { winner, winning_score, next_level } => {
                self.apply_score_and_load(world, *winner, *winning_score, *next_level)
            }
            MatchCall::LobbyTransition { winner } => self.apply_lobby_transition(world, *winner),
        }
    }

    fn apply_score_and_load(
        &mut self,
        world: &mut World,
        winner: Option<PlayerId>,
        winning_score: u8,
        next_level: usize,
    ) -> Result<(), MatchError> {
        if next_level >= world.levels.level_count() {
            warn!(next_level, "Score and load names an unknown level, ignored");
            return Err(MatchError::UnknownLevel(next_level));
        }

        let prior = self.state.phase;
        info!(winner = ?winner, score = winning_score, next_level, %prior, "Score and load");
        if prior != MatchPhase::Transition {
            self.phase_before_transition = prior;
        }
        self.write_phase(world, MatchPhase::Transition);

        let (max_lives, max_health) = (self.config.max_lives, self.config.max_health);
        if prior == MatchPhase::Lobby {
            // Match start: every owner resets its own records
            for id in world.owned_records() {
                self.write_record(world, id, |r| {
                    r.score = 0;
                    r.lives = max_lives;
                    r.health = max_health;
                })?;
            }
        }

        if let Some(winner_id) = winner {
            if !world.players.contains(winner_id) {
                warn!(winner = %winner_id, "Winner no longer present, score not applied");
            } else if world.owns_record(winner_id) {
                self.write_record(world, winner_id, |r| r.score = winning_score)?;
            }
            if winning_score >= self.config.max_score {
                info!(winner = %winner_id, score = winning_score, "Match won");
                self.emit(GameEventData::MatchWon { winner_id: winner });
                self.timers.schedule(self.tick, self.config.match_won_delay, Deferred::LobbyTransition { winner });
                return Ok(());
            }
        }

        for id in world.owned_records() {
            self.write_record(world, id, |r| r.lives = max_lives)?;
        }

        match self.sequencer.run_level_transition(next_level, winner, winning_score, world, self.tick) {
            Ok(()) => {
                self.plan = self.sequencer.plan().cloned();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Level transition not started");
                Ok(())
            }
        }
    }

    fn apply_lobby_transition(&mut self, world: &mut World, winner: Option<PlayerId>) -> Result<(), MatchError> {
        let prior = self.state.phase;
        info!(winner = ?winner, %prior, "Lobby transition");
        if prior != MatchPhase::Transition {
            self.phase_before_transition = prior;
        }
        self.write_phase(world, MatchPhase::Transition);

        for id in world.owned_records() {
            self.write_record(world, id, |r| r.ready = false)?;
        }

        let winning_score = winner
            .and_then(|id| world.players.get(id))
            .map(|p| p.record.score)
            .unwrap_or(0);

        match self.sequencer.run_lobby_transition(winner, winning_score, world, self.tick) {
            Ok(()) => self.plan = self.sequencer.plan().cloned(),
            Err(e) => warn!(error = %e, "Lobby transition not started"),
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Advance one tick: hand out a flagged restart, fire due timers, step
    /// the sequencer.
    pub fn tick(&mut self, world: &mut World) {
        self.tick += 1;

        if let Some(cause) = self.restart_pending.take() {
            info!(?cause, "Restart requested");
            self.outputs.push(MatchOutput::Restart(cause));
        }

        for action in self.timers.drain_due(self.tick) {
            match action {
                Deferred::LobbyTransition { winner } => {
                    if world.authority.owns_match {
                        self.issue_call(MatchCall::LobbyTransition { winner });
                    }
                }
                Deferred::Countdown { remaining } => self.countdown(world, remaining),
            }
        }

        let (events, finished) = self.sequencer.advance(self.tick, world);
        for event in events {
            self.on_sequencer_event(world, event);
        }
        if finished.is_some() {
            self.plan = None;
        }
    }

    fn on_sequencer_event(&mut self, world: &mut World, event: SequencerEvent) {
        match event {
            SequencerEvent::AvatarDespawned(id) => debug!(player = %id, "Avatar despawned"),
            SequencerEvent::AvatarRespawned { player_id, transform } => {
                debug!(player = %player_id, %transform, "Avatar respawned");
                if world.owns_record(player_id) {
                    let max_health = self.config.max_health;
                    if let Err(e) = self.write_record(world, player_id, |r| {
                        r.alive = true;
                        r.health = max_health;
                    }) {
                        warn!(error = %e, "Respawn write failed");
                    }
                }
            }
            SequencerEvent::Effect { active } => self.emit(GameEventData::TransitionEffect { active }),
            SequencerEvent::LevelActivated(target) => self.emit(GameEventData::LevelActivated { target }),
            SequencerEvent::Milestone(milestone) => {
                let Some(plan) = self.plan.clone() else {
                    return;
                };
                self.on_milestone(world, milestone, &plan);
            }
        }
    }

    fn on_milestone(&mut self, world: &mut World, milestone: Milestone, plan: &TransitionPlan) {
        match (plan.target, milestone) {
            (LevelTarget::Level(_), Milestone::PlayersDespawned) => {
                self.set_input(false);
                if let Some(winner_id) = plan.winner {
                    self.emit(GameEventData::ScoreUpdated { player_id: winner_id, score: plan.winning_score });
                }
            }
            (LevelTarget::Level(_), Milestone::EffectVisible) => {
                self.emit(GameEventData::ScoreboardReset { lobby: false });
                if self.phase_before_transition == MatchPhase::Lobby {
                    self.emit(GameEventData::LobbyUi { visible: false });
                }
            }
            (LevelTarget::Level(_), Milestone::TransitionOver) => {
                let seconds = self.config.countdown_seconds;
                self.countdown(world, seconds);
            }
            (LevelTarget::Lobby, Milestone::PlayersDespawned) => {
                if let Some(player) = plan.winner.and_then(|id| world.players.get(id)) {
                    let (player_id, score) = (player.id(), player.record.score);
                    self.emit(GameEventData::ScoreUpdated { player_id, score });
                }
            }
            (LevelTarget::Lobby, Milestone::EffectVisible) => {
                self.emit(GameEventData::LobbyScoreShown { winner_id: plan.winner });
                self.emit(GameEventData::ScoreboardReset { lobby: true });
                self.emit(GameEventData::LobbyUi { visible: true });
            }
            (LevelTarget::Lobby, Milestone::TransitionOver) => {
                self.write_phase(world, MatchPhase::Lobby);
                self.set_input(true);
            }
        }
    }

    fn countdown(&mut self, world: &World, remaining: u8) {
        self.emit(GameEventData::Countdown { remaining });
        if remaining == 0 {
            self.write_phase(world, MatchPhase::Level);
            self.set_input(true);
        } else {
            self.timers.schedule(self.tick, Duration::from_secs(1), Deferred::Countdown { remaining: remaining - 1 });
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    fn issue_call(&mut self, call: MatchCall) {
        let id = self.next_call_id.max(self.last_applied_call) + 1;
        self.next_call_id = id;
        self.call_in_flight = true;
        debug!(id, ?call, "Issuing call");
        self.outputs.push(MatchOutput::Call(BroadcastCall { id, call }));
    }

    fn write_phase(&mut self, world: &World, next: MatchPhase) {
        if !world.authority.owns_match {
            return;
        }
        let from = self.state.phase;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            let err = MatchError::IllegalPhaseTransition { from, to: next };
            warn!(error = %err, "Phase write rejected");
            return;
        }
        let update = self.state.next_update(next);
        self.state.apply(&update);
        info!(%from, to = %next, generation = update.generation, "Phase changed");
        self.emit(GameEventData::PhaseChanged { from, to: next });
        self.outputs.push(MatchOutput::Phase(update));
    }

    fn write_record<F>(&mut self, world: &mut World, id: PlayerId, write: F) -> Result<(), MatchError>
    where
        F: FnOnce(&mut PlayerRecord),
    {
        let local = world.authority.local_peer;
        let player = world.players.get_mut(id).ok_or(MatchError::UnknownPlayer(id))?;
        if player.record.owner != local {
            return Err(MatchError::NotRecordOwner(id));
        }
        write(&mut player.record);
        player.record.generation += 1;
        self.outputs.push(MatchOutput::Record(player.record.clone()));
        Ok(())
    }

    fn set_input(&mut self, enabled: bool) {
        if self.input_enabled != enabled {
            self.input_enabled = enabled;
            self.emit(GameEventData::InputEnabled(enabled));
        }
    }

    fn emit(&self, data: GameEventData) {
        // No subscribers is fine
        let _ = self.events.send(GameEvent::new(self.tick, data));
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{EntityKind, EntityLedger};
    use crate::game::level::LevelSet;
    use crate::game::state::{PlayerRecord, PlayerState};
    use proptest::prelude::*;

    const HOST: PeerId = PeerId(0);

    struct Harness {
        machine: MatchStateMachine,
        world: World,
        events: broadcast::Receiver<GameEvent>,
        phases: Vec<MatchPhase>,
        log: Vec<GameEventData>,
        issued: Vec<BroadcastCall>,
        closed: bool,
        restarts: Vec<RestartCause>,
    }

    impl Harness {
        fn new(players: u32) -> Self {
            Self::with_config(players, MatchConfig::default())
        }

        fn with_config(players: u32, config: MatchConfig) -> Self {
            let ledger = EntityLedger::new();
            let mut world = World::new(LevelSet::standard(3), Box::new(ledger));
            world.authority.local_peer = HOST;
            world.authority.owns_match = true;
            for id in 0..players {
                let record = PlayerRecord::new(PlayerId(id), HOST, config.max_lives, config.max_health);
                let mut state = PlayerState::mirrored(record);
                let transform = world.levels.spawn_point(PlayerId(id));
                state.avatar = Some(world.bridge.spawn(EntityKind::Avatar(PlayerId(id)), transform, HOST));
                state.avatar_active = true;
                world.players.insert(state);
            }
            let (tx, rx) = broadcast::channel(4096);
            let claim = AuthorityClaim { owner: HOST, handle: EntityHandle(999) };
            let machine = MatchStateMachine::new(claim, MatchState::new(), config, 7, tx);
            Self {
                machine,
                world,
                events: rx,
                phases: vec![MatchPhase::Lobby],
                log: Vec::new(),
                issued: Vec::new(),
                closed: false,
                restarts: Vec::new(),
            }
        }

        /// Loop outputs back the way the transport would.
        fn deliver(&mut self) {
            loop {
                let outputs = self.machine.drain_outputs();
                if outputs.is_empty() {
                    break;
                }
                for output in outputs {
                    match output {
                        MatchOutput::Call(call) => {
                            self.issued.push(call.clone());
                            let _ = self.machine.apply_call(&call, &mut self.world);
                        }
                        MatchOutput::CloseSession => self.closed = true,
                        MatchOutput::Restart(cause) => self.restarts.push(cause),
                        MatchOutput::Phase(_) | MatchOutput::Record(_) => {}
                    }
                }
            }
            self.collect_events();
        }

        fn collect_events(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                if let GameEventData::PhaseChanged { to, .. } = event.data {
                    self.phases.push(to);
                }
                self.log.push(event.data);
            }
        }

        fn step(&mut self) {
            self.machine.tick(&mut self.world);
            self.deliver();
        }

        fn run_until(&mut self, mut done: impl FnMut(&Harness) -> bool) {
            for _ in 0..20_000 {
                if done(&*self) {
                    return;
                }
                self.step();
            }
            panic!("condition never reached, phase {}", self.machine.phase());
        }

        fn ready_all(&mut self) {
            for id in self.world.players.ids() {
                self.machine.set_ready(&mut self.world, id, true).unwrap();
            }
            self.machine.on_all_players_ready(&mut self.world).unwrap();
            self.deliver();
        }

        fn start_level(&mut self) {
            self.ready_all();
            self.run_until(|h| h.machine.phase() == MatchPhase::Level && !h.machine.is_transitioning());
        }

        fn kill(&mut self, id: PlayerId) {
            let lives = self.world.players.get(id).unwrap().record.lives;
            for _ in 0..lives {
                self.machine.record_death(&mut self.world, id).unwrap();
            }
        }

        fn score(&self, id: PlayerId) -> u8 {
            self.world.players.get(id).unwrap().record.score
        }

        fn last_level(&self) -> usize {
            self.issued
                .iter()
                .rev()
                .find_map(|c| match c.call {
                    MatchCall::ScoreAndLoad { next_level, .. } => Some(next_level),
                    _ => None,
                })
                .unwrap()
        }
    }

    fn assert_in_order(log: &[GameEventData], expected: &[GameEventData]) {
        let mut rest = log.iter();
        for want in expected {
            assert!(rest.any(|e| e == want), "{:?} missing or out of order in {:?}", want, log);
        }
    }

    fn assert_legal_path(phases: &[MatchPhase]) {
        for pair in phases.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "illegal edge {} -> {} in {:?}",
                pair[0],
                pair[1],
                phases
            );
        }
    }

    #[test]
    fn test_ready_up_starts_first_level() {
        let mut h = Harness::new(2);
        h.start_level();

        assert!(h.closed);
        assert_eq!(h.phases, vec![MatchPhase::Lobby, MatchPhase::Transition, MatchPhase::Level]);
        assert!(h.machine.input_enabled());
        assert_eq!(h.issued.len(), 1);
        assert!(matches!(
            h.issued[0].call,
            MatchCall::ScoreAndLoad { winner: None, winning_score: 0, .. }
        ));
        for player in h.world.players.iter() {
            assert!(player.record.alive);
            assert_eq!(player.record.lives, 3);
        }
    }

    #[test]
    fn test_countdown_precedes_level_phase() {
        let mut h = Harness::new(2);
        let mut rx = h.machine.events.subscribe();
        h.ready_all();
        h.run_until(|h| h.machine.phase() == MatchPhase::Level);

        let mut countdown = Vec::new();
        let mut level_after_zero = false;
        while let Ok(event) = rx.try_recv() {
            match event.data {
                GameEventData::Countdown { remaining } => countdown.push(remaining),
                GameEventData::PhaseChanged { to: MatchPhase::Level, .. } => {
                    level_after_zero = countdown.last() == Some(&0);
                }
                _ => {}
            }
        }
        assert_eq!(countdown, vec![3, 2, 1, 0]);
        assert!(level_after_zero);
    }

    #[test]
    fn test_first_level_hides_lobby_ui() {
        let mut h = Harness::new(2);
        h.start_level();
        let level = LevelTarget::Level(h.last_level());

        assert_in_order(&h.log, &[
            GameEventData::PhaseChanged { from: MatchPhase::Lobby, to: MatchPhase::Transition },
            GameEventData::InputEnabled(false),
            GameEventData::TransitionEffect { active: true },
            GameEventData::ScoreboardReset { lobby: false },
            GameEventData::LobbyUi { visible: false },
            GameEventData::LevelActivated { target: level },
            GameEventData::TransitionEffect { active: false },
            GameEventData::Countdown { remaining: 3 },
            GameEventData::Countdown { remaining: 0 },
            GameEventData::PhaseChanged { from: MatchPhase::Transition, to: MatchPhase::Level },
            GameEventData::InputEnabled(true),
        ]);
        // No winner on match start
        assert!(!h.log.iter().any(|e| matches!(e, GameEventData::ScoreUpdated { .. })));
    }

    #[test]
    fn test_next_round_shows_winner_score_and_keeps_lobby_ui() {
        let mut h = Harness::new(2);
        h.start_level();
        h.log.clear();

        h.kill(PlayerId(0));
        h.deliver();
        h.run_until(|h| h.machine.phase() == MatchPhase::Level && !h.machine.is_transitioning());
        let level = LevelTarget::Level(h.last_level());

        assert_in_order(&h.log, &[
            GameEventData::PhaseChanged { from: MatchPhase::Level, to: MatchPhase::Transition },
            GameEventData::InputEnabled(false),
            GameEventData::ScoreUpdated { player_id: PlayerId(1), score: 1 },
            GameEventData::TransitionEffect { active: true },
            GameEventData::ScoreboardReset { lobby: false },
            GameEventData::LevelActivated { target: level },
            GameEventData::PhaseChanged { from: MatchPhase::Transition, to: MatchPhase::Level },
            GameEventData::InputEnabled(true),
        ]);
        assert!(!h.log.iter().any(|e| matches!(e, GameEventData::LobbyUi { .. })));
    }

    #[test]
    fn test_match_won_lobby_return_events() {
        let mut h = Harness::new(2);
        h.start_level();
        h.world.players.get_mut(PlayerId(1)).unwrap().record.score = 2;
        h.log.clear();

        h.kill(PlayerId(0));
        h.deliver();
        h.run_until(|h| h.machine.phase() == MatchPhase::Lobby && !h.machine.is_transitioning());

        assert_in_order(&h.log, &[
            GameEventData::PhaseChanged { from: MatchPhase::Level, to: MatchPhase::Transition },
            GameEventData::MatchWon { winner_id: Some(PlayerId(1)) },
            GameEventData::ScoreUpdated { player_id: PlayerId(1), score: 3 },
            GameEventData::TransitionEffect { active: true },
            GameEventData::LobbyScoreShown { winner_id: Some(PlayerId(1)) },
            GameEventData::ScoreboardReset { lobby: true },
            GameEventData::LobbyUi { visible: true },
            GameEventData::LevelActivated { target: LevelTarget::Lobby },
            GameEventData::TransitionEffect { active: false },
            GameEventData::PhaseChanged { from: MatchPhase::Transition, to: MatchPhase::Lobby },
        ]);
        assert!(!h.log.contains(&GameEventData::ScoreboardReset { lobby: false }));
    }

    #[test]
    fn test_last_standing_issues_single_call() {
        let mut h = Harness::new(4);
        h.start_level();
        h.issued.clear();

        let mut calls = Vec::new();
        for id in [0, 1, 2] {
            h.kill(PlayerId(id));
            for output in h.machine.drain_outputs() {
                if let MatchOutput::Call(call) = output {
                    calls.push(call);
                }
            }
        }

        assert_eq!(calls.len(), 1);
        match &calls[0].call {
            MatchCall::ScoreAndLoad { winner, winning_score, next_level } => {
                assert_eq!(*winner, Some(PlayerId(3)));
                assert_eq!(*winning_score, h.score(PlayerId(3)) + 1);
                assert!(*next_level < h.world.levels.level_count());
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_zero_alive_issues_draw() {
        let mut h = Harness::new(4);
        h.start_level();
        for player in h.world.players.iter_mut() {
            player.record.alive = false;
        }

        assert!(h.machine.on_player_eliminated(&h.world).unwrap());
        let calls: Vec<_> = h
            .machine
            .drain_outputs()
            .into_iter()
            .filter_map(|o| match o {
                MatchOutput::Call(c) => Some(c.call),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], MatchCall::ScoreAndLoad { winner: None, winning_score: 0, .. }));
    }

    #[test]
    fn test_two_alive_issues_nothing() {
        let mut h = Harness::new(4);
        h.start_level();
        h.kill(PlayerId(0));
        h.kill(PlayerId(1));
        assert!(h
            .machine
            .drain_outputs()
            .iter()
            .all(|o| !matches!(o, MatchOutput::Call(_))));
    }

    #[test]
    fn test_duplicate_score_and_load_is_idempotent() {
        let mut h = Harness::new(2);
        h.start_level();

        let call = BroadcastCall {
            id: 50,
            call: MatchCall::ScoreAndLoad { winner: Some(PlayerId(1)), winning_score: 1, next_level: 0 },
        };
        h.machine.apply_call(&call, &mut h.world).unwrap();
        h.machine.apply_call(&call, &mut h.world).unwrap();
        h.deliver();

        assert_eq!(h.score(PlayerId(1)), 1);
        assert!(h.machine.is_transitioning());
        assert_eq!(h.machine.phase(), MatchPhase::Transition);
    }

    #[test]
    fn test_all_ready_during_level_is_noop() {
        let mut h = Harness::new(2);
        h.start_level();
        let before = h.machine.state().clone();
        h.issued.clear();

        assert!(!h.machine.on_all_players_ready(&mut h.world).unwrap());
        assert!(h.machine.drain_outputs().is_empty());
        assert_eq!(h.machine.state(), &before);
    }

    #[test]
    fn test_non_authority_cannot_decide() {
        let mut h = Harness::new(2);
        h.world.authority.owns_match = false;
        assert_eq!(h.machine.on_all_players_ready(&mut h.world), Err(MatchError::NotAuthority));
        assert_eq!(h.machine.on_player_eliminated(&h.world), Err(MatchError::NotAuthority));
    }

    #[test]
    fn test_record_write_requires_ownership() {
        let mut h = Harness::new(2);
        h.world.players.get_mut(PlayerId(1)).unwrap().record.owner = PeerId(5);
        assert_eq!(
            h.machine.set_ready(&mut h.world, PlayerId(1), true),
            Err(MatchError::NotRecordOwner(PlayerId(1)))
        );
        assert_eq!(
            h.machine.set_ready(&mut h.world, PlayerId(9), true),
            Err(MatchError::UnknownPlayer(PlayerId(9)))
        );
    }

    #[test]
    fn test_score_threshold_returns_to_lobby() {
        let mut h = Harness::new(2);
        h.start_level();
        h.world.players.get_mut(PlayerId(1)).unwrap().record.score = 2;
        h.issued.clear();

        h.kill(PlayerId(0));
        h.deliver();

        // No level transition for the winning round
        assert!(!h.machine.is_transitioning());
        assert_eq!(h.score(PlayerId(1)), 3);

        h.run_until(|h| h.issued.len() == 2);
        assert_eq!(h.issued[1].call, MatchCall::LobbyTransition { winner: Some(PlayerId(1)) });

        h.run_until(|h| h.machine.phase() == MatchPhase::Lobby);
        assert!(!h.machine.is_transitioning());
        assert!(h.world.players.iter().all(|p| !p.record.ready));
        assert_legal_path(&h.phases);
        assert_eq!(*h.phases.last().unwrap(), MatchPhase::Lobby);
    }

    #[test]
    fn test_match_won_delay() {
        let mut h = Harness::new(2);
        h.start_level();
        h.world.players.get_mut(PlayerId(1)).unwrap().record.score = 2;
        h.issued.clear();
        h.kill(PlayerId(0));
        h.deliver();
        let won_at = h.machine.current_tick();

        h.run_until(|h| h.issued.len() == 2);
        assert_eq!(h.machine.current_tick() - won_at, 30);
    }

    #[test]
    fn test_unknown_winner_still_transitions() {
        let mut h = Harness::new(2);
        h.start_level();
        let call = BroadcastCall {
            id: 40,
            call: MatchCall::ScoreAndLoad { winner: Some(PlayerId(42)), winning_score: 1, next_level: 1 },
        };
        h.machine.apply_call(&call, &mut h.world).unwrap();
        assert_eq!(h.machine.phase(), MatchPhase::Transition);
        assert!(h.machine.is_transitioning());
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        let mut h = Harness::new(2);
        h.start_level();
        let call = BroadcastCall {
            id: 40,
            call: MatchCall::ScoreAndLoad { winner: None, winning_score: 0, next_level: 17 },
        };
        assert_eq!(h.machine.apply_call(&call, &mut h.world), Err(MatchError::UnknownLevel(17)));
        assert_eq!(h.machine.phase(), MatchPhase::Level);
    }

    #[test]
    fn test_stale_phase_flags_restart_next_tick() {
        let (tx, _rx) = broadcast::channel(16);
        let claim = AuthorityClaim { owner: PeerId(1), handle: EntityHandle(3) };
        let state = MatchState { phase: MatchPhase::Level, generation: 9 };
        let mut machine = MatchStateMachine::new(claim, state, MatchConfig::default(), 1, tx);
        let mut world = World::new(LevelSet::standard(1), Box::new(EntityLedger::new()));
        world.authority.local_peer = PeerId(2);

        assert_eq!(machine.on_joined_authority(&world), Err(MatchError::StaleJoin(MatchPhase::Level)));
        assert!(machine.drain_outputs().is_empty());

        machine.tick(&mut world);
        assert_eq!(machine.drain_outputs(), vec![MatchOutput::Restart(RestartCause::GameAlreadyRunning)]);
    }

    #[test]
    fn test_replica_applies_phase_updates_in_generation_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let claim = AuthorityClaim { owner: PeerId(1), handle: EntityHandle(3) };
        let mut replica = MatchStateMachine::new(claim, MatchState::new(), MatchConfig::default(), 1, tx);

        let to_transition = PhaseUpdate { generation: 1, phase: MatchPhase::Transition };
        let to_level = PhaseUpdate { generation: 2, phase: MatchPhase::Level };
        replica.apply_phase_update(&to_transition);
        replica.apply_phase_update(&to_level);
        replica.apply_phase_update(&to_transition);

        assert_eq!(replica.phase(), MatchPhase::Level);
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.data);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_remote_elimination_triggers_round_check() {
        let mut h = Harness::new(2);
        h.start_level();
        // Player 1 is owned by a remote peer from here on
        h.world.players.get_mut(PlayerId(1)).unwrap().record.owner = PeerId(8);

        let mut record = h.world.players.get(PlayerId(1)).unwrap().record.clone();
        record.alive = false;
        record.lives = 0;
        record.generation += 1;
        h.machine.apply_record(&mut h.world, record);

        let calls: Vec<_> = h
            .machine
            .drain_outputs()
            .into_iter()
            .filter(|o| matches!(o, MatchOutput::Call(_)))
            .collect();
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn test_full_match_phase_path() {
        let mut h = Harness::new(3);
        h.start_level();

        for _round in 0..3 {
            h.kill(PlayerId(0));
            h.kill(PlayerId(1));
            h.deliver();
            h.run_until(|h| {
                !h.machine.is_transitioning()
                    && matches!(h.machine.phase(), MatchPhase::Level | MatchPhase::Lobby)
                    && h.machine.timers.is_empty()
            });
        }

        assert_eq!(h.machine.phase(), MatchPhase::Lobby);
        assert_eq!(h.score(PlayerId(2)), 3);
        assert_legal_path(&h.phases);
    }

    #[derive(Clone, Debug)]
    enum Action {
        Ready,
        Kill(u32),
        Tick(u16),
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Ready),
            (0u32..4).prop_map(Action::Kill),
            (1u16..400).prop_map(Action::Tick),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_phase_never_skips_transition(actions in proptest::collection::vec(action(), 1..40)) {
            let mut h = Harness::new(4);
            for action in actions {
                match action {
                    Action::Ready => {
                        for id in h.world.players.ids() {
                            let _ = h.machine.set_ready(&mut h.world, id, true);
                        }
                        let _ = h.machine.on_all_players_ready(&mut h.world);
                        h.deliver();
                    }
                    Action::Kill(id) => {
                        let _ = h.machine.record_death(&mut h.world, PlayerId(id));
                        h.deliver();
                    }
                    Action::Tick(n) => {
                        for _ in 0..n {
                            h.step();
                        }
                    }
                }
            }
            for pair in h.phases.windows(2) {
                prop_assert!(pair[0].can_transition_to(pair[1]), "path {:?}", h.phases);
            }
        }
    }
}
