//! Replicated Match State
//!
//! The authoritative state every peer mirrors: the match phase and one record
//! per player. Each record carries a generation counter; replicas apply an
//! update only when its generation is newer than what they hold, so duplicate
//! or reordered deliveries cannot roll state back.

use serde::{Serialize, Deserialize};

use crate::core::hash::{StateHash, compute_state_hash};
use crate::game::entity::EntityHandle;

// =============================================================================
// IDS
// =============================================================================

/// Transport-level identity of a connected peer.
///
/// Implements Ord so peer tables iterate deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The player id assigned to this peer's player record.
    #[inline]
    pub fn player_id(self) -> PlayerId {
        PlayerId(self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Stable player identifier. Also selects the player's spawn point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

// =============================================================================
// MATCH PHASE
// =============================================================================

/// Coarse state of the match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Waiting for every player to ready up
    #[default]
    Lobby,
    /// Active play
    Level,
    /// Scoring or level swap in progress, input disabled
    Transition,
}

impl MatchPhase {
    /// Whether `self -> next` is a legal edge.
    ///
    /// Lobby and Level are only ever left through Transition.
    pub fn can_transition_to(self, next: MatchPhase) -> bool {
        matches!(
            (self, next),
            (MatchPhase::Lobby, MatchPhase::Transition)
                | (MatchPhase::Level, MatchPhase::Transition)
                | (MatchPhase::Transition, MatchPhase::Level)
                | (MatchPhase::Transition, MatchPhase::Lobby)
        )
    }

    /// Short lowercase name for logs.
    pub fn name(self) -> &'static str {
        match self {
            MatchPhase::Lobby => "lobby",
            MatchPhase::Level => "level",
            MatchPhase::Transition => "transition",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MatchPhase::Lobby => 0,
            MatchPhase::Level => 1,
            MatchPhase::Transition => 2,
        }
    }
}

impl std::fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// PLAYER RECORD
// =============================================================================

/// Replicated fields of one player.
///
/// Only the peer in `owner` may write these; everyone else mirrors them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Stable player id
    pub id: PlayerId,
    /// Peer holding write authority over this record
    pub owner: PeerId,
    /// Levels won this match
    pub score: u8,
    /// Lives left in the current level
    pub lives: u8,
    /// Current health
    pub health: u8,
    /// Ready-up flag in the lobby
    pub ready: bool,
    /// Still standing in the current level
    pub alive: bool,
    /// Bumped by the owner on every write
    pub generation: u64,
}

impl PlayerRecord {
    /// Fresh record for a player that just joined.
    pub fn new(id: PlayerId, owner: PeerId, lives: u8, health: u8) -> Self {
        Self {
            id,
            owner,
            score: 0,
            lives,
            health,
            ready: false,
            alive: true,
            generation: 1,
        }
    }
}

// =============================================================================
// PLAYER STATE (local mirror)
// =============================================================================

/// A player as seen by this peer: the replicated record plus local
/// entity bookkeeping that never crosses the wire.
#[derive(Clone, Debug)]
pub struct PlayerState {
    /// Replicated record
    pub record: PlayerRecord,
    /// Player entity, when this peer spawned it
    pub entity: Option<EntityHandle>,
    /// In-level avatar entity, when this peer spawned it
    pub avatar: Option<EntityHandle>,
    /// Whether the avatar is currently in the world (tracked on every peer)
    pub avatar_active: bool,
}

impl PlayerState {
    /// Wrap a record received from its owner.
    pub fn mirrored(record: PlayerRecord) -> Self {
        Self {
            record,
            entity: None,
            avatar: None,
            avatar_active: false,
        }
    }

    /// Player id shortcut.
    #[inline]
    pub fn id(&self) -> PlayerId {
        self.record.id
    }
}

// =============================================================================
// PLAYER REGISTRY
// =============================================================================

/// Outcome of applying a replicated record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordApply {
    /// Record was new and has been inserted
    Inserted,
    /// Existing record replaced by a newer generation
    Updated {
        /// Alive flag before the update
        was_alive: bool,
    },
    /// Generation was not newer; nothing changed
    Stale,
}

/// Live players in join order, at most one entry per id.
#[derive(Clone, Debug, Default)]
pub struct PlayerRegistry {
    players: Vec<PlayerState>,
}

impl PlayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a player. Returns false if the id is already present.
    pub fn insert(&mut self, player: PlayerState) -> bool {
        if self.contains(player.id()) {
            return false;
        }
        self.players.push(player);
        true
    }

    /// Remove a player, keeping the join order of the rest.
    pub fn remove(&mut self, id: PlayerId) -> Option<PlayerState> {
        let idx = self.players.iter().position(|p| p.id() == id)?;
        Some(self.players.remove(idx))
    }

    /// Get a player by id.
    pub fn get(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id() == id)
    }

    /// Get a player mutably by id.
    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut PlayerState> {
        self.players.iter_mut().find(|p| p.id() == id)
    }

    /// Whether a player with this id exists.
    pub fn contains(&self, id: PlayerId) -> bool {
        self.get(id).is_some()
    }

    /// Iterate in join order.
    pub fn iter(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.iter()
    }

    /// Iterate mutably in join order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerState> {
        self.players.iter_mut()
    }

    /// Player ids in join order.
    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|p| p.id()).collect()
    }

    /// Number of players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Number of players still standing.
    pub fn alive_count(&self) -> usize {
        self.players.iter().filter(|p| p.record.alive).count()
    }

    /// First player still standing, in join order.
    pub fn first_alive(&self) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.record.alive)
    }

    /// Whether at least `min_players` are present and all are ready.
    pub fn all_ready(&self, min_players: usize) -> bool {
        self.players.len() >= min_players.max(1)
            && self.players.iter().all(|p| p.record.ready)
    }

    /// Apply a record received from its owner.
    pub fn apply_record(&mut self, record: PlayerRecord) -> RecordApply {
        match self.get_mut(record.id) {
            Some(existing) => {
                if record.generation <= existing.record.generation {
                    return RecordApply::Stale;
                }
                let was_alive = existing.record.alive;
                existing.record = record;
                RecordApply::Updated { was_alive }
            }
            None => {
                self.players.push(PlayerState::mirrored(record));
                RecordApply::Inserted
            }
        }
    }

    /// Drop every player.
    pub fn clear(&mut self) {
        self.players.clear();
    }
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// Replicated phase change, produced only by the match authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    /// Generation after this update
    pub generation: u64,
    /// New phase
    pub phase: MatchPhase,
}

/// Authoritative match state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchState {
    /// Current phase
    pub phase: MatchPhase,
    /// Bumped on every authoritative write
    pub generation: u64,
}

impl MatchState {
    /// Fresh state in the lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the update that moves this state to `phase`.
    pub fn next_update(&self, phase: MatchPhase) -> PhaseUpdate {
        PhaseUpdate {
            generation: self.generation + 1,
            phase,
        }
    }

    /// Apply an update. Returns the previous phase when the update was newer.
    pub fn apply(&mut self, update: &PhaseUpdate) -> Option<MatchPhase> {
        if update.generation <= self.generation {
            return None;
        }
        let previous = self.phase;
        self.phase = update.phase;
        self.generation = update.generation;
        Some(previous)
    }

    /// Adopt a full snapshot if it is newer than what we hold.
    pub fn sync(&mut self, snapshot: &MatchState) -> bool {
        if snapshot.generation <= self.generation {
            return false;
        }
        *self = snapshot.clone();
        true
    }

    /// Hash phase and every replicated player field.
    ///
    /// Peers that applied the same envelopes produce the same hash. Records
    /// are hashed in id order since join order differs between peers.
    pub fn compute_hash(&self, players: &PlayerRegistry) -> StateHash {
        let mut records: Vec<&PlayerRecord> = players.iter().map(|p| &p.record).collect();
        records.sort_by_key(|r| r.id);
        compute_state_hash(self.generation, |hasher| {
            hasher.update_u8(self.phase.as_u8());
            for r in records {
                hasher.update_u32(r.id.0);
                hasher.update_u32(r.owner.0);
                hasher.update_u8(r.score);
                hasher.update_u8(r.lives);
                hasher.update_u8(r.health);
                hasher.update_bool(r.ready);
                hasher.update_bool(r.alive);
                hasher.update_u64(r.generation);
            }
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32) -> PlayerRecord {
        PlayerRecord::new(PlayerId(id), PeerId(id), 3, 100)
    }

    #[test]
    fn test_phase_edges() {
        use MatchPhase::*;
        assert!(Lobby.can_transition_to(Transition));
        assert!(Transition.can_transition_to(Level));
        assert!(Level.can_transition_to(Transition));
        assert!(Transition.can_transition_to(Lobby));

        assert!(!Lobby.can_transition_to(Level));
        assert!(!Level.can_transition_to(Lobby));
        assert!(!Lobby.can_transition_to(Lobby));
    }

    #[test]
    fn test_registry_keeps_join_order_and_unique_ids() {
        let mut registry = PlayerRegistry::new();
        for id in [5, 1, 9] {
            assert!(registry.insert(PlayerState::mirrored(record(id))));
        }
        assert!(!registry.insert(PlayerState::mirrored(record(1))));

        assert_eq!(registry.ids(), vec![PlayerId(5), PlayerId(1), PlayerId(9)]);

        registry.remove(PlayerId(1));
        assert_eq!(registry.ids(), vec![PlayerId(5), PlayerId(9)]);
        assert!(registry.remove(PlayerId(1)).is_none());
    }

    #[test]
    fn test_alive_count_and_first_alive() {
        let mut registry = PlayerRegistry::new();
        for id in 0..3 {
            registry.insert(PlayerState::mirrored(record(id)));
        }
        registry.get_mut(PlayerId(0)).unwrap().record.alive = false;

        assert_eq!(registry.alive_count(), 2);
        assert_eq!(registry.first_alive().unwrap().id(), PlayerId(1));
    }

    #[test]
    fn test_all_ready_respects_minimum() {
        let mut registry = PlayerRegistry::new();
        registry.insert(PlayerState::mirrored(record(0)));
        registry.get_mut(PlayerId(0)).unwrap().record.ready = true;

        assert!(registry.all_ready(1));
        assert!(!registry.all_ready(2));
        assert!(!PlayerRegistry::new().all_ready(0));
    }

    #[test]
    fn test_apply_record_ignores_stale_generation() {
        let mut registry = PlayerRegistry::new();
        assert_eq!(registry.apply_record(record(1)), RecordApply::Inserted);

        let mut newer = record(1);
        newer.generation = 2;
        newer.score = 1;
        newer.alive = false;
        assert_eq!(registry.apply_record(newer.clone()), RecordApply::Updated { was_alive: true });

        // Same generation again is a duplicate
        assert_eq!(registry.apply_record(newer), RecordApply::Stale);
        assert_eq!(registry.get(PlayerId(1)).unwrap().record.score, 1);
    }

    #[test]
    fn test_match_state_apply_and_sync() {
        let mut state = MatchState::new();
        let update = state.next_update(MatchPhase::Transition);

        assert_eq!(state.apply(&update), Some(MatchPhase::Lobby));
        assert_eq!(state.apply(&update), None);
        assert_eq!(state.phase, MatchPhase::Transition);

        let mut replica = MatchState::new();
        assert!(replica.sync(&state));
        assert!(!replica.sync(&MatchState::new()));
        assert_eq!(replica, state);
    }

    #[test]
    fn test_hash_tracks_replicated_fields() {
        let state = MatchState::new();
        let mut a = PlayerRegistry::new();
        let mut b = PlayerRegistry::new();
        a.insert(PlayerState::mirrored(record(1)));
        b.insert(PlayerState::mirrored(record(1)));
        assert_eq!(state.compute_hash(&a), state.compute_hash(&b));

        b.get_mut(PlayerId(1)).unwrap().record.score = 2;
        assert_ne!(state.compute_hash(&a), state.compute_hash(&b));
    }
}
