//! Peer-local world: the mirrored player registry, the level set, the
//! entity bridge, and what this peer is allowed to write.

use crate::game::entity::EntityBridge;
use crate::game::level::LevelSet;
use crate::game::state::{PeerId, PlayerId, PlayerRegistry};

/// Write permissions of the local peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Authority {
    /// This peer's transport id
    pub local_peer: PeerId,
    /// Whether this peer holds the match authority
    pub owns_match: bool,
}

/// Everything the coordination layer mutates on one peer.
pub struct World {
    /// Mirrored players
    pub players: PlayerRegistry,
    /// Lobby and gameplay levels
    pub levels: LevelSet,
    /// Entity spawner
    pub bridge: Box<dyn EntityBridge>,
    /// Local write permissions
    pub authority: Authority,
}

impl World {
    /// Create an empty world.
    pub fn new(levels: LevelSet, bridge: Box<dyn EntityBridge>) -> Self {
        Self {
            players: PlayerRegistry::new(),
            levels,
            bridge,
            authority: Authority::default(),
        }
    }

    /// Whether this peer may write the given player's record.
    pub fn owns_record(&self, id: PlayerId) -> bool {
        self.players
            .get(id)
            .map(|p| p.record.owner == self.authority.local_peer)
            .unwrap_or(false)
    }

    /// Ids of every record this peer may write, in join order.
    pub fn owned_records(&self) -> Vec<PlayerId> {
        let local = self.authority.local_peer;
        self.players
            .iter()
            .filter(|p| p.record.owner == local)
            .map(|p| p.id())
            .collect()
    }

    /// Despawn every live entity and forget all players.
    pub fn clear_entities(&mut self) {
        for handle in self.bridge.live_entities() {
            self.bridge.despawn(handle);
        }
        self.players.clear();
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("players", &self.players)
            .field("levels", &self.levels)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}
