//! Levels
//!
//! Spawn layouts for the lobby and each gameplay level, plus the networked
//! objects a level brings with it. Exactly one of them is active at a time.
//! Only the match authority spawns level objects; every peer tracks which
//! level is active and where players respawn.

use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::core::rng::DeterministicRng;
use crate::core::vec2::Transform;
use crate::game::entity::{EntityBridge, EntityHandle, EntityKind};
use crate::game::state::{PeerId, PlayerId};

/// Spawn slots per layout. Matches the maximum player count.
const SPAWN_SLOTS: i32 = 4;

/// Which layout a transition lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelTarget {
    /// The lobby
    Lobby,
    /// Gameplay level by index
    Level(usize),
}

impl std::fmt::Display for LevelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LevelTarget::Lobby => f.write_str("lobby"),
            LevelTarget::Level(idx) => write!(f, "level {}", idx),
        }
    }
}

/// A networked object placed when a level activates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelObjectSpec {
    /// Name for logs
    pub name: String,
    /// Placement
    pub transform: Transform,
}

/// One spawn layout.
#[derive(Clone, Debug)]
pub struct Level {
    target: LevelTarget,
    spawn_points: Vec<Transform>,
    objects: Vec<LevelObjectSpec>,
    active: bool,
    spawned: Vec<EntityHandle>,
}

impl Level {
    /// Create a layout.
    pub fn new(target: LevelTarget, spawn_points: Vec<Transform>, objects: Vec<LevelObjectSpec>) -> Self {
        Self {
            target,
            spawn_points,
            objects,
            active: false,
            spawned: Vec::new(),
        }
    }

    /// Which layout this is.
    pub fn target(&self) -> LevelTarget {
        self.target
    }

    /// Whether this layout is the active one.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Networked objects placed by this layout.
    pub fn objects(&self) -> &[LevelObjectSpec] {
        &self.objects
    }

    /// Handles spawned by this peer for this layout.
    pub fn spawned(&self) -> &[EntityHandle] {
        &self.spawned
    }

    /// Spawn point for a player, chosen by id.
    pub fn spawn_point(&self, player_id: PlayerId) -> Transform {
        if self.spawn_points.is_empty() {
            return Transform::IDENTITY;
        }
        self.spawn_points[player_id.0 as usize % self.spawn_points.len()]
    }

    fn activate(&mut self, bridge: &mut dyn EntityBridge, authority: Option<PeerId>) {
        self.active = true;
        let LevelTarget::Level(level) = self.target else {
            return;
        };
        let Some(owner) = authority else {
            return;
        };
        for (slot, object) in self.objects.iter().enumerate() {
            let handle = bridge.spawn(EntityKind::LevelObject { level, slot }, object.transform, owner);
            debug!(level, slot, object = %object.name, %handle, "Spawned level object");
            self.spawned.push(handle);
        }
    }

    fn deactivate(&mut self, bridge: &mut dyn EntityBridge) {
        self.active = false;
        for handle in self.spawned.drain(..) {
            bridge.despawn(handle);
        }
    }
}

/// The lobby plus every gameplay level.
#[derive(Clone, Debug)]
pub struct LevelSet {
    lobby: Level,
    levels: Vec<Level>,
    current: LevelTarget,
}

impl LevelSet {
    /// Build a set. The lobby starts active.
    pub fn new(lobby: Level, levels: Vec<Level>) -> Self {
        let mut set = Self {
            lobby,
            levels,
            current: LevelTarget::Lobby,
        };
        set.lobby.active = true;
        set
    }

    /// Standard arena layouts: a ring lobby and `count` levels with
    /// corner spawns and a few pickup pads each.
    pub fn standard(count: usize) -> Self {
        let lobby = Level::new(LevelTarget::Lobby, ring_spawns(12, 0), Vec::new());

        let levels = (0..count)
            .map(|idx| {
                let half = 20 + 5 * idx as i32;
                let spawns = vec![
                    Transform::at(-half, -half, 45),
                    Transform::at(half, half, 225),
                    Transform::at(half, -half, 135),
                    Transform::at(-half, half, 315),
                ];
                let objects = (0..=idx as i32 % 3)
                    .map(|n| LevelObjectSpec {
                        name: format!("pickup-pad-{}", n),
                        transform: Transform::at(n * 6 - 6, (idx as i32 % 2) * 8, 0),
                    })
                    .collect();
                Level::new(LevelTarget::Level(idx), spawns, objects)
            })
            .collect();

        Self::new(lobby, levels)
    }

    /// Number of gameplay levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Currently selected layout.
    pub fn current(&self) -> LevelTarget {
        self.current
    }

    /// Whether a target exists in this set.
    pub fn contains(&self, target: LevelTarget) -> bool {
        match target {
            LevelTarget::Lobby => true,
            LevelTarget::Level(idx) => idx < self.levels.len(),
        }
    }

    /// Look up a layout.
    pub fn get(&self, target: LevelTarget) -> Option<&Level> {
        match target {
            LevelTarget::Lobby => Some(&self.lobby),
            LevelTarget::Level(idx) => self.levels.get(idx),
        }
    }

    fn get_mut(&mut self, target: LevelTarget) -> Option<&mut Level> {
        match target {
            LevelTarget::Lobby => Some(&mut self.lobby),
            LevelTarget::Level(idx) => self.levels.get_mut(idx),
        }
    }

    /// Uniformly random gameplay level index. Zero when no levels exist.
    pub fn random_level_index(&self, rng: &mut DeterministicRng) -> usize {
        rng.next_int(self.levels.len() as u32) as usize
    }

    /// Deactivate the current layout, despawning whatever it placed.
    pub fn deactivate_current(&mut self, bridge: &mut dyn EntityBridge) {
        let current = self.current;
        if let Some(level) = self.get_mut(current) {
            level.deactivate(bridge);
        }
    }

    /// Make `target` the active layout.
    ///
    /// Level objects are spawned, owned by `authority`, only when one is
    /// given and never for the lobby. An unknown target falls back to the
    /// lobby.
    pub fn activate(&mut self, target: LevelTarget, bridge: &mut dyn EntityBridge, authority: Option<PeerId>) -> LevelTarget {
        let target = if self.contains(target) {
            target
        } else {
            warn!(requested = %target, "Unknown level, activating lobby");
            LevelTarget::Lobby
        };
        self.current = target;
        if let Some(level) = self.get_mut(target) {
            level.activate(bridge, authority);
        }
        target
    }

    /// Where a player should (re)spawn: the current layout if it is active,
    /// otherwise the lobby.
    pub fn spawn_point(&self, player_id: PlayerId) -> Transform {
        match self.get(self.current) {
            Some(level) if level.is_active() => level.spawn_point(player_id),
            _ => self.lobby.spawn_point(player_id),
        }
    }

    /// Drop back to the lobby after a session ends.
    pub fn return_to_lobby(&mut self, bridge: &mut dyn EntityBridge) {
        self.deactivate_current(bridge);
        for level in &mut self.levels {
            level.deactivate(bridge);
        }
        self.current = LevelTarget::Lobby;
        self.lobby.active = true;
    }
}

fn ring_spawns(radius: i32, start_heading: i32) -> Vec<Transform> {
    // Cardinal points of a ring, facing the centre
    let offsets = [(0, -1), (1, 0), (0, 1), (-1, 0)];
    offsets
        .iter()
        .take(SPAWN_SLOTS as usize)
        .enumerate()
        .map(|(i, (dx, dy))| Transform::at(dx * radius, dy * radius, start_heading + 90 * i as i32 + 180))
        .collect()
}
