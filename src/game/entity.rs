//! Entity Bridge
//!
//! The seam between match coordination and whatever owns the actual world
//! objects (a game engine, a simulation, or the in-memory ledger below).
//! Coordination code only ever spawns, despawns and enumerates through
//! [`EntityBridge`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Serialize, Deserialize};

use crate::core::vec2::Transform;
use crate::game::state::{PeerId, PlayerId};

/// Opaque handle to a spawned entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityHandle(pub u64);

impl std::fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// What kind of entity to spawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    /// The singleton match authority object
    MatchAuthority,
    /// A player's persistent entity
    Player(PlayerId),
    /// A player's in-level avatar
    Avatar(PlayerId),
    /// A networked object belonging to a level
    LevelObject {
        /// Level index
        level: usize,
        /// Slot within the level layout
        slot: usize,
    },
}

/// Spawns and despawns world entities.
pub trait EntityBridge: Send {
    /// Spawn an entity and return its handle.
    fn spawn(&mut self, kind: EntityKind, transform: Transform, owner: PeerId) -> EntityHandle;

    /// Despawn an entity. Returns false if the handle was not live.
    fn despawn(&mut self, handle: EntityHandle) -> bool;

    /// Handles of every live entity, in spawn order.
    fn live_entities(&self) -> Vec<EntityHandle>;

    /// Release pooled objects held for reuse. No-op by default.
    fn clear_pools(&mut self) {}
}

// =============================================================================
// IN-MEMORY LEDGER
// =============================================================================

/// A recorded bridge operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEntry {
    /// An entity was spawned
    Spawned {
        /// Assigned handle
        handle: EntityHandle,
        /// Entity kind
        kind: EntityKind,
        /// Spawn transform
        transform: Transform,
        /// Owning peer
        owner: PeerId,
    },
    /// An entity was despawned
    Despawned {
        /// Released handle
        handle: EntityHandle,
        /// Entity kind
        kind: EntityKind,
    },
    /// Pools were cleared
    PoolsCleared,
}

#[derive(Debug, Default)]
struct LedgerInner {
    next_handle: u64,
    live: BTreeMap<EntityHandle, (EntityKind, Transform, PeerId)>,
    log: Vec<LedgerEntry>,
}

/// In-memory [`EntityBridge`] that records every operation.
///
/// Clones share the same ledger, so a test can keep one clone for
/// inspection while the peer owns another.
#[derive(Clone, Debug, Default)]
pub struct EntityLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl EntityLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Live entities matching a predicate on their kind.
    pub fn live_matching(&self, pred: impl Fn(&EntityKind) -> bool) -> Vec<(EntityHandle, EntityKind, Transform)> {
        self.inner
            .lock()
            .live
            .iter()
            .filter(|(_, (kind, _, _))| pred(kind))
            .map(|(handle, (kind, transform, _))| (*handle, *kind, *transform))
            .collect()
    }

    /// Whether a handle is live.
    pub fn is_live(&self, handle: EntityHandle) -> bool {
        self.inner.lock().live.contains_key(&handle)
    }

    /// Copy of the operation log.
    pub fn log(&self) -> Vec<LedgerEntry> {
        self.inner.lock().log.clone()
    }
}

impl EntityBridge for EntityLedger {
    fn spawn(&mut self, kind: EntityKind, transform: Transform, owner: PeerId) -> EntityHandle {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = EntityHandle(inner.next_handle);
        inner.live.insert(handle, (kind, transform, owner));
        inner.log.push(LedgerEntry::Spawned { handle, kind, transform, owner });
        handle
    }

    fn despawn(&mut self, handle: EntityHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.live.remove(&handle) {
            Some((kind, _, _)) => {
                inner.log.push(LedgerEntry::Despawned { handle, kind });
                true
            }
            None => false,
        }
    }

    fn live_entities(&self) -> Vec<EntityHandle> {
        self.inner.lock().live.keys().copied().collect()
    }

    fn clear_pools(&mut self) {
        self.inner.lock().log.push(LedgerEntry::PoolsCleared);
    }
}
