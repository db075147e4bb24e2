//! Match Coordination Module
//!
//! Everything that decides what phase the match is in and moves players
//! between levels. Transport-agnostic; driven by ticks and applied calls.
//!
//! ## Module Structure
//!
//! - `state`: Ids, match phase, player records, the player registry
//! - `entity`: Entity bridge seam and the in-memory ledger
//! - `level`: Lobby and gameplay level layouts
//! - `timer`: Tick-keyed deferred actions
//! - `sequencer`: Timed level transition steps
//! - `machine`: The match state machine
//! - `world`: Peer-local world and write permissions
//! - `events`: Presentation events

pub mod state;
pub mod entity;
pub mod level;
pub mod timer;
pub mod sequencer;
pub mod machine;
pub mod world;
pub mod events;

// Re-export key types
pub use state::{MatchPhase, MatchState, PeerId, PlayerId, PlayerRecord, PlayerRegistry, PlayerState};
pub use entity::{EntityBridge, EntityHandle, EntityKind, EntityLedger};
pub use level::{Level, LevelSet, LevelTarget};
pub use sequencer::{LevelTransitionSequencer, Milestone, TransitionPlan, TransitionTimings};
pub use machine::{AuthorityClaim, BroadcastCall, MatchCall, MatchConfig, MatchError, MatchOutput, MatchStateMachine};
pub use world::{Authority, World};
pub use events::{GameEvent, GameEventData};
