//! # Arena Sync
//!
//! Match coordination for small multiplayer arenas: joining a session,
//! electing the peer that owns match state, and moving every peer through
//! lobby, level and transition phases in the same order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ARENA SYNC                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── fixed.rs    - Q16.16 fixed-point arithmetic             │
//! │  ├── vec2.rs     - Fixed-point vectors and transforms        │
//! │  ├── rng.rs      - Xorshift128+ level selection              │
//! │  └── hash.rs     - State hashing for convergence checks      │
//! │                                                              │
//! │  game/           - Match rules (transport-agnostic)          │
//! │  ├── state.rs    - Phases, player records, registry          │
//! │  ├── machine.rs  - Match state machine                       │
//! │  ├── sequencer.rs- Timed level transitions                   │
//! │  ├── level.rs    - Lobby and gameplay levels                 │
//! │  ├── entity.rs   - Entity spawn/despawn seam                 │
//! │  └── events.rs   - Presentation events                       │
//! │                                                              │
//! │  network/        - Sessions and replication                  │
//! │  ├── session.rs  - Session connector                         │
//! │  ├── peer.rs     - Per-process runtime                       │
//! │  ├── protocol.rs - Envelopes and payloads                    │
//! │  └── transport.rs- Substrate trait and loopback hub          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! Decisions are taken only by the match authority and reach every peer,
//! the authority included, through the same ordered channel. Each peer
//! applies them exactly once and advances its own transition steps by
//! ticks, so all peers observe the same phase sequence.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod config;

// Re-export commonly used types
pub use config::ArenaConfig;
pub use game::machine::{MatchConfig, MatchStateMachine};
pub use game::state::{MatchPhase, PeerId, PlayerId};
pub use network::peer::Peer;
pub use network::protocol::{GameMode, ShutdownReason};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;
