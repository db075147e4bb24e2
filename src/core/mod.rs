//! Core deterministic primitives.
//!
//! Values here cross the wire or are compared between peers, so they avoid
//! floats and unordered containers.

pub mod fixed;
pub mod vec2;
pub mod rng;
pub mod hash;

// Re-export core types
pub use fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use vec2::{FixedVec2, Transform};
pub use rng::DeterministicRng;
pub use hash::{compute_state_hash, StateHash};
