//! Fixed-Point Ground-Plane Vectors
//!
//! Levels are laid out on the ground plane; a spawn point is a position plus a
//! heading. Both are fixed-point so every peer resolves identical transforms.

use std::fmt;
use serde::{Serialize, Deserialize};

use super::fixed::{Fixed, FIXED_SCALE, to_float, wrap_heading};

/// 2D vector with fixed-point components (x = east, y = north).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FixedVec2 {
    /// X component (Q16.16 fixed-point)
    pub x: Fixed,
    /// Y component (Q16.16 fixed-point)
    pub y: Fixed,
}

impl FixedVec2 {
    /// Zero vector
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Create a vector from integer components.
    #[inline]
    pub const fn from_ints(x: i32, y: i32) -> Self {
        Self {
            x: x << FIXED_SCALE,
            y: y << FIXED_SCALE,
        }
    }

    /// Convert to floats (for display only).
    pub fn to_floats(self) -> (f32, f32) {
        (to_float(self.x), to_float(self.y))
    }
}

impl fmt::Debug for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.to_floats();
        write!(f, "FixedVec2({:.3}, {:.3})", x, y)
    }
}

impl fmt::Display for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.to_floats();
        write!(f, "({:.2}, {:.2})", x, y)
    }
}

/// Position and heading of a spawned entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Transform {
    /// Ground-plane position
    pub position: FixedVec2,
    /// Heading in fixed-point degrees, `[0, 360)`
    pub heading: Fixed,
}

impl Transform {
    /// Identity transform (origin, facing 0°).
    pub const IDENTITY: Self = Self { position: FixedVec2::ZERO, heading: 0 };

    /// Create a transform; the heading is wrapped into `[0, 360)`.
    pub fn new(position: FixedVec2, heading: Fixed) -> Self {
        Self { position, heading: wrap_heading(heading) }
    }

    /// Shortcut for integer coordinates and heading.
    pub fn at(x: i32, y: i32, heading_degrees: i32) -> Self {
        Self::new(FixedVec2::from_ints(x, y), heading_degrees << FIXED_SCALE)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:.1}°", self.position, to_float(self.heading))
    }
}
