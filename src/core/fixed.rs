//! Q16.16 Fixed-Point Values
//!
//! Spawn points and entity transforms travel over the wire and are compared
//! across peers, so they are stored as integers rather than floats.
//!
//! ```text
//! [S][IIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]
//!     15 bits int        16 bits fraction
//! ```

/// Q16.16 fixed-point number stored as i32.
pub type Fixed = i32;

/// Number of fractional bits (16)
pub const FIXED_SCALE: i32 = 16;

/// 1.0 in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE;

/// 0.5 in fixed-point (32768)
pub const FIXED_HALF: Fixed = FIXED_ONE >> 1;

/// A full turn in fixed-point degrees (360.0)
pub const FULL_TURN: Fixed = 360 << FIXED_SCALE;

/// Convert a compile-time float to fixed-point.
///
/// # Example
/// ```
/// use arena_sync::core::fixed::{to_fixed, FIXED_ONE};
/// const HEADING: i32 = to_fixed(2.5);
/// assert_eq!(HEADING, FIXED_ONE * 2 + FIXED_ONE / 2);
/// ```
#[inline]
pub const fn to_fixed(f: f64) -> Fixed {
    (f * (FIXED_ONE as f64)) as Fixed
}

/// Convert fixed-point to float for display/rendering.
#[inline]
pub fn to_float(f: Fixed) -> f32 {
    f as f32 / FIXED_ONE as f32
}

/// Wrap a heading in fixed-point degrees into `[0, 360)`.
#[inline]
pub fn wrap_heading(degrees: Fixed) -> Fixed {
    degrees.rem_euclid(FULL_TURN)
}
