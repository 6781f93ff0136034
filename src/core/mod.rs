//! Core primitives.
//!
//! Integer money and multiplier types, hashing, and the injectable clock.
//! Nothing in this module knows about rounds or players.

pub mod fixed;
pub mod hash;
pub mod clock;

// Re-export core types
pub use fixed::{Amount, Multiplier, MINOR_UNITS, MULTIPLIER_SCALE};
pub use hash::{HashOutput, hash_with_domain};
pub use clock::{Clock, ManualClock, Millis, TokioClock};
