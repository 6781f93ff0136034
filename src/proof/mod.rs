//! Provable Fairness
//!
//! Every round's crash point is derived from a seed that is committed
//! before betting opens and revealed after the crash.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FAIRNESS                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  sampler.rs    - OS-seeded draw, seed -> crash point        │
//! │  commitment.rs - Seed commitment and reveal verification    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod sampler;
pub mod commitment;

// Re-export key types
pub use sampler::{CrashSampler, CrashSource, FairDraw, Seed, crash_point_from_seed};
pub use commitment::{SeedReveal, FairnessError, commit_seed};
