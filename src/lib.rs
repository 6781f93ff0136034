//! # Crash Round Engine
//!
//! Authoritative round engine for a multiplayer crash betting game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH ENGINE                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                               │
//! │  ├── fixed.rs    - Integer money and multipliers            │
//! │  ├── hash.rs     - Domain-separated SHA-256                 │
//! │  └── clock.rs    - Injectable monotonic clock               │
//! │                                                             │
//! │  proof/          - Provable fairness                        │
//! │  ├── sampler.rs  - Seed draw and crash point derivation     │
//! │  └── commitment.rs - Seed commitment and verification       │
//! │                                                             │
//! │  game/           - Round engine                             │
//! │  ├── curve.rs    - Elapsed time to multiplier               │
//! │  ├── ledger.rs   - Balances, bets, settlement               │
//! │  ├── round.rs    - Round state machine                      │
//! │  ├── engine.rs   - Single-writer actor                      │
//! │  └── events.rs   - Round events                             │
//! │                                                             │
//! │  network/        - WebSocket transport                      │
//! │  ├── server.rs   - Connection handling                      │
//! │  └── protocol.rs - Message types                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Settlement Guarantees
//!
//! - One actor task owns every balance and bet. Requests are serialized
//!   through its command queue.
//! - Cash-outs settle at the last broadcast multiplier, never at a value
//!   chosen by the client.
//! - Each bet leaves `Active` exactly once: cashed out, lost, or refunded.
//! - All settlement arithmetic is integer-only and checked.
//!
//! The crash point of every round is fixed by a committed seed before the
//! first bet is accepted, and the seed is revealed when the round crashes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod proof;

// Re-export commonly used types
pub use core::fixed::{Amount, Multiplier, MINOR_UNITS, MULTIPLIER_SCALE};
pub use core::clock::{Clock, ManualClock, TokioClock};
pub use game::{BetError, EngineConfig, EngineHandle, PlayerId, RoundEngine, RoundEvent};
pub use proof::{CrashSampler, SeedReveal};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
