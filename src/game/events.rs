//! Round Events
//!
//! Events emitted by the round manager, in the order they happened.
//! The engine publishes them on a broadcast channel; the transport turns
//! them into push messages.

use serde::{Serialize, Deserialize};

use crate::core::clock::Millis;
use crate::core::fixed::{Amount, Multiplier};
use crate::core::hash::HashOutput;
use crate::game::state::{PlayerId, RoundId};
use crate::proof::sampler::Seed;

/// Round event data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoundEventData {
    /// A new round exists and its seed is committed.
    RoundCreated {
        commitment: HashOutput,
        house_edge_bps: u32,
    },

    /// Seconds left in the countdown. `None` means the countdown ended
    /// and the multiplier starts at 1.00.
    Countdown {
        seconds: Option<u32>,
    },

    /// Official multiplier for this tick.
    Multiplier {
        value: Multiplier,
    },

    /// A bet was accepted.
    BetPlaced {
        player_id: PlayerId,
        amount: Amount,
        auto_cash_out: Option<Multiplier>,
    },

    /// A bet was cashed out.
    CashedOut {
        player_id: PlayerId,
        multiplier: Multiplier,
        payout: Amount,
        auto: bool,
    },

    /// The round crashed. Seed is revealed.
    Crashed {
        crash_point: Multiplier,
        seed: Seed,
        commitment: HashOutput,
    },

    /// A stake was returned because the round never crashed.
    Refunded {
        player_id: PlayerId,
        amount: Amount,
    },

    /// The engine stopped.
    Shutdown {
        reason: String,
    },
}

/// A round event with its round and time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundEvent {
    /// Round the event belongs to.
    pub round_id: RoundId,
    /// Clock time when the event occurred.
    pub at: Millis,
    /// Event data.
    pub data: RoundEventData,
}

impl RoundEvent {
    /// Create a new event.
    pub fn new(round_id: RoundId, at: Millis, data: RoundEventData) -> Self {
        Self { round_id, at, data }
    }

    /// Is this a per-tick multiplier update?
    pub fn is_tick(&self) -> bool {
        matches!(self.data, RoundEventData::Multiplier { .. })
    }
}
