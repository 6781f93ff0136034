//! Round and Bet State
//!
//! Data model for rounds, bets and archived round records.
//! Uses BTreeMap-friendly `Ord` ids so iteration order is stable.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::fixed::{Amount, Multiplier};
use crate::core::hash::HashOutput;
use crate::proof::commitment::SeedReveal;
use crate::proof::sampler::{FairDraw, Seed};

// =============================================================================
// IDS
// =============================================================================

/// Unique player identifier (UUID as bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

/// Unique round identifier (UUID v4 as bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundId(pub [u8; 16]);

impl RoundId {
    /// Generate a fresh random id.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// Public round phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Accepting bets, counting down to start.
    Countdown,
    /// Multiplier is rising.
    Running,
    /// Round has ended at its crash point.
    Crashed,
}

/// A single betting round.
///
/// The crash point and seed are private; they leave this struct only
/// through [`Round::reveal`] once the round has crashed.
#[derive(Clone, Debug)]
pub struct Round {
    /// Round identifier.
    pub id: RoundId,
    /// Current phase.
    pub phase: RoundPhase,
    /// Seed commitment, public from creation.
    pub commitment: HashOutput,
    /// House edge used for the crash point.
    pub house_edge_bps: u32,
    /// When the round was created.
    pub created_at: DateTime<Utc>,
    /// When the multiplier started rising.
    pub started_at: Option<DateTime<Utc>>,
    /// When the round crashed.
    pub crashed_at: Option<DateTime<Utc>>,
    seed: Seed,
    crash_point: Multiplier,
}

impl Round {
    /// Create a round in `Countdown` from a fair draw.
    pub fn new(id: RoundId, draw: FairDraw) -> Self {
        Self {
            id,
            phase: RoundPhase::Countdown,
            commitment: draw.commitment,
            house_edge_bps: draw.house_edge_bps,
            created_at: Utc::now(),
            started_at: None,
            crashed_at: None,
            seed: draw.seed,
            crash_point: draw.crash_point.max(Multiplier::ONE),
        }
    }

    /// Crash point, for the engine only.
    pub(crate) fn crash_point(&self) -> Multiplier {
        self.crash_point
    }

    /// Seed and crash point, available once the round has crashed.
    pub fn reveal(&self) -> Option<SeedReveal> {
        if self.phase != RoundPhase::Crashed {
            return None;
        }
        Some(SeedReveal {
            commitment: self.commitment,
            seed: self.seed,
            house_edge_bps: self.house_edge_bps,
            crash_point: self.crash_point,
        })
    }
}

// =============================================================================
// BET
// =============================================================================

/// Settlement status of a bet. A bet leaves `Active` exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Stake is riding on the multiplier.
    Active,
    /// Cashed out before the crash.
    CashedOut {
        /// Multiplier locked in.
        multiplier: Multiplier,
        /// Amount credited.
        payout: Amount,
    },
    /// Still riding when the round crashed.
    Lost,
    /// Stake returned because the round never reached a crash.
    Refunded,
}

/// A player's bet on one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    /// Player who placed the bet.
    pub player_id: PlayerId,
    /// Round the bet belongs to.
    pub round_id: RoundId,
    /// Stake debited at placement.
    pub amount: Amount,
    /// Optional automatic cash-out target.
    pub auto_cash_out: Option<Multiplier>,
    /// Placement time.
    pub placed_at: DateTime<Utc>,
    /// Settlement status.
    pub status: BetStatus,
}

impl Bet {
    /// Is the bet still riding?
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.status, BetStatus::Active)
    }

    /// Multiplier the bet was cashed out at, if any.
    pub fn cash_out_multiplier(&self) -> Option<Multiplier> {
        match self.status {
            BetStatus::CashedOut { multiplier, .. } => Some(multiplier),
            _ => None,
        }
    }

    /// Amount credited back to the player by settlement.
    pub fn payout(&self) -> Amount {
        match self.status {
            BetStatus::CashedOut { payout, .. } => payout,
            BetStatus::Refunded => self.amount,
            BetStatus::Active | BetStatus::Lost => Amount::ZERO,
        }
    }
}

// =============================================================================
// ARCHIVE
// =============================================================================

/// Immutable record of a finished round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round identifier.
    pub round_id: RoundId,
    /// Published commitment.
    pub commitment: HashOutput,
    /// Revealed seed.
    pub seed: Seed,
    /// House edge used.
    pub house_edge_bps: u32,
    /// Crash point.
    pub crash_point: Multiplier,
    /// When the multiplier started rising.
    pub started_at: Option<DateTime<Utc>>,
    /// When the round crashed.
    pub crashed_at: Option<DateTime<Utc>>,
    /// Settled bets.
    pub bets: Vec<Bet>,
}

impl RoundRecord {
    /// Build a record from a crashed round and its settled bets.
    pub fn new(round: &Round, bets: Vec<Bet>) -> Self {
        Self {
            round_id: round.id,
            commitment: round.commitment,
            seed: round.seed,
            house_edge_bps: round.house_edge_bps,
            crash_point: round.crash_point,
            started_at: round.started_at,
            crashed_at: round.crashed_at,
            bets,
        }
    }

    /// Total staked on the round.
    pub fn total_staked(&self) -> Amount {
        Amount(self.bets.iter().map(|b| b.amount.0).sum())
    }

    /// Total credited back to players.
    pub fn total_paid(&self) -> Amount {
        Amount(self.bets.iter().map(|b| b.payout().0).sum())
    }

    /// Serialize to binary for archival storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
