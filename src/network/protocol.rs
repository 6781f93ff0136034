//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Text frames carry JSON messages. Binary frames carry the flat
//! [`BinaryRequest`] struct encoded with bincode.
//!
//! Money and multipliers are decimals on the wire and fixed-point
//! everywhere else. Conversion happens here.

use serde::{Serialize, Deserialize};

use crate::core::fixed::{Amount, Multiplier};
use crate::game::engine::{EngineError, JoinInfo};
use crate::game::events::{RoundEvent, RoundEventData};
use crate::game::ledger::{BetError, CashOutReceipt};
use crate::game::round::RoundSnapshot;
use crate::game::state::{RoundPhase, RoundRecord};

/// Default number of rounds returned by a history request.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a player id.
    Join(JoinRequest),

    /// Bet on the current round.
    PlaceBet(BetRequest),

    /// Cash out the current bet.
    CashOut,

    /// Recent finished rounds.
    History {
        /// Maximum number of rounds.
        #[serde(default = "default_history_limit")]
        limit: usize,
    },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Player is leaving.
    Leave,
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Player's UUID string.
    pub player_id: String,
}

/// Bet request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRequest {
    /// Stake as a decimal (e.g. `12.50`).
    pub amount: f64,
    /// Optional automatic cash-out multiplier (e.g. `2.0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_cash_out: Option<f64>,
}

impl BetRequest {
    /// Stake in minor units.
    pub fn amount(&self) -> Result<Amount, BetError> {
        Amount::from_decimal(self.amount).ok_or(BetError::InvalidAmount)
    }

    /// Auto cash-out target, if any.
    pub fn auto_cash_out(&self) -> Result<Option<Multiplier>, BetError> {
        match self.auto_cash_out {
            None => Ok(None),
            Some(value) => Multiplier::from_f64(value).map(Some).ok_or(BetError::InvalidAmount),
        }
    }
}

/// Flat binary request.
///
/// bincode cannot decode internally tagged enums, so binary clients send
/// this struct and select the operation with `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRequest {
    /// Operation code.
    pub op: u8,
    /// Stake in minor units (`OP_PLACE_BET`) or client timestamp (`OP_PING`).
    pub value: u64,
    /// Auto cash-out target in hundredths, 0 for none (`OP_PLACE_BET`).
    pub auto_cash_out: u64,
}

impl BinaryRequest {
    /// Place a bet.
    pub const OP_PLACE_BET: u8 = 1;
    /// Cash out.
    pub const OP_CASH_OUT: u8 = 2;
    /// Ping.
    pub const OP_PING: u8 = 3;

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Convert to the equivalent client message.
    pub fn to_client_message(&self) -> Option<ClientMessage> {
        match self.op {
            Self::OP_PLACE_BET => Some(ClientMessage::PlaceBet(BetRequest {
                amount: Amount(self.value).to_decimal(),
                auto_cash_out: (self.auto_cash_out > 0)
                    .then(|| Multiplier::from_hundredths(self.auto_cash_out).to_f64()),
            })),
            Self::OP_CASH_OUT => Some(ClientMessage::CashOut),
            Self::OP_PING => Some(ClientMessage::Ping { timestamp: self.value }),
            _ => None,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted.
    Joined(JoinedInfo),

    /// Bet accepted.
    BetAccepted { balance: f64 },

    /// Reply to this connection's cash-out.
    CashedOutResult {
        balance: f64,
        multiplier: f64,
        payout: f64,
    },

    /// Reply to a history request.
    History { rounds: Vec<RoundSummary> },

    /// New round with its seed commitment.
    RoundCreated {
        round_id: String,
        commitment: String,
        house_edge_bps: u32,
    },

    /// Countdown seconds. `None` means the round is starting at 1.00x.
    Countdown { seconds: Option<u32> },

    /// Live multiplier.
    Multiplier { value: f64 },

    /// Round crashed. Seed revealed.
    Crash {
        multiplier: f64,
        round_id: String,
        seed: String,
        commitment: String,
    },

    /// Someone placed a bet.
    BetPlaced {
        player_id: String,
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_cash_out: Option<f64>,
    },

    /// Someone cashed out.
    CashedOut {
        player_id: String,
        multiplier: f64,
        payout: f64,
    },

    /// A stake was refunded.
    Refunded { player_id: String, amount: f64 },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Join reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedInfo {
    /// Player id as bound to this connection.
    pub player_id: String,
    /// Current balance.
    pub balance: f64,
    /// Current round.
    pub round: RoundInfo,
    /// Server version.
    pub server_version: String,
}

/// Public round view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundInfo {
    /// Round identifier.
    pub round_id: String,
    /// Current phase.
    pub phase: RoundPhase,
    /// Seed commitment (hex).
    pub commitment: String,
    /// House edge in basis points.
    pub house_edge_bps: u32,
    /// Official or final multiplier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Countdown seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u32>,
}

impl From<&RoundSnapshot> for RoundInfo {
    fn from(snapshot: &RoundSnapshot) -> Self {
        Self {
            round_id: snapshot.round_id.to_uuid_string(),
            phase: snapshot.phase,
            commitment: hex::encode(snapshot.commitment),
            house_edge_bps: snapshot.house_edge_bps,
            multiplier: snapshot.multiplier.map(Multiplier::to_f64),
            countdown: snapshot.countdown,
        }
    }
}

/// Finished round, with everything needed to verify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    /// Round identifier.
    pub round_id: String,
    /// Crash point.
    pub crash_point: f64,
    /// Revealed seed (hex).
    pub seed: String,
    /// Seed commitment (hex).
    pub commitment: String,
    /// House edge in basis points.
    pub house_edge_bps: u32,
    /// Number of bets.
    pub bets: u32,
    /// Total staked.
    pub total_staked: f64,
    /// Total paid out.
    pub total_paid: f64,
}

impl From<&RoundRecord> for RoundSummary {
    fn from(record: &RoundRecord) -> Self {
        Self {
            round_id: record.round_id.to_uuid_string(),
            crash_point: record.crash_point.to_f64(),
            seed: hex::encode(record.seed),
            commitment: hex::encode(record.commitment),
            house_edge_bps: record.house_edge_bps,
            bets: record.bets.len() as u32,
            total_staked: record.total_staked().to_decimal(),
            total_paid: record.total_paid().to_decimal(),
        }
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed message.
    InvalidInput,
    /// Request needs a prior join.
    NotJoined,
    /// Stake or auto target invalid.
    InvalidAmount,
    /// Stake exceeds balance.
    InsufficientBalance,
    /// Already bet this round.
    AlreadyBet,
    /// No bet to cash out.
    NoActiveBet,
    /// Bet already cashed out.
    AlreadyCashedOut,
    /// Round is not running.
    RoundNotRunning,
    /// Betting is closed for this round.
    BettingClosed,
    /// Server overloaded.
    ServerOverloaded,
    /// Engine is not running.
    Unavailable,
    /// Internal error.
    InternalError,
}

impl From<&BetError> for ErrorCode {
    fn from(err: &BetError) -> Self {
        match err {
            BetError::InvalidAmount => ErrorCode::InvalidAmount,
            BetError::InsufficientBalance => ErrorCode::InsufficientBalance,
            BetError::AlreadyBet => ErrorCode::AlreadyBet,
            BetError::NoActiveBet => ErrorCode::NoActiveBet,
            BetError::AlreadyCashedOut => ErrorCode::AlreadyCashedOut,
            BetError::RoundNotRunning => ErrorCode::RoundNotRunning,
            BetError::BettingClosed => ErrorCode::BettingClosed,
            BetError::InternalLedgerInconsistency(_) => ErrorCode::InternalError,
        }
    }
}

impl From<&EngineError> for ErrorCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Rejected(err) => err.into(),
            EngineError::Stopped | EngineError::Halted(_) => ErrorCode::Unavailable,
            EngineError::Config(_) => ErrorCode::InternalError,
        }
    }
}

// =============================================================================
// CONVERSIONS
// =============================================================================

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }

    /// Error reply for a failed engine request.
    ///
    /// Internal details of a halted engine are not sent to clients.
    pub fn from_engine_error(err: &EngineError) -> Self {
        let message = match err {
            EngineError::Rejected(err) => err.to_string(),
            _ => "service unavailable".to_string(),
        };
        Self::error(err.into(), message)
    }

    /// Join reply.
    pub fn joined(player_id: String, info: &JoinInfo, server_version: &str) -> Self {
        ServerMessage::Joined(JoinedInfo {
            player_id,
            balance: info.balance.to_decimal(),
            round: RoundInfo::from(&info.round),
            server_version: server_version.to_string(),
        })
    }

    /// Cash-out reply.
    pub fn cashed_out_result(receipt: &CashOutReceipt) -> Self {
        ServerMessage::CashedOutResult {
            balance: receipt.balance.to_decimal(),
            multiplier: receipt.multiplier.to_f64(),
            payout: receipt.payout.to_decimal(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<&RoundEvent> for ServerMessage {
    fn from(event: &RoundEvent) -> Self {
        match &event.data {
            RoundEventData::RoundCreated { commitment, house_edge_bps } => ServerMessage::RoundCreated {
                round_id: event.round_id.to_uuid_string(),
                commitment: hex::encode(commitment),
                house_edge_bps: *house_edge_bps,
            },
            RoundEventData::Countdown { seconds } => ServerMessage::Countdown { seconds: *seconds },
            RoundEventData::Multiplier { value } => ServerMessage::Multiplier { value: value.to_f64() },
            RoundEventData::BetPlaced { player_id, amount, auto_cash_out } => ServerMessage::BetPlaced {
                player_id: player_id.to_uuid_string(),
                amount: amount.to_decimal(),
                auto_cash_out: auto_cash_out.map(Multiplier::to_f64),
            },
            RoundEventData::CashedOut { player_id, multiplier, payout, .. } => ServerMessage::CashedOut {
                player_id: player_id.to_uuid_string(),
                multiplier: multiplier.to_f64(),
                payout: payout.to_decimal(),
            },
            RoundEventData::Crashed { crash_point, seed, commitment } => ServerMessage::Crash {
                multiplier: crash_point.to_f64(),
                round_id: event.round_id.to_uuid_string(),
                seed: hex::encode(seed),
                commitment: hex::encode(commitment),
            },
            RoundEventData::Refunded { player_id, amount } => ServerMessage::Refunded {
                player_id: player_id.to_uuid_string(),
                amount: amount.to_decimal(),
            },
            RoundEventData::Shutdown { reason } => ServerMessage::Shutdown { reason: reason.clone() },
        }
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
