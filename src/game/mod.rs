//! Round Engine Module
//!
//! Everything that decides who wins and who pays.
//!
//! ## Module Structure
//!
//! - `state`: Rounds, bets and archived round records
//! - `curve`: Elapsed time to multiplier
//! - `ledger`: Balances, bets and settlement
//! - `round`: Round lifecycle state machine
//! - `engine`: Single-writer actor around the state machine
//! - `events`: Round events pushed to subscribers
//! - `config`: Engine configuration

pub mod state;
pub mod curve;
pub mod ledger;
pub mod round;
pub mod engine;
pub mod events;
pub mod config;

// Re-export key types
pub use state::{Bet, BetStatus, PlayerId, Round, RoundId, RoundPhase, RoundRecord};
pub use curve::MultiplierCurve;
pub use ledger::{BetError, BetLedger, CashOutReceipt};
pub use round::{RoundManager, RoundSnapshot};
pub use engine::{EngineError, EngineHandle, JoinInfo, RoundEngine};
pub use events::{RoundEvent, RoundEventData};
pub use config::{ConfigError, EngineConfig};
