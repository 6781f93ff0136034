//! Network Layer
//!
//! WebSocket transport in front of the round engine.
//! Holds no game state; every request goes through the engine handle.

pub mod protocol;
pub mod server;

pub use protocol::{
    BetRequest, BinaryRequest, ClientMessage, ErrorCode, JoinRequest, RoundInfo,
    RoundSummary, ServerError, ServerMessage,
};
pub use server::{GameServer, ServerConfig, GameServerError};
