//! WebSocket Game Server
//!
//! Async WebSocket front end for the round engine.
//! Maps client requests onto [`EngineHandle`] calls and forwards round
//! events to every connection.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::game::config::{parse_var, ConfigError, MAX_PHASE_DURATION};
use crate::game::engine::{EngineError, EngineHandle};
use crate::game::state::PlayerId;
use crate::network::protocol::{
    BinaryRequest, ClientMessage, ErrorCode, RoundSummary, ServerMessage,
};

/// Upper bound on rounds returned by one history request.
const MAX_HISTORY_LIMIT: usize = 100;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close connections that send nothing for this long.
    pub idle_timeout: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CRASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = parse_var::<SocketAddr>(&lookup, "CRASH_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "CRASH_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CRASH_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange { field: "max_connections", reason: "must be positive" });
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::OutOfRange { field: "idle_timeout", reason: "must be positive" });
        }
        if self.idle_timeout > MAX_PHASE_DURATION {
            return Err(ConfigError::OutOfRange { field: "idle_timeout", reason: "longer than 24 hours" });
        }
        Ok(())
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Connected client state.
struct ConnectedClient {
    /// Player bound by `join`.
    player_id: Option<PlayerId>,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Round engine.
    engine: EngineHandle,
    /// Connected clients.
    clients: Clients,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server in front of a running engine.
    pub fn new(config: ServerConfig, engine: EngineHandle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            engine,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind to the configured address and run.
    pub async fn run(&self) -> Result<(), GameServerError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("{}, rejecting {}", GameServerError::ConnectionLimitReached, addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let engine = self.engine.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
            let mut events = engine.subscribe();

            // Register client
            clients.write().await.insert(addr, ConnectedClient {
                player_id: None,
            });

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut player: Option<PlayerId> = None;
            let mut deadline = Instant::now() + config.idle_timeout;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let client_msg = match msg {
                            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    let _ = msg_tx.send(ServerMessage::error(
                                        ErrorCode::InvalidInput,
                                        "Invalid message format",
                                    )).await;
                                    continue;
                                }
                            },
                            Some(Ok(Message::Binary(data))) => {
                                match BinaryRequest::from_bytes(&data).ok().and_then(|r| r.to_client_message()) {
                                    Some(m) => m,
                                    None => {
                                        debug!("Invalid binary message from {}", addr);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid binary request",
                                        )).await;
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        deadline = Instant::now() + config.idle_timeout;

                        if !Self::handle_client_message(addr, client_msg, &mut player, &clients, &engine, &config.version, &msg_tx).await {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => {
                                if msg_tx.send(ServerMessage::from(&event)).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("Client {} lagged, skipped {} events", addr, skipped);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = sleep_until(deadline) => {
                        info!("Client {} idle, closing", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued replies flush before closing.
            drop(msg_tx);
            let _ = sender_task.await;

            clients.write().await.remove(&addr);
            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message. Returns `false` when the connection should close.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        player: &mut Option<PlayerId>,
        clients: &Clients,
        engine: &EngineHandle,
        version: &str,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> bool {
        let reply = match msg {
            ClientMessage::Join(req) => {
                match PlayerId::from_uuid_str(&req.player_id) {
                    None => ServerMessage::error(ErrorCode::InvalidInput, "player_id must be a UUID"),
                    Some(id) if player.is_some_and(|p| p != id) => {
                        ServerMessage::error(ErrorCode::InvalidInput, "connection already joined")
                    }
                    Some(id) => match engine.join(id).await {
                        Ok(info) => {
                            *player = Some(id);
                            if let Some(client) = clients.write().await.get_mut(&addr) {
                                client.player_id = Some(id);
                            }
                            debug!("Client {} joined as {}", addr, id);
                            ServerMessage::joined(id.to_uuid_string(), &info, version)
                        }
                        Err(err) => ServerMessage::from_engine_error(&err),
                    },
                }
            }
            ClientMessage::PlaceBet(req) => match *player {
                None => Self::not_joined(),
                Some(id) => {
                    let result = match (req.amount(), req.auto_cash_out()) {
                        (Ok(amount), Ok(auto)) => engine.place_bet(id, amount, auto).await,
                        (Err(err), _) | (_, Err(err)) => Err(EngineError::Rejected(err)),
                    };
                    match result {
                        Ok(balance) => ServerMessage::BetAccepted { balance: balance.to_decimal() },
                        Err(err) => ServerMessage::from_engine_error(&err),
                    }
                }
            },
            ClientMessage::CashOut => match *player {
                None => Self::not_joined(),
                Some(id) => match engine.cash_out(id).await {
                    Ok(receipt) => ServerMessage::cashed_out_result(&receipt),
                    Err(err) => ServerMessage::from_engine_error(&err),
                },
            },
            ClientMessage::History { limit } => {
                match engine.history(limit.min(MAX_HISTORY_LIMIT)).await {
                    Ok(records) => ServerMessage::History {
                        rounds: records.iter().map(RoundSummary::from).collect(),
                    },
                    Err(err) => ServerMessage::from_engine_error(&err),
                }
            }
            ClientMessage::Ping { timestamp } => ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
            },
            ClientMessage::Leave => {
                debug!("Client {} left", addr);
                return false;
            }
        };

        sender.send(reply).await.is_ok()
    }

    fn not_joined() -> ServerMessage {
        ServerMessage::error(ErrorCode::NotJoined, "Must join first")
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Number of connections bound to a player.
    pub async fn joined_count(&self) -> usize {
        self.clients.read().await.values().filter(|c| c.player_id.is_some()).count()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;
    use crate::core::clock::TokioClock;
    use crate::game::config::EngineConfig;
    use crate::game::engine::RoundEngine;
    use crate::proof::sampler::CrashSampler;

    const PLAYER: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    async fn start_server() -> (Arc<GameServer>, SocketAddr) {
        let (engine, _task) = RoundEngine::spawn(
            EngineConfig::default(),
            Box::new(CrashSampler::new(100)),
            TokioClock::new(),
        )
        .unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            version: "test-build".to_string(),
            ..Default::default()
        };
        let listener = TcpListener::bind(config.bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(GameServer::new(config, engine));
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    /// Send a request and return the first reply that isn't a round broadcast.
    async fn request<S>(ws: &mut S, text: &str) -> ServerMessage
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + SinkExt<Message>
            + Unpin,
    {
        let _ = ws.send(Message::Text(text.to_string())).await;
        loop {
            let Some(Ok(Message::Text(reply))) = ws.next().await else {
                panic!("connection closed");
            };
            let msg = ServerMessage::from_json(&reply).unwrap();
            match msg {
                ServerMessage::RoundCreated { .. }
                | ServerMessage::Countdown { .. }
                | ServerMessage::Multiplier { .. }
                | ServerMessage::Crash { .. }
                | ServerMessage::BetPlaced { .. }
                | ServerMessage::CashedOut { .. } => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_env() {
        let config = ServerConfig::from_lookup(|name| match name {
            "CRASH_BIND_ADDR" => Some("127.0.0.1:9000".to_string()),
            "CRASH_MAX_CONNECTIONS" => Some("5".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.max_connections, 5);

        let err = ServerConfig::from_lookup(|name| {
            (name == "CRASH_BIND_ADDR").then(|| "nowhere".to_string())
        });
        assert!(err.is_err());

        let err = ServerConfig::from_lookup(|name| {
            (name == "CRASH_IDLE_TIMEOUT_SECS").then(|| u64::MAX.to_string())
        });
        assert_eq!(err, Err(ConfigError::OutOfRange { field: "idle_timeout", reason: "longer than 24 hours" }));
    }

    #[tokio::test]
    async fn test_join_bet_and_errors() {
        let (server, addr) = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        // Requests before join
        let reply = request(&mut ws, r#"{"type":"cash_out"}"#).await;
        assert!(matches!(reply, ServerMessage::Error(ref e) if e.code == ErrorCode::NotJoined));

        let reply = request(&mut ws, &format!(r#"{{"type":"join","player_id":"{}"}}"#, PLAYER)).await;
        let ServerMessage::Joined(info) = reply else {
            panic!("expected joined, got {:?}", reply);
        };
        assert_eq!(info.balance, 1000.0);
        assert_eq!(info.player_id, PLAYER);
        assert_eq!(info.server_version, "test-build");
        assert_eq!(server.joined_count().await, 1);

        let reply = request(&mut ws, r#"{"type":"place_bet","amount":100}"#).await;
        assert_eq!(reply, ServerMessage::BetAccepted { balance: 900.0 });

        let reply = request(&mut ws, r#"{"type":"place_bet","amount":100}"#).await;
        assert!(matches!(reply, ServerMessage::Error(ref e) if e.code == ErrorCode::AlreadyBet));

        // Still counting down
        let reply = request(&mut ws, r#"{"type":"cash_out"}"#).await;
        assert!(matches!(reply, ServerMessage::Error(ref e) if e.code == ErrorCode::RoundNotRunning));

        let reply = request(&mut ws, "not json").await;
        assert!(matches!(reply, ServerMessage::Error(ref e) if e.code == ErrorCode::InvalidInput));

        let reply = request(&mut ws, r#"{"type":"ping","timestamp":42}"#).await;
        assert!(matches!(reply, ServerMessage::Pong { timestamp: 42, .. }));

        let reply = request(&mut ws, r#"{"type":"history","limit":5}"#).await;
        assert_eq!(reply, ServerMessage::History { rounds: Vec::new() });

        server.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_bet_amount() {
        let (server, addr) = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        request(&mut ws, &format!(r#"{{"type":"join","player_id":"{}"}}"#, PLAYER)).await;

        let reply = request(&mut ws, r#"{"type":"place_bet","amount":-5}"#).await;
        assert!(matches!(reply, ServerMessage::Error(ref e) if e.code == ErrorCode::InvalidAmount));

        let reply = request(&mut ws, r#"{"type":"place_bet","amount":5000}"#).await;
        assert!(matches!(reply, ServerMessage::Error(ref e) if e.code == ErrorCode::InsufficientBalance));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_binary_frames() {
        let (server, addr) = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        request(&mut ws, &format!(r#"{{"type":"join","player_id":"{}"}}"#, PLAYER)).await;

        let bet = BinaryRequest { op: BinaryRequest::OP_PLACE_BET, value: 2_500, auto_cash_out: 200 };
        ws.send(Message::Binary(bet.to_bytes().unwrap())).await.unwrap();
        let reply = request(&mut ws, r#"{"type":"ping","timestamp":1}"#).await;
        assert_eq!(reply, ServerMessage::BetAccepted { balance: 975.0 });

        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let (server, _addr) = start_server().await;
        server.shutdown();
        assert_eq!(server.connection_count().await, 0);
    }
}
