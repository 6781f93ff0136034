//! Crash Engine Server
//!
//! Runs the round engine behind a WebSocket server.
//! Configuration comes from `CRASH_*` environment variables, log filtering
//! from `RUST_LOG`.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crash_engine::{
    CrashSampler, EngineConfig, RoundEngine, TokioClock, VERSION,
    network::{GameServer, ServerConfig},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let engine_config = EngineConfig::from_env().context("invalid engine configuration")?;
    let server_config = ServerConfig::from_env().context("invalid server configuration")?;

    info!("Crash Engine v{}", VERSION);
    info!(
        "Tick {:?}, countdown {:?}, house edge {} bps",
        engine_config.tick_interval, engine_config.countdown, engine_config.house_edge_bps
    );

    let sampler = CrashSampler::new(engine_config.house_edge_bps);
    let (engine, mut engine_task) = RoundEngine::spawn(engine_config, Box::new(sampler), TokioClock::new())?;
    let server = GameServer::new(server_config, engine.clone());

    tokio::select! {
        result = server.run() => {
            result.context("server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            server.shutdown();
        }
        result = &mut engine_task => {
            server.shutdown();
            result.context("engine task panicked")??;
            anyhow::bail!("engine stopped unexpectedly");
        }
    }

    // Refund anything still riding before exiting.
    engine.shutdown();
    match engine_task.await.context("engine task panicked")? {
        Ok(()) => info!("Engine stopped cleanly"),
        Err(err) => {
            error!("Engine stopped with error: {}", err);
            return Err(err.into());
        }
    }

    Ok(())
}
