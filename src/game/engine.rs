//! Round Engine Actor
//!
//! A single task owns the [`RoundManager`]. Player requests arrive on one
//! command queue, clock ticks come from an interval in the same task, and
//! events leave on a broadcast channel.
//!
//! ## Ordering
//!
//! Before every tick's crash determination the actor drains the command
//! queue. A cash-out that was queued before the tick is settled at the
//! official multiplier, which is always below the crash point. A cash-out
//! processed after the crash is rejected with `RoundNotRunning`.

use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::fixed::{Amount, Multiplier};
use crate::game::config::{ConfigError, EngineConfig};
use crate::game::events::RoundEvent;
use crate::game::ledger::{BetError, CashOutReceipt};
use crate::game::round::{RoundManager, RoundSnapshot};
use crate::game::state::{PlayerId, RoundRecord};
use crate::proof::sampler::CrashSource;

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The engine task is gone.
    #[error("engine stopped")]
    Stopped,

    /// The request was rejected; nothing changed.
    #[error("rejected: {0}")]
    Rejected(BetError),

    /// The ledger is inconsistent and the engine halted.
    #[error("engine halted: {0}")]
    Halted(BetError),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<BetError> for EngineError {
    fn from(err: BetError) -> Self {
        if err.is_fatal() {
            EngineError::Halted(err)
        } else {
            EngineError::Rejected(err)
        }
    }
}

impl EngineError {
    /// Underlying bet error, if any.
    pub fn bet_error(&self) -> Option<&BetError> {
        match self {
            EngineError::Rejected(err) | EngineError::Halted(err) => Some(err),
            _ => None,
        }
    }
}

/// Reply to a join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInfo {
    /// Player's balance.
    pub balance: Amount,
    /// Current round.
    pub round: RoundSnapshot,
}

/// Requests processed by the actor.
enum Command {
    Join {
        player_id: PlayerId,
        reply: oneshot::Sender<JoinInfo>,
    },
    PlaceBet {
        player_id: PlayerId,
        amount: Amount,
        auto_cash_out: Option<Multiplier>,
        reply: oneshot::Sender<Result<Amount, BetError>>,
    },
    CashOut {
        player_id: PlayerId,
        reply: oneshot::Sender<Result<CashOutReceipt, BetError>>,
    },
    History {
        limit: usize,
        reply: oneshot::Sender<Vec<RoundRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoundSnapshot>,
    },
    Audit {
        reply: oneshot::Sender<Result<(), BetError>>,
    },
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<RoundEvent>,
    shutdown: broadcast::Sender<()>,
}

impl EngineHandle {
    /// Open the player's account if needed.
    pub async fn join(&self, player_id: PlayerId) -> Result<JoinInfo, EngineError> {
        self.request(|reply| Command::Join { player_id, reply }).await
    }

    /// Place a bet on the current round. Returns the new balance.
    pub async fn place_bet(
        &self,
        player_id: PlayerId,
        amount: Amount,
        auto_cash_out: Option<Multiplier>,
    ) -> Result<Amount, EngineError> {
        Ok(self
            .request(|reply| Command::PlaceBet { player_id, amount, auto_cash_out, reply })
            .await??)
    }

    /// Cash out at the official multiplier.
    pub async fn cash_out(&self, player_id: PlayerId) -> Result<CashOutReceipt, EngineError> {
        Ok(self.request(|reply| Command::CashOut { player_id, reply }).await??)
    }

    /// Recent archived rounds, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<RoundRecord>, EngineError> {
        self.request(|reply| Command::History { limit, reply }).await
    }

    /// Public view of the current round.
    pub async fn snapshot(&self) -> Result<RoundSnapshot, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Check ledger conservation.
    pub async fn audit(&self) -> Result<(), EngineError> {
        Ok(self.request(|reply| Command::Audit { reply }).await??)
    }

    /// Subscribe to round events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    /// Ask the engine to stop. Unsettled bets are refunded.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

/// The engine actor.
pub struct RoundEngine<C: Clock> {
    manager: RoundManager,
    clock: C,
    tick_interval: Duration,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<RoundEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl<C: Clock> RoundEngine<C> {
    /// Validate the config, start the actor and return its handle.
    pub fn spawn(
        config: EngineConfig,
        sampler: Box<dyn CrashSource>,
        clock: C,
    ) -> Result<(EngineHandle, JoinHandle<Result<(), EngineError>>), EngineError> {
        let (handle, engine) = Self::new(config, sampler, clock)?;
        Ok((handle, tokio::spawn(engine.run())))
    }

    /// Validate the config and build an engine without starting it.
    pub fn new(
        config: EngineConfig,
        sampler: Box<dyn CrashSource>,
        clock: C,
    ) -> Result<(EngineHandle, Self), EngineError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = EngineHandle {
            commands: command_tx,
            events: event_tx.clone(),
            shutdown: shutdown_tx,
        };

        let tick_interval = config.tick_interval;
        let manager = RoundManager::new(config, sampler, clock.now());
        let engine = Self {
            manager,
            clock,
            tick_interval,
            commands: command_rx,
            events: event_tx,
            shutdown: shutdown_rx,
        };

        Ok((handle, engine))
    }

    /// Run until shutdown, until every handle is dropped, or until the
    /// ledger halts.
    pub async fn run(mut self) -> Result<(), EngineError> {
        info!("Round engine started, tick {:?}", self.tick_interval);
        self.publish();

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => self.on_tick()?,
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            self.handle(command);
                            self.check_halted()?;
                        }
                        None => {
                            info!("All engine handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        self.stop("server shutting down")
    }

    /// Settle everything already queued, then advance the round.
    fn on_tick(&mut self) -> Result<(), EngineError> {
        // Everything already queued happened before this tick.
        while let Ok(command) = self.commands.try_recv() {
            self.handle(command);
            self.check_halted()?;
        }
        let result = self.manager.tick(self.clock.now());
        self.publish();
        if let Err(err) = result {
            if !err.is_fatal() {
                warn!("Tick failed: {}", err);
            }
        }
        self.check_halted()
    }

    fn check_halted(&self) -> Result<(), EngineError> {
        match self.manager.halted() {
            Some(err) => {
                error!("Round engine halted: {}", err);
                Err(EngineError::Halted(err.clone()))
            }
            None => Ok(()),
        }
    }

    fn handle(&mut self, command: Command) {
        let now = self.clock.now();
        match command {
            Command::Join { player_id, reply } => {
                let balance = self.manager.open_account(player_id);
                let round = self.manager.snapshot(now);
                let _ = reply.send(JoinInfo { balance, round });
            }
            Command::PlaceBet { player_id, amount, auto_cash_out, reply } => {
                let result = self.manager.place_bet(player_id, amount, auto_cash_out, now);
                if let Err(err) = &result {
                    debug!("Bet from {} rejected: {}", player_id, err);
                }
                let _ = reply.send(result);
            }
            Command::CashOut { player_id, reply } => {
                let result = self.manager.cash_out(player_id, now);
                match &result {
                    Ok(receipt) => debug!("{} cashed out at {}", player_id, receipt.multiplier),
                    Err(err) => debug!("Cash-out from {} rejected: {}", player_id, err),
                }
                let _ = reply.send(result);
            }
            Command::History { limit, reply } => {
                let _ = reply.send(self.manager.history(limit));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.manager.snapshot(now));
            }
            Command::Audit { reply } => {
                let _ = reply.send(self.manager.ledger().audit());
            }
        }
        self.publish();
    }

    fn stop(&mut self, reason: &str) -> Result<(), EngineError> {
        let result = self.manager.shutdown(self.clock.now(), reason);
        self.publish();
        match result {
            Ok(refunds) => {
                info!("Round engine stopped, {} refunds", refunds.len());
                Ok(())
            }
            Err(err) => {
                warn!("Round engine stopped with error: {}", err);
                Err(err.into())
            }
        }
    }

    fn publish(&mut self) {
        for event in self.manager.take_events() {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio::sync::broadcast::error::RecvError;
    use crate::core::clock::{ManualClock, TokioClock};
    use crate::game::events::RoundEventData;
    use crate::game::state::RoundPhase;
    use crate::proof::sampler::testing::FixedCrash;

    const ALICE: PlayerId = PlayerId::new([1; 16]);
    const BOB: PlayerId = PlayerId::new([2; 16]);

    fn start(crash_hundredths: u64) -> (EngineHandle, JoinHandle<Result<(), EngineError>>) {
        RoundEngine::spawn(
            EngineConfig::default(),
            Box::new(FixedCrash::at_hundredths(crash_hundredths)),
            TokioClock::new(),
        )
        .unwrap()
    }

    /// Receive events until one matches.
    async fn wait_for(
        rx: &mut broadcast::Receiver<RoundEvent>,
        mut pred: impl FnMut(&RoundEvent) -> bool,
    ) -> RoundEvent {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    }

    fn is_crash(event: &RoundEvent) -> bool {
        matches!(event.data, RoundEventData::Crashed { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cash_out_at_official_multiplier() {
        let (engine, _task) = start(250);
        let mut events = engine.subscribe();

        assert_eq!(engine.join(ALICE).await.unwrap().balance, Amount::from_units(1000));
        assert_eq!(engine.place_bet(ALICE, Amount::from_units(100), None).await, Ok(Amount::from_units(900)));

        let event = wait_for(&mut events, |e| {
            matches!(e.data, RoundEventData::Multiplier { value } if value.hundredths() >= 180)
        })
        .await;
        let RoundEventData::Multiplier { value } = event.data else { unreachable!() };

        let receipt = engine.cash_out(ALICE).await.unwrap();
        assert!(receipt.multiplier >= value);
        assert!(receipt.multiplier < Multiplier::from_hundredths(250));
        assert!(receipt.balance >= Amount::from_units(1080));
        assert_eq!(receipt.balance, Amount::from_units(900).checked_add(receipt.payout).unwrap());

        wait_for(&mut events, is_crash).await;
        assert_eq!(engine.join(ALICE).await.unwrap().balance, receipt.balance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncashed_bet_is_lost() {
        let (engine, _task) = start(250);
        let mut events = engine.subscribe();
        engine.join(ALICE).await.unwrap();
        engine.place_bet(ALICE, Amount::from_units(100), None).await.unwrap();

        let crash = wait_for(&mut events, is_crash).await;
        assert!(matches!(
            crash.data,
            RoundEventData::Crashed { crash_point, .. } if crash_point == Multiplier::from_hundredths(250)
        ));
        assert_eq!(engine.join(ALICE).await.unwrap().balance, Amount::from_units(900));
        assert_eq!(engine.cash_out(ALICE).await, Err(EngineError::Rejected(BetError::RoundNotRunning)));
        assert_eq!(engine.join(ALICE).await.unwrap().balance, Amount::from_units(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cash_outs_settle_once() {
        let (engine, _task) = start(500);
        let mut events = engine.subscribe();
        engine.join(ALICE).await.unwrap();
        engine.place_bet(ALICE, Amount::from_units(100), None).await.unwrap();
        wait_for(&mut events, |e| e.is_tick()).await;

        let (a, b) = tokio::join!(engine.cash_out(ALICE), engine.cash_out(ALICE));
        let (ok, err) = match (a, b) {
            (Ok(receipt), Err(err)) | (Err(err), Ok(receipt)) => (receipt, err),
            other => panic!("expected exactly one success, got {:?}", other),
        };
        assert_eq!(err, EngineError::Rejected(BetError::AlreadyCashedOut));
        assert_eq!(engine.join(ALICE).await.unwrap().balance, ok.balance);
        engine.audit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_multipliers_strictly_increasing() {
        let (engine, _task) = start(300);
        let mut events = engine.subscribe();

        let mut values = Vec::new();
        loop {
            match events.recv().await.unwrap().data {
                RoundEventData::Multiplier { value } => values.push(value),
                RoundEventData::Crashed { crash_point, .. } => {
                    assert!(values.iter().all(|v| *v < crash_point));
                    break;
                }
                _ => {}
            }
        }
        assert!(!values.is_empty());
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refunds_and_stops() {
        let (engine, task) = start(250);
        let mut events = engine.subscribe();
        engine.join(ALICE).await.unwrap();
        engine.place_bet(ALICE, Amount::from_units(100), None).await.unwrap();

        engine.shutdown();
        assert_eq!(task.await.unwrap(), Ok(()));

        let refund = wait_for(&mut events, |e| matches!(e.data, RoundEventData::Refunded { .. })).await;
        assert_eq!(refund.data, RoundEventData::Refunded {
            player_id: ALICE,
            amount: Amount::from_units(100),
        });
        wait_for(&mut events, |e| matches!(e.data, RoundEventData::Shutdown { .. })).await;

        assert_eq!(engine.join(ALICE).await, Err(EngineError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_after_round() {
        let (engine, _task) = start(120);
        let mut events = engine.subscribe();
        let first = engine.snapshot().await.unwrap().round_id;

        wait_for(&mut events, is_crash).await;
        wait_for(&mut events, |e| matches!(e.data, RoundEventData::RoundCreated { .. })).await;

        let history = engine.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].round_id, first);
        assert_ne!(engine.snapshot().await.unwrap().round_id, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_concurrent_players_conserve_balance() {
        let (engine, _task) = start(300);
        let mut rng = StdRng::seed_from_u64(7);

        let mut tasks = Vec::new();
        for i in 0..32u8 {
            let engine = engine.clone();
            let player = PlayerId::new([i; 16]);
            let stake = Amount::from_units(rng.gen_range(1..=1000));
            let wait = Duration::from_millis(rng.gen_range(0..30_000));
            tasks.push(tokio::spawn(async move {
                engine.join(player).await.unwrap();
                let _ = engine.place_bet(player, stake, None).await;
                tokio::time::sleep(wait).await;
                let _ = engine.cash_out(player).await;
                let _ = engine.cash_out(player).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        engine.audit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_follows_injected_clock() {
        let clock = ManualClock::new();
        let (engine, _task) = RoundEngine::spawn(
            EngineConfig::default(),
            Box::new(FixedCrash::at_hundredths(200)),
            clock.clone(),
        )
        .unwrap();

        // Ticks keep firing but the round clock has not moved.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.snapshot().await.unwrap().phase, RoundPhase::Countdown);

        clock.advance(10_000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(engine.snapshot().await.unwrap().phase, RoundPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_cash_out_halts_engine() {
        let config = EngineConfig { starting_balance: Amount(u64::MAX), ..EngineConfig::default() };
        let (engine, task) =
            RoundEngine::spawn(config, Box::new(FixedCrash::at_hundredths(250)), TokioClock::new()).unwrap();
        let mut events = engine.subscribe();
        engine.join(ALICE).await.unwrap();
        engine.place_bet(ALICE, Amount(u64::MAX), None).await.unwrap();
        wait_for(&mut events, |e| e.is_tick()).await;

        // Any payout above 1.00x overflows.
        let err = engine.cash_out(ALICE).await.unwrap_err();
        assert!(matches!(err, EngineError::Halted(BetError::InternalLedgerInconsistency(_))));
        assert!(matches!(task.await.unwrap(), Err(EngineError::Halted(_))));
        assert_eq!(engine.join(ALICE).await, Err(EngineError::Stopped));
    }

    fn queue_cash_out(
        handle: &EngineHandle,
        player_id: PlayerId,
    ) -> oneshot::Receiver<Result<CashOutReceipt, BetError>> {
        let (reply, rx) = oneshot::channel();
        assert!(handle.commands.try_send(Command::CashOut { player_id, reply }).is_ok());
        rx
    }

    #[test]
    fn test_queued_cash_out_settles_before_crash_tick() {
        let clock = ManualClock::new();
        let (handle, mut engine) =
            RoundEngine::new(EngineConfig::default(), Box::new(FixedCrash::at_hundredths(200)), clock.clone())
                .unwrap();
        for player in [ALICE, BOB] {
            engine.manager.open_account(player);
            engine.manager.place_bet(player, Amount::from_units(100), None, clock.now()).unwrap();
        }

        clock.advance(10_000);
        engine.on_tick().unwrap();
        clock.advance(6_000);
        engine.on_tick().unwrap();
        let official = engine.manager.official_multiplier().unwrap();
        assert!(official > Multiplier::ONE && official < Multiplier::from_hundredths(200));

        // Queued while the clock is already past the crash point.
        let mut queued = queue_cash_out(&handle, ALICE);
        clock.advance(10_000);
        engine.on_tick().unwrap();
        assert_eq!(engine.manager.round().phase, RoundPhase::Crashed);

        let receipt = queued.try_recv().unwrap().unwrap();
        assert_eq!(receipt.multiplier, official);
        assert_eq!(
            receipt.balance,
            Amount::from_units(900).checked_add(official.apply(Amount::from_units(100)).unwrap()).unwrap()
        );

        // After the crash the uncashed bet is gone.
        let mut late = queue_cash_out(&handle, BOB);
        engine.on_tick().unwrap();
        let err = late.try_recv().unwrap().unwrap_err();
        assert_eq!(EngineError::from(err), EngineError::Rejected(BetError::RoundNotRunning));
        assert_eq!(engine.manager.balance(&BOB), Some(Amount::from_units(900)));
        engine.manager.ledger().audit().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig { history_size: 0, ..EngineConfig::default() };
        let result = RoundEngine::spawn(config, Box::new(FixedCrash::at_hundredths(200)), TokioClock::new());
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
