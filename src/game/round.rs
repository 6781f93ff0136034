//! Round State Machine
//!
//! Drives one round at a time through its lifecycle:
//!
//! ```text
//!   ┌───────────┐  timer ends   ┌─────────┐  m >= crash point  ┌─────────┐
//!   │ Countdown │ ────────────► │ Running │ ─────────────────► │ Crashed │
//!   └───────────┘               └─────────┘                    └─────────┘
//!         ▲                                                          │
//!         └──────────────── settlement delay, archive ───────────────┘
//! ```
//!
//! The manager never reads a clock. Every operation takes `now`, so the
//! caller decides how time advances. Events are buffered and drained with
//! [`RoundManager::take_events`].

use std::collections::VecDeque;
use chrono::Utc;
use serde::{Serialize, Deserialize};
use tracing::{debug, error, info, instrument};

use crate::core::clock::Millis;
use crate::core::fixed::{Amount, Multiplier};
use crate::core::hash::HashOutput;
use crate::game::config::EngineConfig;
use crate::game::curve::MultiplierCurve;
use crate::game::events::{RoundEvent, RoundEventData};
use crate::game::ledger::{BetError, BetLedger, CashOutReceipt};
use crate::game::state::{PlayerId, Round, RoundId, RoundPhase, RoundRecord};
use crate::proof::sampler::CrashSource;

/// Phase timing. Mirrors [`RoundPhase`] with the data each phase needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Timer {
    Countdown {
        ends_at: Millis,
        announced: Option<u32>,
    },
    Running {
        start_time: Millis,
        /// Last broadcast multiplier. Cash-outs settle here.
        official: Multiplier,
    },
    Crashed {
        resume_at: Millis,
    },
}

/// Public view of the current round. Never carries the crash point
/// before the crash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Round identifier.
    pub round_id: RoundId,
    /// Current phase.
    pub phase: RoundPhase,
    /// Seed commitment.
    pub commitment: HashOutput,
    /// House edge in basis points.
    pub house_edge_bps: u32,
    /// Official multiplier (running) or final multiplier (crashed).
    pub multiplier: Option<Multiplier>,
    /// Whole seconds left in the countdown.
    pub countdown: Option<u32>,
}

/// Round lifecycle owner.
pub struct RoundManager {
    config: EngineConfig,
    curve: MultiplierCurve,
    sampler: Box<dyn CrashSource>,
    ledger: BetLedger,
    round: Round,
    timer: Timer,
    history: VecDeque<RoundRecord>,
    events: Vec<RoundEvent>,
    halted: Option<BetError>,
    stopped: bool,
}

impl RoundManager {
    /// Create a manager and open the first countdown at `now`.
    pub fn new(config: EngineConfig, mut sampler: Box<dyn CrashSource>, now: Millis) -> Self {
        let round = Round::new(RoundId::new_random(), sampler.draw());
        let mut manager = Self {
            curve: config.curve(),
            ledger: BetLedger::new(config.starting_balance),
            history: VecDeque::with_capacity(config.history_size),
            config,
            sampler,
            round,
            timer: Timer::Crashed { resume_at: now },
            events: Vec::new(),
            halted: None,
            stopped: false,
        };
        manager.begin_countdown(now);
        manager
    }

    // =========================================================================
    // PLAYER OPERATIONS
    // =========================================================================

    /// Open an account if needed and return the balance.
    pub fn open_account(&mut self, player_id: PlayerId) -> Amount {
        self.ledger.open_account(player_id)
    }

    /// Place a bet on the current round.
    pub fn place_bet(
        &mut self,
        player_id: PlayerId,
        amount: Amount,
        auto_cash_out: Option<Multiplier>,
        now: Millis,
    ) -> Result<Amount, BetError> {
        self.check_halted()?;
        if self.stopped {
            return Err(BetError::BettingClosed);
        }

        match self.timer {
            Timer::Countdown { .. } => {}
            Timer::Running { start_time, .. }
                if now.saturating_sub(start_time) < self.config.late_join_millis() => {}
            _ => return Err(BetError::BettingClosed),
        }

        let result = self.ledger.place_bet(self.round.id, player_id, amount, auto_cash_out, Utc::now());
        let balance = self.record_fatal(result)?;
        self.push_event(now, RoundEventData::BetPlaced { player_id, amount, auto_cash_out });
        Ok(balance)
    }

    /// Cash out at the official multiplier.
    pub fn cash_out(&mut self, player_id: PlayerId, now: Millis) -> Result<CashOutReceipt, BetError> {
        self.check_halted()?;
        let official = match self.timer {
            Timer::Running { official, .. } if !self.stopped => official,
            _ => return Err(BetError::RoundNotRunning),
        };

        let result = self.ledger.cash_out(self.round.id, player_id, official, self.round.crash_point());
        let receipt = self.record_fatal(result)?;
        self.push_event(now, RoundEventData::CashedOut {
            player_id,
            multiplier: receipt.multiplier,
            payout: receipt.payout,
            auto: false,
        });
        Ok(receipt)
    }

    // =========================================================================
    // CLOCK
    // =========================================================================

    /// Advance the state machine to `now`.
    ///
    /// A fatal error halts the manager; every later call returns it.
    pub fn tick(&mut self, now: Millis) -> Result<(), BetError> {
        self.check_halted()?;
        if self.stopped {
            return Ok(());
        }

        let result = self.advance(now);
        self.record_fatal(result)
    }

    fn advance(&mut self, now: Millis) -> Result<(), BetError> {
        match self.timer {
            Timer::Countdown { ends_at, .. } => {
                if now >= ends_at {
                    self.start_running(now)
                } else {
                    self.announce_countdown(now);
                    Ok(())
                }
            }
            Timer::Running { start_time, official } => self.advance_running(now, start_time, official),
            Timer::Crashed { resume_at } => {
                if now >= resume_at {
                    self.retire_round()?;
                    self.next_round(now);
                }
                Ok(())
            }
        }
    }

    fn begin_countdown(&mut self, now: Millis) {
        let ends_at = now.saturating_add(self.config.countdown_millis());
        self.timer = Timer::Countdown { ends_at, announced: None };

        info!(
            "Round {} created, commitment {}",
            self.round.id,
            hex::encode(self.round.commitment)
        );
        self.push_event(now, RoundEventData::RoundCreated {
            commitment: self.round.commitment,
            house_edge_bps: self.round.house_edge_bps,
        });
        self.announce_countdown(now);
    }

    /// Broadcast each distinct remaining second once.
    fn announce_countdown(&mut self, now: Millis) {
        let Timer::Countdown { ends_at, announced } = self.timer else {
            return;
        };
        let remaining = ends_at.saturating_sub(now);
        if remaining == 0 {
            return;
        }
        let seconds = remaining.div_ceil(1000) as u32;
        if announced != Some(seconds) {
            self.timer = Timer::Countdown { ends_at, announced: Some(seconds) };
            self.push_event(now, RoundEventData::Countdown { seconds: Some(seconds) });
        }
    }

    fn start_running(&mut self, now: Millis) -> Result<(), BetError> {
        self.push_event(now, RoundEventData::Countdown { seconds: None });
        self.round.phase = RoundPhase::Running;
        self.round.started_at = Some(Utc::now());
        self.timer = Timer::Running { start_time: now, official: Multiplier::ONE };

        info!("Round {} running", self.round.id);

        // A 1.00x crash point ends the round before the first tick.
        if Multiplier::ONE >= self.round.crash_point() {
            return self.crash(now);
        }
        Ok(())
    }

    fn advance_running(&mut self, now: Millis, start_time: Millis, official: Multiplier) -> Result<(), BetError> {
        let m = self.curve.at(now.saturating_sub(start_time));
        let crash_point = self.round.crash_point();

        if m >= crash_point {
            // Targets the curve passed before the crash still pay.
            self.run_auto_cash_outs(now, m, crash_point)?;
            return self.crash(now);
        }
        if m <= official {
            return Ok(());
        }

        self.timer = Timer::Running { start_time, official: m };
        debug!("Round {} at {}", self.round.id, m);
        self.push_event(now, RoundEventData::Multiplier { value: m });
        self.run_auto_cash_outs(now, m, crash_point)
    }

    fn run_auto_cash_outs(&mut self, now: Millis, reached: Multiplier, crash_point: Multiplier) -> Result<(), BetError> {
        for (player_id, target) in self.ledger.auto_cash_outs_due(self.round.id, reached) {
            if target >= crash_point {
                continue;
            }
            let receipt = self.ledger.cash_out(self.round.id, player_id, target, crash_point)?;
            self.push_event(now, RoundEventData::CashedOut {
                player_id,
                multiplier: receipt.multiplier,
                payout: receipt.payout,
                auto: true,
            });
        }
        Ok(())
    }

    fn crash(&mut self, now: Millis) -> Result<(), BetError> {
        self.round.phase = RoundPhase::Crashed;
        self.round.crashed_at = Some(Utc::now());

        let reveal = self.round.reveal().ok_or_else(|| {
            BetError::InternalLedgerInconsistency(format!("round {} crashed without reveal", self.round.id))
        })?;
        self.push_event(now, RoundEventData::Crashed {
            crash_point: reveal.crash_point,
            seed: reveal.seed,
            commitment: reveal.commitment,
        });

        let lost = self.ledger.settle_crash(self.round.id);
        self.ledger.audit()?;
        self.timer = Timer::Crashed {
            resume_at: now.saturating_add(self.config.settlement_millis()),
        };

        info!(
            "Round {} crashed at {} after {} ms ({} lost), seed {}",
            self.round.id,
            reveal.crash_point,
            self.curve.time_to_reach(reveal.crash_point),
            lost.len(),
            hex::encode(reveal.seed)
        );
        Ok(())
    }

    fn retire_round(&mut self) -> Result<(), BetError> {
        self.ledger.settle_crash(self.round.id);
        let bets = self.ledger.archive(self.round.id)?;
        let record = RoundRecord::new(&self.round, bets);
        debug!(
            "Archived round {}: staked {}, paid {}",
            record.round_id,
            record.total_staked(),
            record.total_paid()
        );

        self.history.push_front(record);
        self.history.truncate(self.config.history_size);
        self.ledger.audit()
    }

    fn next_round(&mut self, now: Millis) {
        self.round = Round::new(RoundId::new_random(), self.sampler.draw());
        self.begin_countdown(now);
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Stop the manager, refunding every unsettled bet.
    ///
    /// Bets in a round that already crashed keep their result.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self, now: Millis, reason: &str) -> Result<Vec<(PlayerId, Amount)>, BetError> {
        self.check_halted()?;
        if self.stopped {
            return Ok(Vec::new());
        }
        self.stopped = true;

        let result = self.refund_unsettled(now, reason);
        self.record_fatal(result)
    }

    fn refund_unsettled(&mut self, now: Millis, reason: &str) -> Result<Vec<(PlayerId, Amount)>, BetError> {
        let refunds = match self.timer {
            Timer::Countdown { .. } | Timer::Running { .. } => self.ledger.refund_round(self.round.id)?,
            Timer::Crashed { .. } => Vec::new(),
        };
        for (player_id, amount) in &refunds {
            self.push_event(now, RoundEventData::Refunded { player_id: *player_id, amount: *amount });
        }
        self.push_event(now, RoundEventData::Shutdown { reason: reason.to_string() });
        self.ledger.audit()?;

        info!("Round {} stopped, {} bets refunded", self.round.id, refunds.len());
        Ok(refunds)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Drain buffered events.
    pub fn take_events(&mut self) -> Vec<RoundEvent> {
        std::mem::take(&mut self.events)
    }

    /// Public view of the current round.
    pub fn snapshot(&self, now: Millis) -> RoundSnapshot {
        let (multiplier, countdown) = match self.timer {
            Timer::Countdown { ends_at, .. } => (None, Some(ends_at.saturating_sub(now).div_ceil(1000) as u32)),
            Timer::Running { official, .. } => (Some(official), None),
            Timer::Crashed { .. } => (Some(self.round.crash_point()), None),
        };
        RoundSnapshot {
            round_id: self.round.id,
            phase: self.round.phase,
            commitment: self.round.commitment,
            house_edge_bps: self.round.house_edge_bps,
            multiplier,
            countdown,
        }
    }

    /// Most recent archived rounds, newest first.
    pub fn history(&self, limit: usize) -> Vec<RoundRecord> {
        self.history.iter().take(limit).cloned().collect()
    }

    /// Current round.
    pub fn round(&self) -> &Round {
        &self.round
    }

    /// The ledger.
    pub fn ledger(&self) -> &BetLedger {
        &self.ledger
    }

    /// Player balance.
    pub fn balance(&self, player_id: &PlayerId) -> Option<Amount> {
        self.ledger.balance(player_id)
    }

    /// Official multiplier while running.
    pub fn official_multiplier(&self) -> Option<Multiplier> {
        match self.timer {
            Timer::Running { official, .. } => Some(official),
            _ => None,
        }
    }

    /// Error that halted the manager, if any.
    pub fn halted(&self) -> Option<&BetError> {
        self.halted.as_ref()
    }

    /// Has [`RoundManager::shutdown`] run?
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn check_halted(&self) -> Result<(), BetError> {
        match &self.halted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Halt on the first fatal error, whichever operation hit it.
    fn record_fatal<T>(&mut self, result: Result<T, BetError>) -> Result<T, BetError> {
        if let Err(err) = &result {
            if err.is_fatal() && self.halted.is_none() {
                error!("Round {} halted: {}", self.round.id, err);
                self.halted = Some(err.clone());
            }
        }
        result
    }

    fn push_event(&mut self, now: Millis, data: RoundEventData) {
        self.events.push(RoundEvent::new(self.round.id, now, data));
    }
}
