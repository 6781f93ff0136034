//! Bet Ledger
//!
//! Owns every player balance and every unarchived bet.
//!
//! ## Atomicity
//!
//! Each operation validates and computes all new values first, then
//! mutates. An operation that returns `Err` has changed nothing.
//!
//! ## Conservation
//!
//! ```text
//! Σ balances + Σ active stakes + house_net == Σ deposits
//! ```
//!
//! `house_net` gains a stake when a bet is lost and pays out
//! `payout - stake` when a bet is cashed out. [`BetLedger::audit`] checks
//! the identity exactly.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error};

use crate::core::fixed::{Amount, Multiplier};
use crate::game::state::{Bet, BetStatus, PlayerId, RoundId};

/// Errors from bet placement and settlement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BetError {
    /// Stake is zero, negative, or the auto cash-out target is not above 1.00x.
    #[error("invalid amount")]
    InvalidAmount,

    /// Stake exceeds balance.
    #[error("insufficient balance")]
    InsufficientBalance,

    /// Player already has a bet on this round.
    #[error("already bet on this round")]
    AlreadyBet,

    /// Player has no bet on this round.
    #[error("no active bet")]
    NoActiveBet,

    /// Bet was already cashed out.
    #[error("already cashed out")]
    AlreadyCashedOut,

    /// Round is not running (not started yet, or already crashed).
    #[error("round not running")]
    RoundNotRunning,

    /// Bets are not accepted in the current phase.
    #[error("betting closed")]
    BettingClosed,

    /// A ledger invariant is broken. Fatal.
    #[error("internal ledger inconsistency: {0}")]
    InternalLedgerInconsistency(String),
}

impl BetError {
    /// Is this error fatal for the engine?
    pub fn is_fatal(&self) -> bool {
        matches!(self, BetError::InternalLedgerInconsistency(_))
    }

    fn inconsistency(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        error!("Ledger inconsistency: {}", msg);
        BetError::InternalLedgerInconsistency(msg)
    }
}

/// Result of a successful cash-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CashOutReceipt {
    /// Player who cashed out.
    pub player_id: PlayerId,
    /// Multiplier locked in.
    pub multiplier: Multiplier,
    /// Amount credited.
    pub payout: Amount,
    /// Balance after the credit.
    pub balance: Amount,
}

/// Player balances and bets.
#[derive(Debug, Clone)]
pub struct BetLedger {
    /// Balance per player.
    balances: BTreeMap<PlayerId, Amount>,
    /// Unarchived bets keyed by (round, player).
    bets: BTreeMap<(RoundId, PlayerId), Bet>,
    /// Balance granted to new accounts.
    starting_balance: Amount,
    /// Total ever credited by account opening.
    deposits: u128,
    /// House result: lost stakes minus cash-out winnings.
    house_net: i128,
}

impl BetLedger {
    /// Create an empty ledger.
    pub fn new(starting_balance: Amount) -> Self {
        Self {
            balances: BTreeMap::new(),
            bets: BTreeMap::new(),
            starting_balance,
            deposits: 0,
            house_net: 0,
        }
    }

    /// Open an account with the starting balance if it doesn't exist.
    /// Returns the current balance.
    pub fn open_account(&mut self, player_id: PlayerId) -> Amount {
        if let Some(balance) = self.balances.get(&player_id) {
            return *balance;
        }
        self.balances.insert(player_id, self.starting_balance);
        self.deposits += self.starting_balance.0 as u128;
        debug!("Opened account {} with {}", player_id, self.starting_balance);
        self.starting_balance
    }

    /// Current balance.
    pub fn balance(&self, player_id: &PlayerId) -> Option<Amount> {
        self.balances.get(player_id).copied()
    }

    /// A player's bet on a round.
    pub fn bet(&self, round_id: RoundId, player_id: &PlayerId) -> Option<&Bet> {
        self.bets.get(&(round_id, *player_id))
    }

    /// All unarchived bets on a round, in player order.
    pub fn bets_for(&self, round_id: RoundId) -> impl Iterator<Item = &Bet> {
        self.bets
            .range((round_id, PlayerId::new([0; 16]))..=(round_id, PlayerId::new([0xFF; 16])))
            .map(|(_, bet)| bet)
    }

    /// Debit the stake and record the bet.
    ///
    /// Returns the new balance.
    pub fn place_bet(
        &mut self,
        round_id: RoundId,
        player_id: PlayerId,
        amount: Amount,
        auto_cash_out: Option<Multiplier>,
        placed_at: DateTime<Utc>,
    ) -> Result<Amount, BetError> {
        if amount.is_zero() {
            return Err(BetError::InvalidAmount);
        }
        if matches!(auto_cash_out, Some(target) if target <= Multiplier::ONE) {
            return Err(BetError::InvalidAmount);
        }
        if self.bets.contains_key(&(round_id, player_id)) {
            return Err(BetError::AlreadyBet);
        }

        let balance = self.balance(&player_id).unwrap_or(Amount::ZERO);
        let new_balance = balance
            .checked_sub(amount)
            .ok_or(BetError::InsufficientBalance)?;

        self.balances.insert(player_id, new_balance);
        self.bets.insert((round_id, player_id), Bet {
            player_id,
            round_id,
            amount,
            auto_cash_out,
            placed_at,
            status: BetStatus::Active,
        });

        Ok(new_balance)
    }

    /// Settle a bet at `at`, which must be below `crash_point`.
    pub fn cash_out(
        &mut self,
        round_id: RoundId,
        player_id: PlayerId,
        at: Multiplier,
        crash_point: Multiplier,
    ) -> Result<CashOutReceipt, BetError> {
        let bet = self.bets.get(&(round_id, player_id)).ok_or(BetError::NoActiveBet)?;
        match bet.status {
            BetStatus::Active => {}
            BetStatus::CashedOut { .. } => return Err(BetError::AlreadyCashedOut),
            BetStatus::Lost | BetStatus::Refunded => return Err(BetError::RoundNotRunning),
        }
        if at >= crash_point {
            return Err(BetError::RoundNotRunning);
        }

        let amount = bet.amount;
        let payout = at
            .apply(amount)
            .ok_or_else(|| BetError::inconsistency(format!("payout overflow for {}", player_id)))?;
        let balance = self
            .balance(&player_id)
            .ok_or_else(|| BetError::inconsistency(format!("bet without account for {}", player_id)))?;
        let new_balance = balance
            .checked_add(payout)
            .ok_or_else(|| BetError::inconsistency(format!("balance overflow for {}", player_id)))?;

        // Commit
        self.balances.insert(player_id, new_balance);
        self.house_net -= payout.0 as i128 - amount.0 as i128;
        if let Some(bet) = self.bets.get_mut(&(round_id, player_id)) {
            bet.status = BetStatus::CashedOut { multiplier: at, payout };
        }

        Ok(CashOutReceipt {
            player_id,
            multiplier: at,
            payout,
            balance: new_balance,
        })
    }

    /// Active bets whose auto cash-out target is at or below `reached`.
    pub fn auto_cash_outs_due(&self, round_id: RoundId, reached: Multiplier) -> Vec<(PlayerId, Multiplier)> {
        self.bets_for(round_id)
            .filter(|bet| bet.is_active())
            .filter_map(|bet| match bet.auto_cash_out {
                Some(target) if target <= reached => Some((bet.player_id, target)),
                _ => None,
            })
            .collect()
    }

    /// Mark every still-active bet on the round as lost. Idempotent.
    ///
    /// Returns the players whose bets were newly lost.
    pub fn settle_crash(&mut self, round_id: RoundId) -> Vec<PlayerId> {
        let mut lost = Vec::new();
        for ((rid, player_id), bet) in self.bets.iter_mut() {
            if *rid != round_id || !bet.is_active() {
                continue;
            }
            bet.status = BetStatus::Lost;
            self.house_net += bet.amount.0 as i128;
            lost.push(*player_id);
        }
        lost
    }

    /// Return the stake of every still-active bet on the round. Idempotent.
    ///
    /// Used when the engine stops before the round crashes.
    pub fn refund_round(&mut self, round_id: RoundId) -> Result<Vec<(PlayerId, Amount)>, BetError> {
        // Compute every new balance before touching anything.
        let mut credits = Vec::new();
        for bet in self.bets_for(round_id).filter(|b| b.is_active()) {
            let balance = self.balance(&bet.player_id).ok_or_else(|| {
                BetError::inconsistency(format!("bet without account for {}", bet.player_id))
            })?;
            let new_balance = balance.checked_add(bet.amount).ok_or_else(|| {
                BetError::inconsistency(format!("balance overflow for {}", bet.player_id))
            })?;
            credits.push((bet.player_id, bet.amount, new_balance));
        }

        let mut refunds = Vec::with_capacity(credits.len());
        for (player_id, amount, new_balance) in credits {
            self.balances.insert(player_id, new_balance);
            if let Some(bet) = self.bets.get_mut(&(round_id, player_id)) {
                bet.status = BetStatus::Refunded;
            }
            refunds.push((player_id, amount));
        }
        Ok(refunds)
    }

    /// Detach the settled bets of a round for archival.
    ///
    /// Fails without removing anything if a bet is still active.
    pub fn archive(&mut self, round_id: RoundId) -> Result<Vec<Bet>, BetError> {
        if let Some(bet) = self.bets_for(round_id).find(|b| b.is_active()) {
            return Err(BetError::inconsistency(format!(
                "archiving round {} with active bet from {}",
                round_id, bet.player_id
            )));
        }
        let keys: Vec<_> = self.bets_for(round_id).map(|b| (b.round_id, b.player_id)).collect();
        Ok(keys.into_iter().filter_map(|key| self.bets.remove(&key)).collect())
    }

    /// Sum of stakes still riding.
    pub fn active_stakes(&self) -> u128 {
        self.bets.values()
            .filter(|b| b.is_active())
            .map(|b| b.amount.0 as u128)
            .sum()
    }

    /// Sum of all balances.
    pub fn total_balances(&self) -> u128 {
        self.balances.values().map(|b| b.0 as u128).sum()
    }

    /// House result so far (positive = house is up).
    pub fn house_net(&self) -> i128 {
        self.house_net
    }

    /// Check the conservation identity.
    pub fn audit(&self) -> Result<(), BetError> {
        let held = self.total_balances() as i128 + self.active_stakes() as i128 + self.house_net;
        if held != self.deposits as i128 {
            return Err(BetError::inconsistency(format!(
                "conservation violated: held {} != deposits {}",
                held, self.deposits
            )));
        }
        Ok(())
    }

    /// Overwrite a balance without bookkeeping.
    #[cfg(test)]
    pub(crate) fn set_balance_unchecked(&mut self, player_id: PlayerId, balance: Amount) {
        self.balances.insert(player_id, balance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ROUND: RoundId = RoundId([1; 16]);
    const ALICE: PlayerId = PlayerId::new([1; 16]);
    const BOB: PlayerId = PlayerId::new([2; 16]);

    fn m(hundredths: u64) -> Multiplier {
        Multiplier::from_hundredths(hundredths)
    }

    fn ledger() -> BetLedger {
        let mut ledger = BetLedger::new(Amount::from_units(1000));
        ledger.open_account(ALICE);
        ledger.open_account(BOB);
        ledger
    }

    #[test]
    fn test_open_account_is_idempotent() {
        let mut ledger = ledger();
        ledger.place_bet(ROUND, ALICE, Amount::from_units(10), None, Utc::now()).unwrap();
        assert_eq!(ledger.open_account(ALICE), Amount::from_units(990));
        ledger.audit().unwrap();
    }

    #[test]
    fn test_place_bet_debits() {
        let mut ledger = ledger();
        let balance = ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();
        assert_eq!(balance, Amount::from_units(900));
        assert!(ledger.bet(ROUND, &ALICE).unwrap().is_active());
        ledger.audit().unwrap();
    }

    #[test]
    fn test_place_bet_rejections() {
        let mut ledger = ledger();
        let now = Utc::now();

        assert_eq!(ledger.place_bet(ROUND, ALICE, Amount::ZERO, None, now), Err(BetError::InvalidAmount));
        assert_eq!(
            ledger.place_bet(ROUND, ALICE, Amount::from_units(1), Some(Multiplier::ONE), now),
            Err(BetError::InvalidAmount),
        );
        assert_eq!(
            ledger.place_bet(ROUND, ALICE, Amount::from_units(1001), None, now),
            Err(BetError::InsufficientBalance),
        );
        assert_eq!(
            ledger.place_bet(ROUND, PlayerId::new([9; 16]), Amount::from_units(1), None, now),
            Err(BetError::InsufficientBalance),
        );

        ledger.place_bet(ROUND, ALICE, Amount::from_units(1000), None, now).unwrap();
        assert_eq!(ledger.place_bet(ROUND, ALICE, Amount::from_units(1), None, now), Err(BetError::AlreadyBet));

        // Rejections leave no trace
        assert_eq!(ledger.balance(&ALICE), Some(Amount::ZERO));
        assert!(ledger.bet(ROUND, &PlayerId::new([9; 16])).is_none());
        ledger.audit().unwrap();
    }

    #[test]
    fn test_cash_out_credits_payout() {
        let mut ledger = ledger();
        ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();

        let receipt = ledger.cash_out(ROUND, ALICE, m(180), m(250)).unwrap();
        assert_eq!(receipt.payout, Amount::from_units(180));
        assert_eq!(receipt.balance, Amount::from_units(1080));
        assert_eq!(ledger.bet(ROUND, &ALICE).unwrap().cash_out_multiplier(), Some(m(180)));
        assert_eq!(ledger.house_net(), -8_000);
        ledger.audit().unwrap();
    }

    #[test]
    fn test_cash_out_once() {
        let mut ledger = ledger();
        ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();

        ledger.cash_out(ROUND, ALICE, m(150), m(250)).unwrap();
        assert_eq!(ledger.cash_out(ROUND, ALICE, m(160), m(250)), Err(BetError::AlreadyCashedOut));
        assert_eq!(ledger.balance(&ALICE), Some(Amount::from_units(1050)));
    }

    #[test]
    fn test_cash_out_rejections() {
        let mut ledger = ledger();
        assert_eq!(ledger.cash_out(ROUND, ALICE, m(150), m(250)), Err(BetError::NoActiveBet));

        ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();
        // At or past the crash point
        assert_eq!(ledger.cash_out(ROUND, ALICE, m(250), m(250)), Err(BetError::RoundNotRunning));

        ledger.settle_crash(ROUND);
        assert_eq!(ledger.cash_out(ROUND, ALICE, m(120), m(250)), Err(BetError::RoundNotRunning));
        assert_eq!(ledger.balance(&ALICE), Some(Amount::from_units(900)));
    }

    #[test]
    fn test_settle_crash_is_idempotent() {
        let mut ledger = ledger();
        ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();
        ledger.place_bet(ROUND, BOB, Amount::from_units(50), None, Utc::now()).unwrap();
        ledger.cash_out(ROUND, BOB, m(200), m(300)).unwrap();

        assert_eq!(ledger.settle_crash(ROUND), vec![ALICE]);
        assert!(ledger.settle_crash(ROUND).is_empty());

        assert_eq!(ledger.bet(ROUND, &ALICE).unwrap().status, BetStatus::Lost);
        assert_eq!(ledger.balance(&ALICE), Some(Amount::from_units(900)));
        assert_eq!(ledger.balance(&BOB), Some(Amount::from_units(1050)));
        ledger.audit().unwrap();
    }

    #[test]
    fn test_refund_round() {
        let mut ledger = ledger();
        ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();
        ledger.place_bet(ROUND, BOB, Amount::from_units(50), None, Utc::now()).unwrap();
        ledger.cash_out(ROUND, BOB, m(200), m(300)).unwrap();

        let refunds = ledger.refund_round(ROUND).unwrap();
        assert_eq!(refunds, vec![(ALICE, Amount::from_units(100))]);
        assert!(ledger.refund_round(ROUND).unwrap().is_empty());

        assert_eq!(ledger.balance(&ALICE), Some(Amount::from_units(1000)));
        assert_eq!(ledger.bet(ROUND, &ALICE).unwrap().status, BetStatus::Refunded);
        assert!(matches!(ledger.bet(ROUND, &BOB).unwrap().status, BetStatus::CashedOut { .. }));
        ledger.audit().unwrap();
    }

    #[test]
    fn test_auto_cash_outs_due() {
        let mut ledger = ledger();
        ledger.place_bet(ROUND, ALICE, Amount::from_units(10), Some(m(150)), Utc::now()).unwrap();
        ledger.place_bet(ROUND, BOB, Amount::from_units(10), Some(m(300)), Utc::now()).unwrap();

        assert!(ledger.auto_cash_outs_due(ROUND, m(149)).is_empty());
        assert_eq!(ledger.auto_cash_outs_due(ROUND, m(150)), vec![(ALICE, m(150))]);

        ledger.cash_out(ROUND, ALICE, m(150), m(500)).unwrap();
        assert_eq!(ledger.auto_cash_outs_due(ROUND, m(400)), vec![(BOB, m(300))]);
    }

    #[test]
    fn test_archive_requires_settlement() {
        let mut ledger = ledger();
        let other = RoundId([2; 16]);
        ledger.place_bet(ROUND, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();
        ledger.place_bet(other, ALICE, Amount::from_units(100), None, Utc::now()).unwrap();

        let err = ledger.archive(ROUND).unwrap_err();
        assert!(err.is_fatal());
        assert!(ledger.bet(ROUND, &ALICE).is_some());

        ledger.settle_crash(ROUND);
        let archived = ledger.archive(ROUND).unwrap();
        assert_eq!(archived.len(), 1);
        assert!(ledger.bet(ROUND, &ALICE).is_none());
        assert!(ledger.bet(other, &ALICE).is_some());
        ledger.audit().unwrap();
    }

    #[test]
    fn test_audit_detects_leak() {
        let mut ledger = ledger();
        ledger.set_balance_unchecked(ALICE, Amount::from_units(2000));
        assert!(ledger.audit().unwrap_err().is_fatal());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Bet { player: u8, units: u64 },
        CashOut { player: u8, hundredths: u64 },
        Crash,
        Refund,
        NextRound,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..4, 0u64..600).prop_map(|(player, units)| Op::Bet { player, units }),
            4 => (0u8..4, 100u64..1_000).prop_map(|(player, hundredths)| Op::CashOut { player, hundredths }),
            1 => Just(Op::Crash),
            1 => Just(Op::Refund),
            1 => Just(Op::NextRound),
        ]
    }

    proptest! {
        #[test]
        fn prop_balance_conservation(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let mut ledger = BetLedger::new(Amount::from_units(1000));
            let players: Vec<PlayerId> = (0..4u8).map(|i| PlayerId::new([i; 16])).collect();
            for p in &players {
                ledger.open_account(*p);
            }
            let crash_point = m(500);
            let mut round = 0u8;

            for op in ops {
                let round_id = RoundId([round; 16]);
                let before = ledger.clone();
                let result = match op {
                    Op::Bet { player, units } => ledger
                        .place_bet(round_id, players[player as usize], Amount::from_units(units), None, Utc::now())
                        .map(|_| ()),
                    Op::CashOut { player, hundredths } => ledger
                        .cash_out(round_id, players[player as usize], m(hundredths), crash_point)
                        .map(|_| ()),
                    Op::Crash => {
                        ledger.settle_crash(round_id);
                        Ok(())
                    }
                    Op::Refund => ledger.refund_round(round_id).map(|_| ()),
                    Op::NextRound => {
                        ledger.settle_crash(round_id);
                        let archived = ledger.archive(round_id).map(|_| ());
                        round = round.wrapping_add(1);
                        archived
                    }
                };

                if let Err(err) = result {
                    prop_assert!(!err.is_fatal());
                    // Rejected operations change nothing
                    prop_assert_eq!(ledger.total_balances(), before.total_balances());
                    prop_assert_eq!(ledger.house_net(), before.house_net());
                }
                prop_assert!(ledger.audit().is_ok());
            }

            // Every bet ends in exactly one terminal state once the round crashes.
            let round_id = RoundId([round; 16]);
            ledger.settle_crash(round_id);
            prop_assert!(ledger.bets_for(round_id).all(|b| !b.is_active()));
            prop_assert!(ledger.audit().is_ok());
        }
    }
}
