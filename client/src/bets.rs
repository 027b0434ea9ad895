//! Bet lifecycle controller: tracks the player's own stake within a round
//! and keeps the cached balance aligned with the ledger.
//!
//! The controller is pure bookkeeping; the engine owns the transport and
//! feeds server receipts back in. Balance is never derived locally from
//! stake and multiplier: the only mutation is adopting whatever value the
//! ledger reported, so the cache cannot drift from server truth.

use std::time::Duration;
use tracing::{debug, info};
use updraft_types::{
    ActiveBet, Amount, Bet, BetRejection, BetStatus, CashOutReceipt, PlayerId, RoundId, RoundPhase,
};

/// Tunables for local bet gating.
#[derive(Clone, Copy, Debug)]
pub struct BetConfig {
    /// Minimum stake per bet, in minor units.
    pub min_stake: Amount,
    /// How long after `running` begins that new bets stay blocked, so a bet
    /// cannot ride visible multiplier growth. The server's acceptance window
    /// is authoritative; this gate only pre-empts obvious refusals.
    pub grace_period: Duration,
}

impl Default for BetConfig {
    fn default() -> Self {
        Self {
            min_stake: updraft_types::constants::MIN_STAKE,
            grace_period: updraft_types::constants::DEFAULT_GRACE_PERIOD,
        }
    }
}

/// The player's stake across one round: none -> placed -> (won | lost),
/// reset when the next betting window opens.
pub struct BetController {
    config: BetConfig,
    player: PlayerId,
    balance: Amount,
    bet: Option<Bet>,
    /// Round for which the restoration query has already been issued.
    /// Guards the "current round bets" poll to at most once per round.
    restored_round: Option<RoundId>,
}

impl BetController {
    pub fn new(config: BetConfig, player: PlayerId, balance: Amount) -> Self {
        Self {
            config,
            player,
            balance,
            bet: None,
            restored_round: None,
        }
    }

    pub fn bet(&self) -> Option<&Bet> {
        self.bet.as_ref()
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Gate a placement intent against local state. Leaves everything
    /// unchanged; the server performs the same checks authoritatively.
    pub fn check_placement(
        &self,
        amount: Amount,
        phase: RoundPhase,
        betting_enabled: bool,
        running_for: Option<Duration>,
    ) -> Result<(), BetRejection> {
        if !betting_enabled {
            return Err(BetRejection::BettingDisabled);
        }
        if self.bet.map(|bet| bet.status) == Some(BetStatus::Active) {
            return Err(BetRejection::BetAlreadyPlaced);
        }
        if amount < self.config.min_stake {
            return Err(BetRejection::BelowMinimum);
        }
        if amount > self.balance {
            return Err(BetRejection::InsufficientBalance);
        }
        match phase {
            RoundPhase::Waiting => Ok(()),
            RoundPhase::Running
                if running_for.is_some_and(|elapsed| elapsed >= self.config.grace_period) =>
            {
                Ok(())
            }
            _ => Err(BetRejection::WrongPhase),
        }
    }

    /// Whether a cash-out intent is worth sending at all.
    pub fn check_cash_out(&self, phase: RoundPhase) -> Result<(), BetRejection> {
        if self.bet.map(|bet| bet.status) != Some(BetStatus::Active) {
            return Err(BetRejection::NoActiveBet);
        }
        if phase != RoundPhase::Running {
            return Err(BetRejection::WrongPhase);
        }
        Ok(())
    }

    /// Adopt a server-accepted bet and the ledger's reported balance.
    pub fn adopt(&mut self, bet: Bet, new_balance: Amount) {
        info!(amount = bet.amount, new_balance, "bet placed");
        self.bet = Some(bet);
        self.balance = new_balance;
    }

    /// Settle the bet as won at the server's multiplier, returning the new
    /// state. The locally displayed multiplier may differ by a round-trip;
    /// the receipt wins. A receipt even overrides a locally assumed loss:
    /// the server accepted the cash-out, so the crash landed after it.
    pub fn settle_cash_out(&mut self, receipt: CashOutReceipt) -> Option<Bet> {
        let Some(bet) = self.bet else {
            debug!("cash-out receipt without a tracked bet, ignored");
            return None;
        };
        if bet.status == BetStatus::Won {
            debug!("duplicate cash-out receipt, ignored");
            return Some(bet);
        }
        info!(
            multiplier = %receipt.cash_out_multiplier,
            profit = receipt.profit,
            "bet won"
        );
        let won = Bet::won(bet.amount, receipt.cash_out_multiplier, receipt.profit);
        self.bet = Some(won);
        self.balance = receipt.new_balance;
        Some(won)
    }

    /// The round crashed: an active bet becomes lost, a settled bet keeps
    /// its outcome.
    pub fn resolve_crash(&mut self) {
        if let Some(bet) = self.bet {
            if bet.status == BetStatus::Active {
                info!(amount = bet.amount, "bet lost");
                self.bet = Some(Bet::lost(bet.amount));
            }
        }
    }

    /// A new betting window opened: clean slate, whatever the previous bet's
    /// outcome was.
    pub fn reset_for_round(&mut self, round_id: RoundId) {
        debug!(%round_id, "new round, clearing bet");
        self.bet = None;
    }

    /// The round (if any) whose active-bet list should be queried to restore
    /// a stake placed before a reload. At most one query per round.
    pub fn restoration_needed(
        &mut self,
        phase: RoundPhase,
        round_id: Option<RoundId>,
    ) -> Option<RoundId> {
        if self.bet.is_some() {
            return None;
        }
        if !matches!(phase, RoundPhase::Waiting | RoundPhase::Running) {
            return None;
        }
        let round_id = round_id?;
        if self.restored_round == Some(round_id) {
            return None;
        }
        self.restored_round = Some(round_id);
        Some(round_id)
    }

    /// Adopt the player's own entry from the server's active-bet list, if
    /// any. No-op when a bet was placed while the query was in flight.
    pub fn restore(&mut self, round_id: RoundId, bets: &[ActiveBet]) {
        if self.bet.is_some() {
            return;
        }
        if let Some(entry) = bets.iter().find(|entry| entry.player == self.player) {
            info!(%round_id, amount = entry.amount, "restored in-flight bet");
            self.bet = Some(Bet::active(entry.amount));
        }
    }

    /// Ledger push: adopt the reported balance.
    pub fn apply_balance(&mut self, new_balance: Amount) {
        self.balance = new_balance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use updraft_types::Multiplier;

    fn controller(balance: Amount) -> BetController {
        BetController::new(BetConfig::default(), PlayerId("p1".into()), balance)
    }

    #[test]
    fn test_placement_boundaries_leave_balance_untouched() {
        let ctl = controller(50_000);

        // 9.00 is below the 10.00 minimum.
        assert_eq!(
            ctl.check_placement(900, RoundPhase::Waiting, true, None),
            Err(BetRejection::BelowMinimum)
        );
        // More than the balance.
        assert_eq!(
            ctl.check_placement(60_000, RoundPhase::Waiting, true, None),
            Err(BetRejection::InsufficientBalance)
        );
        // Kill-switch.
        assert_eq!(
            ctl.check_placement(1_000, RoundPhase::Waiting, false, None),
            Err(BetRejection::BettingDisabled)
        );
        // Wrong phase.
        assert_eq!(
            ctl.check_placement(1_000, RoundPhase::Crashed, true, None),
            Err(BetRejection::WrongPhase)
        );
        assert_eq!(ctl.balance(), 50_000);
        assert!(ctl.bet().is_none());
    }

    #[test]
    fn test_grace_period_gates_running_placement() {
        let ctl = controller(50_000);
        let grace = BetConfig::default().grace_period;

        // Too soon after launch.
        assert_eq!(
            ctl.check_placement(1_000, RoundPhase::Running, true, Some(grace / 2)),
            Err(BetRejection::WrongPhase)
        );
        // Past the grace window.
        assert_eq!(
            ctl.check_placement(1_000, RoundPhase::Running, true, Some(grace)),
            Ok(())
        );
        // The betting window itself needs no elapsed time.
        assert_eq!(
            ctl.check_placement(1_000, RoundPhase::Waiting, true, None),
            Ok(())
        );
    }

    #[test]
    fn test_place_then_cash_out_round_trip() {
        let mut ctl = controller(50_000);

        // Place 100.00 out of 500.00: ledger reports 400.00.
        ctl.adopt(Bet::active(10_000), 40_000);
        assert_eq!(ctl.balance(), 40_000);
        assert_eq!(
            ctl.check_placement(1_000, RoundPhase::Waiting, true, None),
            Err(BetRejection::BetAlreadyPlaced)
        );

        // Cash out at the server's 2.50x: profit 150.00, balance 550.00.
        ctl.settle_cash_out(CashOutReceipt {
            cash_out_multiplier: Multiplier::from_bps(25_000),
            profit: 15_000,
            new_balance: 55_000,
        });
        let bet = ctl.bet().unwrap();
        assert_eq!(bet.status, BetStatus::Won);
        assert_eq!(bet.cash_out_multiplier, Some(Multiplier::from_bps(25_000)));
        assert_eq!(bet.profit, Some(15_000));
        assert_eq!(ctl.balance(), 55_000);
    }

    #[test]
    fn test_crash_settles_active_bet_as_lost() {
        let mut ctl = controller(50_000);
        ctl.adopt(Bet::active(2_000), 48_000);

        ctl.resolve_crash();
        let bet = ctl.bet().unwrap();
        assert_eq!(bet.status, BetStatus::Lost);
        assert_eq!(bet.profit, None);
        // Stake was already debited; losing changes nothing further.
        assert_eq!(ctl.balance(), 48_000);
    }

    #[test]
    fn test_crash_leaves_won_bet_untouched() {
        let mut ctl = controller(50_000);
        ctl.adopt(Bet::active(1_000), 49_000);
        ctl.settle_cash_out(CashOutReceipt {
            cash_out_multiplier: Multiplier::from_bps(34_200),
            profit: 2_420,
            new_balance: 52_420,
        });

        ctl.resolve_crash();
        let bet = ctl.bet().unwrap();
        assert_eq!(bet.status, BetStatus::Won);
        assert_eq!(bet.cash_out_multiplier, Some(Multiplier::from_bps(34_200)));
        assert_eq!(bet.profit, Some(2_420));
    }

    #[test]
    fn test_new_round_clears_any_bet() {
        let mut ctl = controller(50_000);
        ctl.adopt(Bet::active(1_000), 49_000);
        ctl.resolve_crash();

        ctl.reset_for_round(RoundId(2));
        assert!(ctl.bet().is_none());
        // The fresh window is allowed one restoration query of its own, in
        // case a stake exists server-side (e.g. placed from another tab).
        assert_eq!(
            ctl.restoration_needed(RoundPhase::Waiting, Some(RoundId(2))),
            Some(RoundId(2))
        );
    }

    #[test]
    fn test_restoration_is_queried_once_per_round() {
        let mut ctl = controller(50_000);

        // Double mount: only the first asks.
        assert_eq!(
            ctl.restoration_needed(RoundPhase::Running, Some(RoundId(7))),
            Some(RoundId(7))
        );
        assert_eq!(
            ctl.restoration_needed(RoundPhase::Running, Some(RoundId(7))),
            None
        );

        // A later round may ask again.
        assert_eq!(
            ctl.restoration_needed(RoundPhase::Running, Some(RoundId(8))),
            Some(RoundId(8))
        );
    }

    #[test]
    fn test_restoration_ignores_other_players_and_settled_phases() {
        let mut ctl = controller(50_000);
        assert_eq!(
            ctl.restoration_needed(RoundPhase::Crashed, Some(RoundId(3))),
            None
        );

        ctl.restore(
            RoundId(7),
            &[
                ActiveBet {
                    player: PlayerId("someone-else".into()),
                    amount: 9_000,
                },
                ActiveBet {
                    player: PlayerId("p1".into()),
                    amount: 5_000,
                },
            ],
        );
        let bet = ctl.bet().unwrap();
        assert_eq!(bet.status, BetStatus::Active);
        assert_eq!(bet.amount, 5_000);
    }

    #[test]
    fn test_late_receipt_overrides_assumed_loss() {
        let mut ctl = controller(50_000);
        ctl.adopt(Bet::active(2_000), 48_000);

        // The crash push outran the cash-out response, so the bet was
        // provisionally lost; the receipt proves the server settled it won.
        ctl.resolve_crash();
        let settled = ctl.settle_cash_out(CashOutReceipt {
            cash_out_multiplier: Multiplier::from_bps(19_000),
            profit: 1_800,
            new_balance: 51_800,
        });
        assert_eq!(settled.unwrap().status, BetStatus::Won);
        assert_eq!(ctl.balance(), 51_800);
    }

    #[test]
    fn test_failed_cash_out_keeps_bet_active_until_crash() {
        let mut ctl = controller(50_000);
        ctl.adopt(Bet::active(2_000), 48_000);

        // The cash-out raced the crash and failed server-side: nothing is
        // settled locally, and the crash event resolves it to lost.
        assert_eq!(ctl.bet().unwrap().status, BetStatus::Active);
        ctl.resolve_crash();
        assert_eq!(ctl.bet().unwrap().status, BetStatus::Lost);
    }
}
