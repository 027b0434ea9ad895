use crate::bet::Bet;
use crate::round::{Amount, Multiplier, RoundId, RoundPhase};
use serde::{Deserialize, Serialize};

/// Opaque session credential presented when subscribing and when sending
/// intents. Issued and persisted elsewhere; this crate only carries it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(pub String);

/// Push events delivered over the subscription stream.
///
/// The wire representation is a tagged JSON object; an unknown tag or a
/// malformed payload fails to decode at the transport boundary and never
/// reaches the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A betting window opened for a new round.
    RoundWaiting { round_id: RoundId },
    /// The round launched; the multiplier starts climbing from 1.00x.
    RoundStart { round_id: RoundId },
    /// Current multiplier while the round is running. Non-decreasing within
    /// a round; delivery is at-most-once and lossy.
    RoundTick { multiplier: Multiplier },
    /// The round crashed at the given multiplier.
    RoundCrash {
        round_id: RoundId,
        crash_multiplier: Multiplier,
    },
    /// Seconds until the next round starts, shown after a crash.
    RoundCountdown { seconds_left: u32 },
    /// Operator kill-switch, independent of round phase.
    BettingEnabled { enabled: bool },
    /// Ledger-reported balance for this session's player.
    BalanceUpdated { new_balance: Amount },
}

/// Authoritative state returned by the periodic snapshot poll. Used to
/// recover from missed push events; merged as a floor, never a rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub phase: RoundPhase,
    pub multiplier: Multiplier,
    /// Absent when no round has been scheduled yet; the client keeps its
    /// last known identifier in that case.
    pub round_id: Option<RoundId>,
    pub betting_enabled: bool,
}

/// Outbound intent: stake `amount` on the current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceBetRequest {
    pub amount: Amount,
}

/// Server acceptance of a placed bet, with the ledger's new balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceBetReceipt {
    pub bet: Bet,
    pub new_balance: Amount,
}

/// Server acceptance of a cash-out. The multiplier is the value at which the
/// server settled the bet, which may differ from the one displayed locally
/// by a network round-trip; the server's value always wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashOutReceipt {
    pub cash_out_multiplier: Multiplier,
    pub profit: Amount,
    pub new_balance: Amount,
}

/// Why a bet intent was refused. Returned as a JSON error body and surfaced
/// to the player verbatim; state is left unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BetRejection {
    #[error("stake is below the minimum")]
    BelowMinimum,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("betting is disabled")]
    BettingDisabled,
    #[error("bets are not accepted in this phase")]
    WrongPhase,
    #[error("a bet is already placed for this round")]
    BetAlreadyPlaced,
    #[error("no active bet to cash out")]
    NoActiveBet,
}

/// Mode of the admin crash-override schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OverrideMode {
    /// Every scheduled round crashes at exactly this multiplier.
    Exact { value: Multiplier },
    /// Each scheduled round crashes somewhere in `[min, max]`.
    Range { min: Multiplier, max: Multiplier },
    /// A per-round sequence of forced values, consumed in order.
    Sequence { values: Vec<Multiplier> },
}

/// Read-only view of any active crash-override schedule. The client displays
/// the mode and remaining count; it makes no decisions from them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverrideStatus {
    #[serde(flatten)]
    pub mode: OverrideMode,
    pub remaining: u32,
}
