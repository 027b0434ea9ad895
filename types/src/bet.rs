use crate::round::{Amount, Multiplier};
use serde::{Deserialize, Serialize};

/// Opaque identifier of an authenticated player session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of the player's stake within one round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Active,
    Won,
    Lost,
}

/// The player's stake in the current round.
///
/// Only a `Won` bet carries a cash-out multiplier and profit; the
/// constructors below are the only way state moves, keeping that invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub amount: Amount,
    pub status: BetStatus,
    pub cash_out_multiplier: Option<Multiplier>,
    pub profit: Option<Amount>,
}

impl Bet {
    /// A freshly placed (or restored) stake.
    pub fn active(amount: Amount) -> Self {
        Self {
            amount,
            status: BetStatus::Active,
            cash_out_multiplier: None,
            profit: None,
        }
    }

    /// Settle as won at the server-reported multiplier.
    pub fn won(amount: Amount, multiplier: Multiplier, profit: Amount) -> Self {
        Self {
            amount,
            status: BetStatus::Won,
            cash_out_multiplier: Some(multiplier),
            profit: Some(profit),
        }
    }

    /// Settle as lost. Profit and multiplier stay unset.
    pub fn lost(amount: Amount) -> Self {
        Self {
            amount,
            status: BetStatus::Lost,
            cash_out_multiplier: None,
            profit: None,
        }
    }
}

/// One row of the "current round bets" restoration query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBet {
    pub player: PlayerId,
    pub amount: Amount,
}
