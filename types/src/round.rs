use serde::{Deserialize, Serialize};

/// Currency in minor units (hundredths of a chip).
pub type Amount = u64;

/// Identifier of a single round. Strictly increasing across rounds; the sole
/// key used to detect "new round" transitions and to order stale events.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl RoundId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Payout multiplier in basis points (10_000 = 1.00x).
///
/// Stored as an integer so reconciliation and settlement never accumulate
/// float error; display code converts with [`Multiplier::as_f64`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Multiplier(pub u64);

impl Multiplier {
    /// 1.00x in basis points.
    pub const BASE: u64 = 10_000;

    /// The starting multiplier of every round.
    pub const ONE: Multiplier = Multiplier(Self::BASE);

    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub const fn bps(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::BASE as f64
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl std::fmt::Display for Multiplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}x", self.0 / Self::BASE, (self.0 % Self::BASE) / 100)
    }
}

/// Phase of the current round as seen by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Pre-connection default, or forced by the operator kill-switch.
    #[default]
    Idle,
    /// Betting window before a round launches.
    Waiting,
    /// Multiplier actively climbing.
    Running,
    /// Post-crash, possibly counting down to the next round.
    Crashed,
}

impl RoundPhase {
    /// Ordering of phases within a single round. No event may move a round's
    /// phase to a lower rank; only a newer round (or the kill-switch forcing
    /// idle) resets it.
    pub fn rank(self) -> u8 {
        match self {
            RoundPhase::Idle => 0,
            RoundPhase::Waiting => 1,
            RoundPhase::Running => 2,
            RoundPhase::Crashed => 3,
        }
    }
}

/// Winnings for a stake cashed out at `multiplier`: `amount * (m - 1)`.
///
/// Settlement is server-side; this is shared so the simulator and the
/// client's display checks agree on the arithmetic.
pub fn profit(amount: Amount, multiplier: Multiplier) -> Amount {
    let gain = multiplier.bps().saturating_sub(Multiplier::BASE);
    ((amount as u128 * gain as u128) / Multiplier::BASE as u128) as Amount
}
