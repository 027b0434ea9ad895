//! Wire contract for the updraft crash game.
//!
//! Everything the client and the backend exchange lives here: round phases
//! and identifiers, the tagged server event set, snapshot payloads, and the
//! bet intents/receipts. The server is authoritative for all of it; the
//! client only decodes, reconciles, and displays.

pub mod api;
pub mod bet;
pub mod constants;
pub mod round;

pub use api::{
    BetRejection, CashOutReceipt, OverrideMode, OverrideStatus, PlaceBetRequest, PlaceBetReceipt,
    ServerEvent, SessionToken, Snapshot,
};
pub use bet::{ActiveBet, Bet, BetStatus, PlayerId};
pub use round::{profit, Amount, Multiplier, RoundId, RoundPhase};
