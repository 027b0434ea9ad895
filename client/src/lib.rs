//! Client core for the updraft crash game.
//!
//! The server owns round lifecycle, crash points, and ledger truth; this
//! crate consumes its unreliable push stream and periodic snapshots,
//! reconciles them into one consistent view of "what round is happening and
//! what is my bet doing", and derives a refresh-safe curve position for the
//! renderer.

pub mod bets;
pub mod engine;
pub mod projector;
pub mod store;
pub mod transport;

pub use bets::{BetConfig, BetController};
pub use engine::{EngineConfig, GameView, Mailbox};
pub use projector::{CurveProjector, Projection};
pub use store::RoundStore;
pub use transport::{EventStream, RetryPolicy, Transport};

use thiserror::Error;
use updraft_types::BetRejection;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("refused: {0}")]
    Rejected(BetRejection),
    #[error("invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("dial timeout")]
    DialTimeout,
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("engine stopped")]
    EngineStopped,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
