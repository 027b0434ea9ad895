//! The engine: a single-task event loop that owns the round store and bet
//! controller, merges pushes with snapshot polls, runs the display timers,
//! and exposes intents through a mailbox.
//!
//! Presentation code holds a [`Mailbox`] for intents and a
//! `watch::Receiver<GameView>` for state; it never touches the store
//! directly.

use crate::bets::{BetConfig, BetController};
use crate::store::RoundStore;
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::watch;
use updraft_types::{
    constants::{DEFAULT_GO_FLAG_DURATION, DEFAULT_SNAPSHOT_INTERVAL},
    Amount, Bet, Multiplier, PlayerId, RoundId, RoundPhase,
};

mod actor;
pub use actor::Actor;
mod ingress;
pub use ingress::Mailbox;

/// Configuration for the engine.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Stake gating (minimum and grace period).
    pub bet: BetConfig,

    /// Interval of the authoritative snapshot poll.
    pub snapshot_interval: Duration,

    /// How long the "go" flourish shows after a betting window opens.
    pub go_flag_duration: Duration,

    /// Initial delay before redialing a dropped event stream.
    pub reconnect_backoff: Duration,

    /// Ceiling for the redial backoff.
    pub max_reconnect_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bet: BetConfig::default(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            go_flag_duration: DEFAULT_GO_FLAG_DURATION,
            reconnect_backoff: Duration::from_millis(250),
            max_reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Everything presentation needs for one frame. Published on a watch
/// channel after every state change.
#[derive(Clone, Debug, PartialEq)]
pub struct GameView {
    pub phase: RoundPhase,
    pub round_id: Option<RoundId>,
    pub multiplier: Multiplier,
    pub crash_multiplier: Option<Multiplier>,
    pub countdown_seconds: Option<u32>,
    pub betting_enabled: bool,
    /// Transient flourish shown right after a betting window opens.
    pub go: bool,
    pub bet: Option<Bet>,
    pub balance: Amount,
}

impl GameView {
    pub(crate) fn capture(store: &RoundStore, bets: &BetController) -> Self {
        Self {
            phase: store.phase(),
            round_id: store.round_id(),
            multiplier: store.multiplier(),
            crash_multiplier: store.crash_multiplier(),
            countdown_seconds: store.countdown_seconds(),
            betting_enabled: store.betting_enabled(),
            go: store.go_active(),
            bet: bets.bet().copied(),
            balance: bets.balance(),
        }
    }
}

/// Spawn an engine for one authenticated session. Returns the intent
/// mailbox, the view feed, and the task handle.
pub fn start(
    transport: Transport,
    player: PlayerId,
    initial_balance: Amount,
    config: EngineConfig,
) -> (
    Mailbox,
    watch::Receiver<GameView>,
    tokio::task::JoinHandle<()>,
) {
    let (actor, mailbox, views) = Actor::new(transport, player, initial_balance, config);
    let handle = tokio::spawn(actor.run());
    (mailbox, views, handle)
}
