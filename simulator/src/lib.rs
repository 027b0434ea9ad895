//! Local authoritative backend for the updraft crash game.
//!
//! Owns everything the real server owns: the round lifecycle, crash points,
//! the ledger, and the admin crash-override queue. Pushes go out on a
//! broadcast channel fanned out to WebSocket subscribers; the snapshot and
//! restoration endpoints answer polls. Used by the client's integration
//! tests and as a dev backend.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State as AxumState,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use updraft_types::{
    constants::MIN_STAKE, profit, ActiveBet, Amount, Bet, BetRejection, BetStatus, CashOutReceipt,
    Multiplier, OverrideMode, OverrideStatus, PlaceBetReceipt, PlaceBetRequest, PlayerId, RoundId,
    RoundPhase, ServerEvent, Snapshot,
};

/// Balance granted to a player on first sight (500.00 chips).
pub const STARTING_BALANCE: Amount = 50_000;

/// Fan-out item for subscriber connections: a push event, optionally
/// addressed to a single player, or an order to close the connection.
#[derive(Clone)]
enum Envelope {
    Event {
        target: Option<PlayerId>,
        event: ServerEvent,
    },
    Disconnect,
}

struct PlayerState {
    balance: Amount,
    bet: Option<Bet>,
}

#[derive(Default)]
struct State {
    phase: RoundPhase,
    round_id: Option<RoundId>,
    next_round: u64,
    multiplier: Multiplier,
    betting_enabled: bool,
    players: HashMap<PlayerId, PlayerState>,
    override_schedule: Option<Schedule>,
}

struct Schedule {
    mode: OverrideMode,
    remaining: u32,
}

/// The authoritative game backend.
pub struct Simulator {
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<Envelope>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let state = Arc::new(RwLock::new(State {
            next_round: 1,
            multiplier: Multiplier::ONE,
            betting_enabled: true,
            ..State::default()
        }));
        Self { state, events }
    }

    fn broadcast(&self, target: Option<PlayerId>, event: ServerEvent) {
        // No subscribers is fine; pushes are lossy by design.
        let _ = self.events.send(Envelope::Event { target, event });
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    /// Close every subscriber connection. State is untouched; clients are
    /// expected to redial and heal from the snapshot.
    pub fn disconnect_subscribers(&self) {
        let _ = self.events.send(Envelope::Disconnect);
    }

    /// Make sure a player exists, granting the starting balance on first
    /// sight (dev-backend faucet behavior).
    pub fn register(&self, player: &PlayerId) {
        let Ok(mut state) = self.state.write() else {
            tracing::error!("state lock poisoned in register");
            return;
        };
        state
            .players
            .entry(player.clone())
            .or_insert_with(|| PlayerState {
                balance: STARTING_BALANCE,
                bet: None,
            });
    }

    /// Credit a player's ledger balance and push the update.
    pub fn credit(&self, player: &PlayerId, amount: Amount) {
        let new_balance = {
            let Ok(mut state) = self.state.write() else {
                tracing::error!("state lock poisoned in credit");
                return;
            };
            let entry = state
                .players
                .entry(player.clone())
                .or_insert_with(|| PlayerState {
                    balance: STARTING_BALANCE,
                    bet: None,
                });
            entry.balance += amount;
            entry.balance
        };
        self.broadcast(
            Some(player.clone()),
            ServerEvent::BalanceUpdated { new_balance },
        );
    }

    /// Open the betting window for a fresh round.
    pub fn begin_waiting(&self) -> RoundId {
        let round_id = {
            let Ok(mut state) = self.state.write() else {
                tracing::error!("state lock poisoned in begin_waiting");
                return RoundId(0);
            };
            let round_id = RoundId(state.next_round);
            state.next_round += 1;
            state.phase = RoundPhase::Waiting;
            state.round_id = Some(round_id);
            state.multiplier = Multiplier::ONE;
            for player in state.players.values_mut() {
                player.bet = None;
            }
            round_id
        };
        self.broadcast(None, ServerEvent::RoundWaiting { round_id });
        round_id
    }

    /// Launch the current round.
    pub fn start_round(&self) {
        let round_id = {
            let Ok(mut state) = self.state.write() else {
                tracing::error!("state lock poisoned in start_round");
                return;
            };
            let Some(round_id) = state.round_id else {
                return;
            };
            state.phase = RoundPhase::Running;
            state.multiplier = Multiplier::ONE;
            round_id
        };
        self.broadcast(None, ServerEvent::RoundStart { round_id });
    }

    /// Advance the multiplier of a running round.
    pub fn tick(&self, multiplier: Multiplier) {
        {
            let Ok(mut state) = self.state.write() else {
                tracing::error!("state lock poisoned in tick");
                return;
            };
            if state.phase != RoundPhase::Running {
                return;
            }
            state.multiplier = multiplier;
        }
        self.broadcast(None, ServerEvent::RoundTick { multiplier });
    }

    /// Crash the current round, settling every still-active bet as lost.
    pub fn crash(&self, crash_multiplier: Multiplier) {
        let round_id = {
            let Ok(mut state) = self.state.write() else {
                tracing::error!("state lock poisoned in crash");
                return;
            };
            let Some(round_id) = state.round_id else {
                return;
            };
            state.phase = RoundPhase::Crashed;
            state.multiplier = crash_multiplier;
            for player in state.players.values_mut() {
                if let Some(bet) = player.bet {
                    if bet.status == BetStatus::Active {
                        player.bet = Some(Bet::lost(bet.amount));
                    }
                }
            }
            round_id
        };
        self.broadcast(
            None,
            ServerEvent::RoundCrash {
                round_id,
                crash_multiplier,
            },
        );
    }

    /// Announce seconds remaining until the next round.
    pub fn countdown(&self, seconds_left: u32) {
        self.broadcast(None, ServerEvent::RoundCountdown { seconds_left });
    }

    /// Flip the operator kill-switch.
    pub fn set_betting_enabled(&self, enabled: bool) {
        {
            let Ok(mut state) = self.state.write() else {
                tracing::error!("state lock poisoned in set_betting_enabled");
                return;
            };
            state.betting_enabled = enabled;
        }
        self.broadcast(None, ServerEvent::BettingEnabled { enabled });
    }

    /// The authoritative snapshot answered to pollers.
    pub fn snapshot(&self) -> Snapshot {
        let Ok(state) = self.state.read() else {
            tracing::error!("state lock poisoned in snapshot");
            return Snapshot {
                phase: RoundPhase::Idle,
                multiplier: Multiplier::ONE,
                round_id: None,
                betting_enabled: true,
            };
        };
        Snapshot {
            phase: state.phase,
            multiplier: state.multiplier,
            round_id: state.round_id,
            betting_enabled: state.betting_enabled,
        }
    }

    /// Active bets of the given round, for client-side bet restoration.
    /// `None` when the round is not the current one.
    pub fn active_bets(&self, round_id: RoundId) -> Option<Vec<ActiveBet>> {
        let state = self.state.read().ok()?;
        if state.round_id != Some(round_id) {
            return None;
        }
        Some(
            state
                .players
                .iter()
                .filter_map(|(player, entry)| {
                    let bet = entry.bet?;
                    (bet.status == BetStatus::Active).then(|| ActiveBet {
                        player: player.clone(),
                        amount: bet.amount,
                    })
                })
                .collect(),
        )
    }

    /// Stake `amount` for `player` on the current round.
    pub fn place_bet(
        &self,
        player: &PlayerId,
        amount: Amount,
    ) -> Result<PlaceBetReceipt, BetRejection> {
        let Ok(mut state) = self.state.write() else {
            tracing::error!("state lock poisoned in place_bet");
            return Err(BetRejection::WrongPhase);
        };
        if !state.betting_enabled {
            return Err(BetRejection::BettingDisabled);
        }
        if !matches!(state.phase, RoundPhase::Waiting | RoundPhase::Running) {
            return Err(BetRejection::WrongPhase);
        }
        if amount < MIN_STAKE {
            return Err(BetRejection::BelowMinimum);
        }
        let entry = state
            .players
            .entry(player.clone())
            .or_insert_with(|| PlayerState {
                balance: STARTING_BALANCE,
                bet: None,
            });
        if entry.bet.map(|bet| bet.status) == Some(BetStatus::Active) {
            return Err(BetRejection::BetAlreadyPlaced);
        }
        if amount > entry.balance {
            return Err(BetRejection::InsufficientBalance);
        }
        entry.balance -= amount;
        let bet = Bet::active(amount);
        entry.bet = Some(bet);
        Ok(PlaceBetReceipt {
            bet,
            new_balance: entry.balance,
        })
    }

    /// Cash out `player`'s active bet at the current multiplier.
    pub fn cash_out(&self, player: &PlayerId) -> Result<CashOutReceipt, BetRejection> {
        let Ok(mut state) = self.state.write() else {
            tracing::error!("state lock poisoned in cash_out");
            return Err(BetRejection::NoActiveBet);
        };
        if state.phase != RoundPhase::Running {
            return Err(BetRejection::WrongPhase);
        }
        let cash_out_multiplier = state.multiplier;
        let Some(entry) = state.players.get_mut(player) else {
            return Err(BetRejection::NoActiveBet);
        };
        let Some(bet) = entry.bet else {
            return Err(BetRejection::NoActiveBet);
        };
        if bet.status != BetStatus::Active {
            return Err(BetRejection::NoActiveBet);
        }
        let won = profit(bet.amount, cash_out_multiplier);
        entry.balance += won;
        entry.bet = Some(Bet::won(bet.amount, cash_out_multiplier, won));
        Ok(CashOutReceipt {
            cash_out_multiplier,
            profit: won,
            new_balance: entry.balance,
        })
    }

    /// Arm a crash-override schedule. `rounds` bounds how many upcoming
    /// rounds it applies to; a sequence is bounded by its own length.
    pub fn set_override(&self, mode: OverrideMode, rounds: Option<u32>) {
        let Ok(mut state) = self.state.write() else {
            tracing::error!("state lock poisoned in set_override");
            return;
        };
        let remaining = match &mode {
            OverrideMode::Sequence { values } => values.len() as u32,
            _ => rounds.unwrap_or(1),
        };
        info!(?mode, remaining, "crash override armed");
        state.override_schedule = Some(Schedule { mode, remaining });
    }

    /// What an admin page would display about the active schedule.
    pub fn override_status(&self) -> Option<OverrideStatus> {
        let state = self.state.read().ok()?;
        let schedule = state.override_schedule.as_ref()?;
        Some(OverrideStatus {
            mode: schedule.mode.clone(),
            remaining: schedule.remaining,
        })
    }

    /// Consume the next forced crash point from the schedule, if any.
    pub fn take_crash_point(&self) -> Option<Multiplier> {
        let Ok(mut state) = self.state.write() else {
            tracing::error!("state lock poisoned in take_crash_point");
            return None;
        };
        let schedule = state.override_schedule.as_mut()?;
        if schedule.remaining == 0 {
            state.override_schedule = None;
            return None;
        }
        let value = match &mut schedule.mode {
            OverrideMode::Exact { value } => *value,
            OverrideMode::Range { min, max } => {
                let (lo, hi) = (min.bps(), max.bps().max(min.bps()));
                Multiplier::from_bps(rand::Rng::gen_range(&mut rand::thread_rng(), lo..=hi))
            }
            OverrideMode::Sequence { values } => {
                let index = values.len() - schedule.remaining as usize;
                match values.get(index) {
                    Some(value) => *value,
                    None => return None,
                }
            }
        };
        schedule.remaining -= 1;
        if schedule.remaining == 0 {
            state.override_schedule = None;
        }
        Some(value)
    }
}

/// HTTP/WebSocket surface over a [`Simulator`].
pub struct Api {
    simulator: Arc<Simulator>,
}

#[derive(Deserialize)]
struct SetOverrideRequest {
    #[serde(flatten)]
    mode: OverrideMode,
    rounds: Option<u32>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        Router::new()
            .route("/snapshot", get(snapshot))
            .route("/rounds/:id/bets", get(round_bets))
            .route("/bets", post(place_bet))
            .route("/cashout", post(cash_out))
            .route("/admin/override", get(override_status).post(set_override))
            .route("/stream/:token", get(stream_ws))
            .layer(cors)
            .with_state(self.simulator.clone())
    }
}

fn bearer(headers: &HeaderMap) -> Option<PlayerId> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    Some(PlayerId(token.to_string()))
}

async fn snapshot(AxumState(simulator): AxumState<Arc<Simulator>>) -> Json<Snapshot> {
    Json(simulator.snapshot())
}

async fn round_bets(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(id): Path<u64>,
) -> Response {
    match simulator.active_bets(RoundId(id)) {
        Some(bets) => Json(bets).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn place_bet(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    headers: HeaderMap,
    Json(request): Json<PlaceBetRequest>,
) -> Response {
    let Some(player) = bearer(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match simulator.place_bet(&player, request.amount) {
        Ok(receipt) => Json(receipt).into_response(),
        Err(rejection) => (StatusCode::BAD_REQUEST, Json(rejection)).into_response(),
    }
}

async fn cash_out(AxumState(simulator): AxumState<Arc<Simulator>>, headers: HeaderMap) -> Response {
    let Some(player) = bearer(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match simulator.cash_out(&player) {
        Ok(receipt) => Json(receipt).into_response(),
        Err(rejection) => (StatusCode::BAD_REQUEST, Json(rejection)).into_response(),
    }
}

async fn override_status(AxumState(simulator): AxumState<Arc<Simulator>>) -> Response {
    match simulator.override_status() {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn set_override(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<SetOverrideRequest>,
) -> StatusCode {
    simulator.set_override(request.mode, request.rounds);
    StatusCode::OK
}

async fn stream_ws(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, simulator, PlayerId(token)))
}

async fn handle_stream(socket: WebSocket, simulator: Arc<Simulator>, player: PlayerId) {
    info!(%player, "subscriber connected");
    simulator.register(&player);
    let mut updates = simulator.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            envelope = updates.recv() => {
                match envelope {
                    Ok(Envelope::Event { target, event }) => {
                        if target.is_some_and(|target| target != player) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Envelope::Disconnect) => {
                        info!(%player, "subscriber kicked");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Pushes are lossy; the client's snapshot poll heals.
                        warn!(%player, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%player, "subscriber disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%player, ?err, "websocket error");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_lifecycle_settles_bets() {
        let simulator = Simulator::new();
        let player = PlayerId("p1".into());

        let round = simulator.begin_waiting();
        assert_eq!(round, RoundId(1));
        let receipt = simulator.place_bet(&player, 2_000).unwrap();
        assert_eq!(receipt.new_balance, STARTING_BALANCE - 2_000);

        simulator.start_round();
        simulator.tick(Multiplier::from_bps(11_500));
        simulator.crash(Multiplier::from_bps(11_500));

        // No cash-out landed: the stake is gone.
        let snapshot = simulator.snapshot();
        assert_eq!(snapshot.phase, RoundPhase::Crashed);
        assert!(simulator
            .cash_out(&player)
            .is_err_and(|r| r == BetRejection::WrongPhase));
    }

    #[test]
    fn test_cash_out_pays_profit() {
        let simulator = Simulator::new();
        let player = PlayerId("p1".into());

        simulator.begin_waiting();
        simulator.place_bet(&player, 10_000).unwrap();
        simulator.start_round();
        simulator.tick(Multiplier::from_bps(25_000));

        let receipt = simulator.cash_out(&player).unwrap();
        assert_eq!(receipt.cash_out_multiplier, Multiplier::from_bps(25_000));
        assert_eq!(receipt.profit, 15_000);
        assert_eq!(receipt.new_balance, STARTING_BALANCE - 10_000 + 15_000);

        // Second cash-out has nothing to settle.
        assert!(simulator
            .cash_out(&player)
            .is_err_and(|r| r == BetRejection::NoActiveBet));
    }

    #[test]
    fn test_restoration_lists_only_active_bets() {
        let simulator = Simulator::new();
        let alice = PlayerId("alice".into());
        let bob = PlayerId("bob".into());

        let round = simulator.begin_waiting();
        simulator.place_bet(&alice, 1_500).unwrap();
        simulator.place_bet(&bob, 3_000).unwrap();
        simulator.start_round();
        simulator.tick(Multiplier::from_bps(20_000));
        simulator.cash_out(&bob).unwrap();

        let bets = simulator.active_bets(round).unwrap();
        assert_eq!(
            bets,
            vec![ActiveBet {
                player: alice.clone(),
                amount: 1_500,
            }]
        );

        // A stale round is unknown.
        assert!(simulator.active_bets(RoundId(999)).is_none());
    }

    #[test]
    fn test_override_schedule_consumption() {
        let simulator = Simulator::new();
        simulator.set_override(
            OverrideMode::Sequence {
                values: vec![Multiplier::from_bps(15_000), Multiplier::from_bps(20_000)],
            },
            None,
        );
        assert_eq!(simulator.override_status().unwrap().remaining, 2);

        assert_eq!(
            simulator.take_crash_point(),
            Some(Multiplier::from_bps(15_000))
        );
        assert_eq!(simulator.override_status().unwrap().remaining, 1);
        assert_eq!(
            simulator.take_crash_point(),
            Some(Multiplier::from_bps(20_000))
        );

        // Exhausted: back to the house curve.
        assert!(simulator.override_status().is_none());
        assert_eq!(simulator.take_crash_point(), None);
    }

    #[test]
    fn test_place_bet_rejections() {
        let simulator = Simulator::new();
        let player = PlayerId("p1".into());

        // No round yet.
        assert_eq!(
            simulator.place_bet(&player, 1_000),
            Err(BetRejection::WrongPhase)
        );

        simulator.begin_waiting();
        assert_eq!(
            simulator.place_bet(&player, 900),
            Err(BetRejection::BelowMinimum)
        );
        assert_eq!(
            simulator.place_bet(&player, STARTING_BALANCE + 1),
            Err(BetRejection::InsufficientBalance)
        );

        simulator.place_bet(&player, 1_000).unwrap();
        assert_eq!(
            simulator.place_bet(&player, 1_000),
            Err(BetRejection::BetAlreadyPlaced)
        );

        simulator.set_betting_enabled(false);
        let other = PlayerId("p2".into());
        assert_eq!(
            simulator.place_bet(&other, 1_000),
            Err(BetRejection::BettingDisabled)
        );
    }
}
