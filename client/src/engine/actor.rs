use super::{
    ingress::{Mailbox, Message},
    EngineConfig, GameView,
};
use crate::{
    bets::BetController,
    store::{Applied, RoundStore},
    transport::{EventStream, Transport},
    Error, Result,
};
use futures::{
    channel::{mpsc, oneshot},
    future::BoxFuture,
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use updraft_types::{
    ActiveBet, Amount, Bet, CashOutReceipt, PlaceBetReceipt, PlayerId, RoundId, Snapshot,
};

/// Number of intents to hold in the mailbox before senders block.
const MAILBOX_SIZE: usize = 64;

/// Resolution of an async request dispatched by the actor. Requests run as
/// detached futures so push events are never blocked behind them; each
/// outcome is applied against whatever state is current when it lands.
enum Outcome {
    Snapshot {
        result: Result<Snapshot>,
    },
    Placed {
        /// Round the intent was dispatched in; a receipt landing after the
        /// next betting window opened belongs to a destroyed bet.
        round_id: Option<RoundId>,
        result: Result<PlaceBetReceipt>,
        response: oneshot::Sender<Result<Bet>>,
    },
    CashedOut {
        result: Result<CashOutReceipt>,
        response: oneshot::Sender<Result<Bet>>,
    },
    Restored {
        round_id: RoundId,
        result: Result<Vec<ActiveBet>>,
    },
}

/// The engine actor: single owner of the round store and bet controller.
///
/// All mutation happens on this one task, so ordering is the only
/// concurrency concern: pushes, poll results, and intent resolutions are
/// interleaved by the select loop and each applies to current state.
pub struct Actor {
    transport: Transport,
    config: EngineConfig,
    store: RoundStore,
    bets: BetController,
    mailbox: mpsc::Receiver<Message>,
    views: watch::Sender<GameView>,
    pending: FuturesUnordered<BoxFuture<'static, Outcome>>,
    /// Deadline for clearing the "go" flourish, scoped to one round.
    go_deadline: Option<(RoundId, Instant)>,
}

impl Actor {
    /// Create the engine for one authenticated session. The caller spawns
    /// [`Actor::run`]; dropping the mailbox (or `shutdown`) stops it.
    pub fn new(
        transport: Transport,
        player: PlayerId,
        initial_balance: Amount,
        config: EngineConfig,
    ) -> (Self, Mailbox, watch::Receiver<GameView>) {
        let (sender, mailbox) = mpsc::channel(MAILBOX_SIZE);
        let store = RoundStore::new();
        let bets = BetController::new(config.bet, player, initial_balance);
        let (views, view_rx) = watch::channel(GameView::capture(&store, &bets));

        (
            Self {
                transport,
                config,
                store,
                bets,
                mailbox,
                views,
                pending: FuturesUnordered::new(),
                go_deadline: None,
            },
            Mailbox::new(sender),
            view_rx,
        )
    }

    /// Drive the event loop until shutdown. Exiting releases the stream,
    /// every timer, and the snapshot poll; nothing mutates after teardown.
    pub async fn run(mut self) {
        let mut events: Option<EventStream> = None;
        let mut reconnect_backoff = self.config.reconnect_backoff;

        let mut snapshot_tick = interval(self.config.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut countdown_tick = interval(Duration::from_secs(1));
        countdown_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // (Re)dial before selecting so the stream branch always has a
            // connection to watch. The first snapshot after a subscribe is
            // authoritative: it heals whatever a gap lost.
            if events.is_none() {
                match self.transport.connect_events().await {
                    Ok(stream) => {
                        events = Some(stream);
                        reconnect_backoff = self.config.reconnect_backoff;
                        self.dispatch_snapshot();
                    }
                    Err(err) => {
                        warn!(%err, "event stream dial failed, backing off");
                        sleep(reconnect_backoff).await;
                        reconnect_backoff = std::cmp::min(
                            reconnect_backoff.saturating_mul(2),
                            self.config.max_reconnect_backoff,
                        );
                        continue;
                    }
                }
            }
            let stream = match events.as_mut() {
                Some(stream) => stream,
                None => continue,
            };

            let go_at = self.go_deadline.map(|(_, at)| at);
            let mut disconnected = false;

            tokio::select! {
                message = self.mailbox.next() => {
                    match message {
                        Some(Message::PlaceBet { amount, response }) => {
                            self.handle_place_bet(amount, response);
                        }
                        Some(Message::CashOut { response }) => {
                            self.handle_cash_out(response);
                        }
                        Some(Message::Shutdown) | None => {
                            info!("engine shutting down");
                            return;
                        }
                    }
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => {
                            if let Some(applied) = self.store.apply(&event) {
                                self.handle_applied(applied);
                            }
                        }
                        Some(Err(Error::InvalidData(err))) => {
                            // Malformed frame: drop it, keep the connection.
                            debug!(%err, "undecodable event dropped");
                        }
                        Some(Err(err)) => {
                            warn!(%err, "event stream failed");
                            disconnected = true;
                        }
                        None => {
                            warn!("event stream ended");
                            disconnected = true;
                        }
                    }
                }
                _ = snapshot_tick.tick() => {
                    self.dispatch_snapshot();
                }
                _ = countdown_tick.tick() => {
                    // Only visible while crashed with a countdown showing;
                    // the store guards both.
                    self.store.tick_countdown();
                    self.publish();
                }
                _ = sleep_until(go_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if go_at.is_some() => {
                    if let Some((round_id, _)) = self.go_deadline.take() {
                        self.store.clear_go(round_id);
                        self.publish();
                    }
                }
                Some(outcome) = self.pending.next(), if !self.pending.is_empty() => {
                    self.handle_outcome(outcome);
                }
            }

            if disconnected {
                events = None;
            }
        }
    }

    /// Act on a store transition: settle or reset the bet, scope the timers,
    /// and kick off restoration when a round appears without a local bet.
    fn handle_applied(&mut self, applied: Applied) {
        match applied {
            Applied::NewRound(round_id) => {
                self.bets.reset_for_round(round_id);
                // Arm the flourish deadline for exactly this round; a
                // preempting transition re-arms or orphans it harmlessly.
                self.go_deadline = Some((round_id, Instant::now() + self.config.go_flag_duration));
            }
            Applied::Crashed(_) | Applied::ForcedCrash(_) => {
                self.bets.resolve_crash();
            }
            Applied::Balance(new_balance) => {
                self.bets.apply_balance(new_balance);
            }
            Applied::ForcedIdle
            | Applied::Started(_)
            | Applied::Tick(_)
            | Applied::Countdown(_)
            | Applied::BettingChanged(_) => {}
        }

        self.maybe_restore();
        self.publish();
    }

    /// Queue a restoration query if this round needs one (at most one per
    /// round, however often this is called).
    fn maybe_restore(&mut self) {
        let Some(round_id) = self
            .bets
            .restoration_needed(self.store.phase(), self.store.round_id())
        else {
            return;
        };
        debug!(%round_id, "querying active bets for restoration");
        let transport = self.transport.clone();
        self.pending.push(
            async move {
                Outcome::Restored {
                    round_id,
                    result: transport.active_bets(round_id).await,
                }
            }
            .boxed(),
        );
    }

    fn dispatch_snapshot(&mut self) {
        let transport = self.transport.clone();
        self.pending.push(
            async move {
                Outcome::Snapshot {
                    result: transport.snapshot().await,
                }
            }
            .boxed(),
        );
    }

    fn handle_place_bet(&mut self, amount: Amount, response: oneshot::Sender<Result<Bet>>) {
        // Gate locally first; a refusal costs no round-trip and leaves
        // state untouched.
        if let Err(rejection) = self.bets.check_placement(
            amount,
            self.store.phase(),
            self.store.betting_enabled(),
            self.store.running_for(),
        ) {
            let _ = response.send(Err(Error::Rejected(rejection)));
            return;
        }

        let round_id = self.store.round_id();
        let transport = self.transport.clone();
        self.pending.push(
            async move {
                Outcome::Placed {
                    round_id,
                    result: transport
                        .place_bet(updraft_types::PlaceBetRequest { amount })
                        .await,
                    response,
                }
            }
            .boxed(),
        );
    }

    fn handle_cash_out(&mut self, response: oneshot::Sender<Result<Bet>>) {
        if let Err(rejection) = self.bets.check_cash_out(self.store.phase()) {
            let _ = response.send(Err(Error::Rejected(rejection)));
            return;
        }

        let transport = self.transport.clone();
        self.pending.push(
            async move {
                Outcome::CashedOut {
                    result: transport.cash_out().await,
                    response,
                }
            }
            .boxed(),
        );
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Snapshot { result } => match result {
                Ok(snapshot) => {
                    for applied in self.store.apply_snapshot(&snapshot) {
                        self.handle_applied(applied);
                    }
                    // Even a no-change snapshot can reveal a round needing
                    // restoration (e.g. right after mount).
                    self.maybe_restore();
                    self.publish();
                }
                // State holds its last known value on poll failure.
                Err(err) => debug!(%err, "snapshot poll failed, ignored"),
            },
            Outcome::Placed {
                round_id,
                result,
                response,
            } => {
                match result {
                    Ok(receipt) => {
                        if self.store.round_id() == round_id {
                            self.bets.adopt(receipt.bet, receipt.new_balance);
                        } else {
                            // The round turned over while the request was in
                            // flight; the bet it bought is already history,
                            // but the ledger debit it reports is real.
                            debug!("bet receipt for a superseded round");
                            self.bets.apply_balance(receipt.new_balance);
                        }
                        let _ = response.send(Ok(receipt.bet));
                    }
                    Err(err) => {
                        let _ = response.send(Err(err));
                    }
                }
                self.publish();
            }
            Outcome::CashedOut { result, response } => {
                match result {
                    Ok(receipt) => match self.bets.settle_cash_out(receipt) {
                        Some(bet) => {
                            let _ = response.send(Ok(bet));
                        }
                        None => {
                            let _ = response.send(Err(Error::Rejected(
                                updraft_types::BetRejection::NoActiveBet,
                            )));
                        }
                    },
                    Err(err) => {
                        // A cash-out losing the race to the crash is not a
                        // hard failure; the crash event settles the bet.
                        let _ = response.send(Err(err));
                    }
                }
                self.publish();
            }
            Outcome::Restored { round_id, result } => {
                match result {
                    Ok(bets) => {
                        if self.store.round_id() == Some(round_id) {
                            self.bets.restore(round_id, &bets);
                        }
                    }
                    Err(err) => debug!(%err, %round_id, "restoration query failed"),
                }
                self.publish();
            }
        }
    }

    fn publish(&self) {
        self.views
            .send_if_modified(|view| {
                let current = GameView::capture(&self.store, &self.bets);
                if *view == current {
                    false
                } else {
                    *view = current;
                    true
                }
            });
    }
}
