//! Round state store: the authoritative-on-the-client view of the current
//! round, merged from push events and snapshot polls.
//!
//! Every event has one explicit, total reducer. Events are idempotent and
//! may arrive in any order relative to polls; anything bearing a round
//! identifier older than the newest one seen is dropped, and within a round
//! the phase may only advance. The store never fails its consumers: a
//! protocol anomaly is logged and ignored.

use std::time::{Duration, Instant};
use tracing::{debug, warn};
use updraft_types::{Amount, Multiplier, RoundId, RoundPhase, ServerEvent, Snapshot};

/// What a reducer did with an event, for the engine to act on (settle bets,
/// arm timers). `None` from [`RoundStore::apply`] means the event was stale
/// or malformed and was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// A betting window opened for a new round.
    NewRound(RoundId),
    /// The round launched.
    Started(RoundId),
    /// The multiplier advanced.
    Tick(Multiplier),
    /// The round crashed (server-reported).
    Crashed(RoundId),
    /// The post-crash countdown was (re)set.
    Countdown(u32),
    /// The kill-switch flipped without forcing a phase change.
    BettingChanged(bool),
    /// The kill-switch flipped off mid-round; displayed as a crash at the
    /// last known multiplier.
    ForcedCrash(Multiplier),
    /// The kill-switch flipped off during the betting window; the round is
    /// withdrawn from the client's perspective.
    ForcedIdle,
    /// Ledger balance update, passed through to the bet controller.
    Balance(Amount),
}

/// The client's view of the current round.
pub struct RoundStore {
    phase: RoundPhase,
    round_id: Option<RoundId>,
    multiplier: Multiplier,
    crash_multiplier: Option<Multiplier>,
    countdown_seconds: Option<u32>,
    betting_enabled: bool,
    /// When the current round entered `Running`, for the betting grace gate.
    running_since: Option<Instant>,
    /// Round whose "go" flourish is currently shown. Cleared by a deadline
    /// scoped to this exact round, so a stale timer cannot touch a
    /// superseded round.
    go_round: Option<RoundId>,
    /// Monotonic high-water mark of observed round identifiers. Unlike
    /// `round_id`, it survives the forced-idle transition.
    last_round_id: Option<RoundId>,
}

impl Default for RoundStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundStore {
    pub fn new() -> Self {
        Self {
            phase: RoundPhase::Idle,
            round_id: None,
            multiplier: Multiplier::ONE,
            crash_multiplier: None,
            countdown_seconds: None,
            betting_enabled: true,
            running_since: None,
            go_round: None,
            last_round_id: None,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn round_id(&self) -> Option<RoundId> {
        self.round_id
    }

    pub fn multiplier(&self) -> Multiplier {
        self.multiplier
    }

    pub fn crash_multiplier(&self) -> Option<Multiplier> {
        self.crash_multiplier
    }

    pub fn countdown_seconds(&self) -> Option<u32> {
        self.countdown_seconds
    }

    pub fn betting_enabled(&self) -> bool {
        self.betting_enabled
    }

    /// How long the current round has been running, if it is.
    pub fn running_for(&self) -> Option<Duration> {
        self.running_since.map(|since| since.elapsed())
    }

    /// Whether the "go" flourish for the current round is still showing.
    pub fn go_active(&self) -> bool {
        self.go_round.is_some()
    }

    /// Apply one push event. Returns what happened, or `None` when the event
    /// was stale and dropped.
    pub fn apply(&mut self, event: &ServerEvent) -> Option<Applied> {
        match *event {
            ServerEvent::RoundWaiting { round_id } => self.reduce_waiting(round_id),
            ServerEvent::RoundStart { round_id } => self.reduce_start(round_id),
            ServerEvent::RoundTick { multiplier } => self.reduce_tick(multiplier),
            ServerEvent::RoundCrash {
                round_id,
                crash_multiplier,
            } => self.reduce_crash(round_id, crash_multiplier),
            ServerEvent::RoundCountdown { seconds_left } => self.reduce_countdown(seconds_left),
            ServerEvent::BettingEnabled { enabled } => self.reduce_betting_enabled(enabled),
            ServerEvent::BalanceUpdated { new_balance } => Some(Applied::Balance(new_balance)),
        }
    }

    fn reduce_waiting(&mut self, round_id: RoundId) -> Option<Applied> {
        if self.is_stale(round_id, RoundPhase::Waiting) {
            return None;
        }
        self.phase = RoundPhase::Waiting;
        self.round_id = Some(round_id);
        self.last_round_id = Some(round_id);
        self.multiplier = Multiplier::ONE;
        self.crash_multiplier = None;
        self.countdown_seconds = None;
        self.running_since = None;
        self.go_round = Some(round_id);
        Some(Applied::NewRound(round_id))
    }

    fn reduce_start(&mut self, round_id: RoundId) -> Option<Applied> {
        if self.is_stale(round_id, RoundPhase::Running) {
            return None;
        }
        self.phase = RoundPhase::Running;
        self.round_id = Some(round_id);
        self.last_round_id = Some(round_id);
        self.multiplier = Multiplier::ONE;
        self.crash_multiplier = None;
        self.countdown_seconds = None;
        self.running_since = Some(Instant::now());
        // A flourish armed by an earlier round must not ride into this one.
        if self.go_round != Some(round_id) {
            self.go_round = None;
        }
        Some(Applied::Started(round_id))
    }

    fn reduce_tick(&mut self, multiplier: Multiplier) -> Option<Applied> {
        if self.phase != RoundPhase::Running {
            debug!(%multiplier, phase = ?self.phase, "tick outside running phase, dropped");
            return None;
        }
        if multiplier < self.multiplier {
            warn!(%multiplier, current = %self.multiplier, "decreasing tick, dropped");
            return None;
        }
        self.multiplier = multiplier;
        Some(Applied::Tick(multiplier))
    }

    fn reduce_crash(&mut self, round_id: RoundId, crash_multiplier: Multiplier) -> Option<Applied> {
        if self.is_stale(round_id, RoundPhase::Crashed) {
            return None;
        }
        self.phase = RoundPhase::Crashed;
        self.round_id = Some(round_id);
        self.last_round_id = Some(round_id);
        self.multiplier = crash_multiplier;
        self.crash_multiplier = Some(crash_multiplier);
        self.countdown_seconds = None;
        self.running_since = None;
        self.go_round = None;
        Some(Applied::Crashed(round_id))
    }

    fn reduce_countdown(&mut self, seconds_left: u32) -> Option<Applied> {
        self.countdown_seconds = Some(seconds_left);
        Some(Applied::Countdown(seconds_left))
    }

    fn reduce_betting_enabled(&mut self, enabled: bool) -> Option<Applied> {
        self.betting_enabled = enabled;
        if enabled {
            return Some(Applied::BettingChanged(enabled));
        }
        match self.phase {
            // The only transitions allowed to move a round "backward":
            // a running round is shown as crashed at the last multiplier,
            // a betting window is withdrawn entirely.
            RoundPhase::Running => {
                let frozen = self.multiplier;
                self.phase = RoundPhase::Crashed;
                self.crash_multiplier = Some(frozen);
                self.countdown_seconds = None;
                self.running_since = None;
                self.go_round = None;
                Some(Applied::ForcedCrash(frozen))
            }
            RoundPhase::Waiting => {
                self.phase = RoundPhase::Idle;
                self.round_id = None;
                self.multiplier = Multiplier::ONE;
                self.countdown_seconds = None;
                self.go_round = None;
                Some(Applied::ForcedIdle)
            }
            _ => Some(Applied::BettingChanged(enabled)),
        }
    }

    /// An event is stale when it names a round older than the newest one
    /// seen, or would move the phase of the current round backward. A round
    /// withdrawn by forced idle keeps its identifier consumed: redelivered
    /// events for it are dropped, only a newer round may follow.
    fn is_stale(&self, round_id: RoundId, target: RoundPhase) -> bool {
        let Some(last) = self.last_round_id else {
            return false;
        };
        if round_id < last {
            warn!(%round_id, %last, "event for superseded round, dropped");
            return true;
        }
        if round_id == last {
            if self.round_id.is_none() {
                warn!(%round_id, "event for withdrawn round, dropped");
                return true;
            }
            if target.rank() <= self.phase.rank() {
                debug!(%round_id, ?target, current = ?self.phase, "phase regression, dropped");
                return true;
            }
        }
        false
    }

    /// Merge a polled snapshot as a floor: it can fill in what pushes
    /// missed, but never rolls back a phase or round already advanced by a
    /// push. Fetch failures never reach this point; the state simply holds.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Vec<Applied> {
        let mut applied = Vec::new();

        if snapshot.betting_enabled != self.betting_enabled {
            applied.extend(self.reduce_betting_enabled(snapshot.betting_enabled));
        }

        // A missing round identifier leaves round state untouched.
        let Some(round_id) = snapshot.round_id else {
            return applied;
        };

        match self.last_round_id {
            // The snapshot is from a round we have never seen a push for:
            // adopt it wholesale.
            None => applied.extend(self.adopt_snapshot(round_id, snapshot)),
            Some(last) if round_id > last => {
                applied.extend(self.adopt_snapshot(round_id, snapshot))
            }
            // Same round: phase may only advance, multiplier only grow.
            Some(last) if round_id == last => {
                if snapshot.phase.rank() > self.phase.rank() {
                    applied.extend(match snapshot.phase {
                        RoundPhase::Running => self.reduce_start(round_id).map(|_| {
                            self.multiplier = snapshot.multiplier;
                            Applied::Started(round_id)
                        }),
                        RoundPhase::Crashed => self.reduce_crash(round_id, snapshot.multiplier),
                        _ => None,
                    });
                } else if snapshot.phase == self.phase
                    && self.phase == RoundPhase::Running
                    && snapshot.multiplier > self.multiplier
                {
                    self.multiplier = snapshot.multiplier;
                    applied.push(Applied::Tick(snapshot.multiplier));
                }
            }
            Some(last) => {
                debug!(%round_id, %last, "stale snapshot, ignored");
            }
        }

        applied
    }

    fn adopt_snapshot(&mut self, round_id: RoundId, snapshot: &Snapshot) -> Option<Applied> {
        match snapshot.phase {
            RoundPhase::Waiting => self.reduce_waiting(round_id).map(|applied| {
                // The flourish is push-scoped; a poll that happens to land
                // first should not trigger it.
                self.go_round = None;
                applied
            }),
            RoundPhase::Running => self.reduce_start(round_id).map(|applied| {
                self.multiplier = snapshot.multiplier;
                applied
            }),
            RoundPhase::Crashed => self.reduce_crash(round_id, snapshot.multiplier),
            RoundPhase::Idle => None,
        }
    }

    /// Clear the "go" flourish, but only if it still belongs to `round`.
    /// Lets a scheduled deadline fire harmlessly after its round is gone.
    pub fn clear_go(&mut self, round: RoundId) {
        if self.go_round == Some(round) {
            self.go_round = None;
        }
    }

    /// Locally advance the post-crash countdown by one second. Driven by the
    /// engine's display timer, which only runs during `Crashed`.
    pub fn tick_countdown(&mut self) {
        if self.phase == RoundPhase::Crashed {
            self.countdown_seconds = self.countdown_seconds.map(|s| s.saturating_sub(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(id: u64) -> ServerEvent {
        ServerEvent::RoundWaiting {
            round_id: RoundId(id),
        }
    }

    fn start(id: u64) -> ServerEvent {
        ServerEvent::RoundStart {
            round_id: RoundId(id),
        }
    }

    fn tick(bps: u64) -> ServerEvent {
        ServerEvent::RoundTick {
            multiplier: Multiplier::from_bps(bps),
        }
    }

    fn crash(id: u64, bps: u64) -> ServerEvent {
        ServerEvent::RoundCrash {
            round_id: RoundId(id),
            crash_multiplier: Multiplier::from_bps(bps),
        }
    }

    #[test]
    fn test_full_round_lifecycle() {
        let mut store = RoundStore::new();
        assert_eq!(store.phase(), RoundPhase::Idle);

        assert_eq!(store.apply(&waiting(1)), Some(Applied::NewRound(RoundId(1))));
        assert_eq!(store.phase(), RoundPhase::Waiting);
        assert_eq!(store.multiplier(), Multiplier::ONE);
        assert!(store.go_active());

        assert_eq!(store.apply(&start(1)), Some(Applied::Started(RoundId(1))));
        assert_eq!(store.phase(), RoundPhase::Running);

        store.apply(&tick(10_100)).unwrap();
        store.apply(&tick(34_200)).unwrap();
        assert_eq!(store.multiplier(), Multiplier::from_bps(34_200));

        assert_eq!(
            store.apply(&crash(1, 41_000)),
            Some(Applied::Crashed(RoundId(1)))
        );
        assert_eq!(store.phase(), RoundPhase::Crashed);
        assert_eq!(store.crash_multiplier(), Some(Multiplier::from_bps(41_000)));
        assert_eq!(store.multiplier(), Multiplier::from_bps(41_000));
    }

    #[test]
    fn test_round_id_is_monotone() {
        let mut store = RoundStore::new();
        store.apply(&waiting(5)).unwrap();
        store.apply(&start(5)).unwrap();

        // Anything from an older round is dropped.
        assert_eq!(store.apply(&waiting(4)), None);
        assert_eq!(store.apply(&crash(4, 20_000)), None);
        assert_eq!(store.phase(), RoundPhase::Running);
        assert_eq!(store.round_id(), Some(RoundId(5)));

        // Same round may not regress: a late duplicate waiting is dropped.
        assert_eq!(store.apply(&waiting(5)), None);
        assert_eq!(store.phase(), RoundPhase::Running);
    }

    #[test]
    fn test_monotone_guard_survives_forced_idle() {
        let mut store = RoundStore::new();
        store.apply(&waiting(9)).unwrap();
        store
            .apply(&ServerEvent::BettingEnabled { enabled: false })
            .unwrap();
        assert_eq!(store.phase(), RoundPhase::Idle);
        assert_eq!(store.round_id(), None);

        // The withdrawn round cannot sneak back in, whatever the phase.
        assert_eq!(store.apply(&waiting(9)), None);
        assert_eq!(store.apply(&start(9)), None);
        assert_eq!(store.phase(), RoundPhase::Idle);
        store
            .apply(&ServerEvent::BettingEnabled { enabled: true })
            .unwrap();
        assert_eq!(store.apply(&waiting(10)), Some(Applied::NewRound(RoundId(10))));
    }

    #[test]
    fn test_decreasing_tick_is_dropped() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        store.apply(&start(1)).unwrap();
        store.apply(&tick(25_000)).unwrap();

        assert_eq!(store.apply(&tick(20_000)), None);
        assert_eq!(store.multiplier(), Multiplier::from_bps(25_000));

        // An equal tick is idempotent, not a violation.
        assert_eq!(
            store.apply(&tick(25_000)),
            Some(Applied::Tick(Multiplier::from_bps(25_000)))
        );
    }

    #[test]
    fn test_tick_outside_running_is_dropped() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        assert_eq!(store.apply(&tick(15_000)), None);
        assert_eq!(store.multiplier(), Multiplier::ONE);
    }

    #[test]
    fn test_kill_switch_forces_crash_at_last_multiplier() {
        let mut store = RoundStore::new();
        store.apply(&waiting(2)).unwrap();
        store.apply(&start(2)).unwrap();
        store.apply(&tick(40_000)).unwrap();

        let applied = store
            .apply(&ServerEvent::BettingEnabled { enabled: false })
            .unwrap();
        assert_eq!(applied, Applied::ForcedCrash(Multiplier::from_bps(40_000)));
        assert_eq!(store.phase(), RoundPhase::Crashed);
        assert_eq!(store.crash_multiplier(), Some(Multiplier::from_bps(40_000)));
        assert!(!store.betting_enabled());
    }

    #[test]
    fn test_countdown_is_scoped_to_crashed() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        store.apply(&start(1)).unwrap();
        store.apply(&crash(1, 15_000)).unwrap();
        store
            .apply(&ServerEvent::RoundCountdown { seconds_left: 5 })
            .unwrap();
        assert_eq!(store.countdown_seconds(), Some(5));

        store.tick_countdown();
        assert_eq!(store.countdown_seconds(), Some(4));

        // A new betting window clears it.
        store.apply(&waiting(2)).unwrap();
        assert_eq!(store.countdown_seconds(), None);
    }

    #[test]
    fn test_go_flag_is_scoped_to_its_round() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        assert!(store.go_active());

        // The next round preempts the flourish before its deadline fires.
        store.apply(&start(1)).unwrap();
        store.apply(&crash(1, 12_000)).unwrap();
        store.apply(&waiting(2)).unwrap();
        assert!(store.go_active());

        // The stale deadline for round 1 must not clear round 2's flag.
        store.clear_go(RoundId(1));
        assert!(store.go_active());
        store.clear_go(RoundId(2));
        assert!(!store.go_active());
    }

    #[test]
    fn test_stale_flourish_does_not_leak_into_next_round() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        assert!(store.go_active());

        // round_crash(1) and round_waiting(2) were both lost; the launch of
        // round 2 must not inherit round 1's flourish.
        store.apply(&start(2)).unwrap();
        assert!(!store.go_active());

        // A launch of the round that armed the flourish leaves it alone;
        // its own deadline clears it.
        store.apply(&waiting(3)).unwrap();
        store.apply(&start(3)).unwrap();
        assert!(store.go_active());
    }

    #[test]
    fn test_snapshot_heals_missed_round() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();

        // Pushes for round 2 were all lost; the poll recovers it.
        let snapshot = Snapshot {
            phase: RoundPhase::Running,
            multiplier: Multiplier::from_bps(23_000),
            round_id: Some(RoundId(2)),
            betting_enabled: true,
        };
        let applied = store.apply_snapshot(&snapshot);
        assert_eq!(applied, vec![Applied::Started(RoundId(2))]);
        assert_eq!(store.phase(), RoundPhase::Running);
        assert_eq!(store.multiplier(), Multiplier::from_bps(23_000));
        // A poll never triggers the flourish.
        assert!(!store.go_active());
    }

    #[test]
    fn test_snapshot_never_rolls_back() {
        let mut store = RoundStore::new();
        store.apply(&waiting(3)).unwrap();
        store.apply(&start(3)).unwrap();
        store.apply(&tick(30_000)).unwrap();

        // Older round: ignored entirely.
        let stale = Snapshot {
            phase: RoundPhase::Crashed,
            multiplier: Multiplier::from_bps(50_000),
            round_id: Some(RoundId(2)),
            betting_enabled: true,
        };
        assert!(store.apply_snapshot(&stale).is_empty());
        assert_eq!(store.phase(), RoundPhase::Running);

        // Same round, earlier phase or smaller multiplier: a floor, so no-op.
        let behind = Snapshot {
            phase: RoundPhase::Waiting,
            multiplier: Multiplier::ONE,
            round_id: Some(RoundId(3)),
            betting_enabled: true,
        };
        assert!(store.apply_snapshot(&behind).is_empty());
        assert_eq!(store.phase(), RoundPhase::Running);
        assert_eq!(store.multiplier(), Multiplier::from_bps(30_000));

        // Same round, same phase, larger multiplier: merged.
        let ahead = Snapshot {
            phase: RoundPhase::Running,
            multiplier: Multiplier::from_bps(31_000),
            round_id: Some(RoundId(3)),
            betting_enabled: true,
        };
        assert_eq!(
            store.apply_snapshot(&ahead),
            vec![Applied::Tick(Multiplier::from_bps(31_000))]
        );
    }

    #[test]
    fn test_snapshot_with_missing_round_id_leaves_round_untouched() {
        let mut store = RoundStore::new();
        store.apply(&waiting(7)).unwrap();

        let snapshot = Snapshot {
            phase: RoundPhase::Crashed,
            multiplier: Multiplier::from_bps(99_000),
            round_id: None,
            betting_enabled: true,
        };
        assert!(store.apply_snapshot(&snapshot).is_empty());
        assert_eq!(store.round_id(), Some(RoundId(7)));
        assert_eq!(store.phase(), RoundPhase::Waiting);
    }

    #[test]
    fn test_snapshot_carries_kill_switch() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        store.apply(&start(1)).unwrap();
        store.apply(&tick(18_000)).unwrap();

        let snapshot = Snapshot {
            phase: RoundPhase::Running,
            multiplier: Multiplier::from_bps(18_000),
            round_id: Some(RoundId(1)),
            betting_enabled: false,
        };
        let applied = store.apply_snapshot(&snapshot);
        assert_eq!(
            applied,
            vec![Applied::ForcedCrash(Multiplier::from_bps(18_000))]
        );
        assert_eq!(store.phase(), RoundPhase::Crashed);
    }

    #[test]
    fn test_missed_waiting_recovered_by_start() {
        let mut store = RoundStore::new();
        store.apply(&waiting(1)).unwrap();
        store.apply(&start(1)).unwrap();
        store.apply(&crash(1, 13_000)).unwrap();

        // round_waiting(2) was lost; round_start(2) still advances.
        assert_eq!(store.apply(&start(2)), Some(Applied::Started(RoundId(2))));
        assert_eq!(store.phase(), RoundPhase::Running);
        assert_eq!(store.multiplier(), Multiplier::ONE);
        assert_eq!(store.crash_multiplier(), None);
    }
}
