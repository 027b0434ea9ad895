use crate::round::Amount;
use std::time::Duration;

/// Minimum stake per bet, in minor units (10.00 chips).
pub const MIN_STAKE: Amount = 1_000;

/// Delay after a round enters `running` during which new bets are still
/// rejected client-side. Tuned empirically; the server's acceptance window
/// is authoritative.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Interval of the authoritative snapshot poll that heals missed pushes.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

/// Lifetime of the transient "go" flourish shown when a betting window opens.
pub const DEFAULT_GO_FLAG_DURATION: Duration = Duration::from_millis(800);

/// Display ceiling of the multiplier curve (16.00x). Values above it pin the
/// marker to the top-right corner.
pub const DEFAULT_DISPLAY_CEILING: f64 = 16.0;
