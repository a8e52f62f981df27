//! Wall-clock helpers. All coordinator timestamps are milliseconds since the
//! Unix epoch so they survive a round trip through the state store.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Milliseconds in a duration, as used by the coordinator's timestamp math.
#[must_use]
pub const fn duration_ms(d: Duration) -> u128 {
    d.as_millis()
}

/// Elapsed milliseconds between `since` and `now`, saturating at zero when the
/// clock went backwards.
#[must_use]
pub const fn elapsed_ms(since: u128, now: u128) -> u128 {
    now.saturating_sub(since)
}
