//! Window lifetime arithmetic.

use std::time::Duration;

/// Seconds a freshly created counter should live.
///
/// Unaligned windows live a full period from their first increment. Aligned
/// windows end at the next multiple of `period_secs` since the Unix epoch, so
/// the result is in `1..=period_secs`.
pub fn window_ttl(now: Duration, period_secs: u64, align: bool) -> u64 {
    if !align || period_secs == 0 {
        return period_secs;
    }
    period_secs - now.as_secs() % period_secs
}
