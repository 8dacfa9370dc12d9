//! Monotonic time and deadline arithmetic

use std::time::{Duration, Instant};

/// The engine's notion of "now". Step functions accept an explicit instant
/// so callers (and tests) control the clock; this is the convenience source
/// for the wrappers that do not.
pub fn now() -> Instant {
    Instant::now()
}

/// Per-attempt timeout with one doubling for every complete pass through
/// the server list.
///
/// The doubling is a left shift of the millisecond value, saturating at
/// `u64::MAX` instead of wrapping, so a deadline can never move backwards
/// no matter how many rounds a query survives.
pub fn backoff_timeout(base: Duration, try_count: usize, nservers: usize) -> Duration {
    let rounds = (try_count / nservers.max(1)) as u32;
    let base_ms = base.as_millis() as u64;
    let ms = if rounds == 0 {
        base_ms
    } else if rounds >= base_ms.leading_zeros() {
        u64::MAX
    } else {
        base_ms << rounds
    };
    Duration::from_millis(ms)
}
