//! Sync health as a pure function of time.

use crate::Timestamp;
use std::time::Duration;

/// How many intervals may pass without a successful cycle before the service
/// is reported unhealthy.
pub const HEALTH_INTERVAL_FACTOR: u32 = 2;

/// Time elapsed since the last successful cycle, if there ever was one.
///
/// A last-sync time in the future (clock skew) counts as zero elapsed time.
pub fn elapsed_since(last_sync: Option<Timestamp>, now: Timestamp) -> Option<Duration> {
    last_sync.map(|last| Duration::from_millis(now.saturating_sub(last)))
}

/// Healthy iff the last success is less than twice the interval ago.
///
/// A service that has never completed a cycle is unhealthy.
pub fn is_healthy(elapsed: Option<Duration>, interval: Duration) -> bool {
    match elapsed {
        Some(elapsed) => match interval.checked_mul(HEALTH_INTERVAL_FACTOR) {
            Some(limit) => elapsed < limit,
            None => true,
        },
        None => false,
    }
}
