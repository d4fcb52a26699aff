//! Wall-clock helpers for event timestamps and credential expiry math.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds as carried by OneBot `time` fields.
pub fn current_unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Returns true when `now` has reached `expires_at - margin`.
///
/// Tokens close to expiry are treated as stale so callers refresh before the
/// vendor starts rejecting them.
pub fn is_within_margin(expires_at: SystemTime, margin: Duration, now: SystemTime) -> bool {
    match expires_at.checked_sub(margin) {
        Some(threshold) => now >= threshold,
        None => true,
    }
}
