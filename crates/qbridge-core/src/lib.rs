//! Foundational utilities shared across qbridge crates.
//!
//! Provides the bounded drop-oldest queue used to hand work between the
//! webhook, translation, delivery and broadcast tasks, plus time helpers.

pub mod queue;
pub mod time_utils;

pub use queue::{BoundedQueue, PushOutcome, DEFAULT_QUEUE_CAPACITY};
pub use time_utils::{current_unix_timestamp, is_within_margin};

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    #[test]
    fn unit_current_unix_timestamp_is_positive() {
        assert!(current_unix_timestamp() > 1_600_000_000);
    }

    #[test]
    fn unit_is_within_margin_respects_threshold() {
        let now = SystemTime::now();
        let margin = Duration::from_secs(60);
        assert!(!is_within_margin(now + Duration::from_secs(120), margin, now));
        assert!(is_within_margin(now + Duration::from_secs(60), margin, now));
        assert!(is_within_margin(now + Duration::from_secs(30), margin, now));
        assert!(is_within_margin(now, margin, now));
    }
}
