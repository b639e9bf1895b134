//! Wall clock and timestamp normalization.
//!
//! Every timestamp that enters a log entry is truncated to microseconds, the
//! precision of the relational store, so that a hash computed before writing
//! still matches after reading the entry back.

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Truncates a timestamp to microsecond precision.
#[must_use]
pub fn normalize(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// Commit time of the next log entry: now, but strictly after `previous`.
#[must_use]
pub fn next_insertion(now: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = normalize(now);
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_drops_nanoseconds() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(normalize(at).timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn test_insertion_is_strictly_increasing() {
        let previous = Utc.timestamp_opt(1_700_000_000, 5_000).unwrap();
        let stale = Utc.timestamp_opt(1_699_999_999, 0).unwrap();
        assert_eq!(
            next_insertion(stale, Some(previous)),
            previous + Duration::microseconds(1)
        );
        let later = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        assert_eq!(next_insertion(later, Some(previous)), later);
        assert_eq!(next_insertion(later, None), later);
    }
}
