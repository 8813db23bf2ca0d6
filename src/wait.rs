//! Userspace wait discipline shared by every blocking operation.
//!
//! There is no kernel-scheduled wait anywhere in this crate: a "block" is a
//! spin with exponential backoff, starting at 100 µs and doubling up to a
//! 1 ms ceiling. The schedule keeps idle CPU acceptable while bounding the
//! wakeup latency a peer observes after a publish.

use std::thread;
use std::time::{Duration, Instant};

/// First sleep of the backoff schedule.
pub const BACKOFF_INITIAL: Duration = Duration::from_micros(100);

/// Ceiling of the backoff schedule.
pub const BACKOFF_MAX: Duration = Duration::from_millis(1);

/// Exponential backoff state for one wait loop.
///
/// Each `pause()` sleeps the current interval, then doubles it (capped at
/// [`BACKOFF_MAX`]). A fresh `Backoff` is created per logical wait so a
/// second wait on the same object starts over at 100 µs.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff {
            current: BACKOFF_INITIAL,
        }
    }

    /// Sleep the current interval and advance the schedule.
    pub(crate) fn pause(&mut self) {
        thread::sleep(self.current);
        self.current = (self.current * 2).min(BACKOFF_MAX);
    }
}

/// Optional timeout bound for a wait loop.
///
/// `Deadline::new(None)` never expires; `Deadline::new(Some(d))` expires
/// `d` after construction. Timeout checks use a monotonic clock.
pub(crate) struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub(crate) fn new(limit: Option<Duration>) -> Self {
        Deadline {
            start: Instant::now(),
            limit,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        match self.limit {
            Some(limit) => self.start.elapsed() >= limit,
            None => false,
        }
    }
}

/// Wall-clock microseconds since the Unix epoch, for completion stamps.
pub(crate) fn epoch_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_ceiling() {
        let mut b = Backoff::new();
        assert_eq!(b.current, BACKOFF_INITIAL);
        b.current = BACKOFF_MAX / 2;
        b.pause();
        assert_eq!(b.current, BACKOFF_MAX);
        b.pause();
        assert_eq!(b.current, BACKOFF_MAX);
    }

    #[test]
    fn deadline_none_never_expires() {
        let d = Deadline::new(None);
        assert!(!d.expired());
    }

    #[test]
    fn deadline_zero_expires_immediately() {
        let d = Deadline::new(Some(Duration::ZERO));
        assert!(d.expired());
    }

    #[test]
    fn epoch_micros_is_monotonic_enough() {
        let a = epoch_micros();
        let b = epoch_micros();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000); // after Sep 2020
    }
}
