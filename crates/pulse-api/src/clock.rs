//! Server-side timestamps for points sent without one.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Hands out strictly increasing microsecond timestamps, so that points
/// stamped by the server never share a `(run, metric, time)` identity.
#[derive(Debug, Default)]
pub struct IngestClock {
    last: AtomicI64,
}

impl IngestClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `n` consecutive timestamps and return the first. Each
    /// reservation starts at or after the wall clock and after every
    /// previous reservation.
    pub fn reserve(&self, n: usize) -> i64 {
        let n = n.max(1) as i64;
        let now = Utc::now().timestamp_micros();
        let mut start = 0;
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                start = now.max(last.saturating_add(1));
                Some(start + n - 1)
            });
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_never_overlap() {
        let clock = IngestClock::new();
        let a = clock.reserve(3);
        let b = clock.reserve(2);
        let c = clock.reserve(1);
        assert!(b >= a + 3);
        assert!(c >= b + 2);
    }

    #[test]
    fn starts_near_wall_clock() {
        let clock = IngestClock::new();
        let before = Utc::now().timestamp_micros();
        let t = clock.reserve(1);
        assert!(t >= before);
    }
}
