use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// A scheduled callback, optionally repeating. Ordered by `expiration` for insertion into the
/// [`crate::timer_queue::TimerQueue`]'s ordered map; `sequence` breaks ties between timers
/// that expire at the identical instant and gives every timer a stable cancel-able identity.
pub struct Timer {
    callback: TimerCallback,
    expiration: Instant,
    interval: Duration,
    repeat: bool,
    sequence: i64,
}

impl Timer {
    pub fn new(callback: TimerCallback, expiration: Instant, interval: Duration) -> Timer {
        Timer {
            callback,
            expiration,
            repeat: !interval.is_zero(),
            interval,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn run(&mut self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Re-arm a repeating timer for its next interval in place, preserving its identity.
    pub fn reset(&mut self, now: Instant) {
        self.expiration = now + self.interval;
    }
}

/// Opaque handle returned by timer-scheduling calls, usable only with
/// [`crate::timer_queue::TimerQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: i64,
}

impl TimerId {
    pub(crate) fn new(sequence: i64) -> TimerId {
        TimerId { sequence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_monotonic() {
        let now = Instant::now();
        let a = Timer::new(Box::new(|| {}), now, Duration::ZERO);
        let b = Timer::new(Box::new(|| {}), now, Duration::ZERO);
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn reset_advances_by_interval() {
        let now = Instant::now();
        let mut t = Timer::new(Box::new(|| {}), now, Duration::from_millis(50));
        t.reset(now);
        assert_eq!(t.expiration(), now + Duration::from_millis(50));
    }
}
