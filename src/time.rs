use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microsecond-resolution wall-clock instant.
///
/// `Timestamp` is the value handed to `message_cb` and friends; it answers "what time did
/// the kernel hand us this data", not "how long until the next timer fires" (that math runs
/// on `std::time::Instant`, see [`crate::timer_queue`]).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

const MICROS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    pub const INVALID: Timestamp = Timestamp {
        micros_since_epoch: 0,
    };

    pub fn now() -> Timestamp {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            micros_since_epoch: dur.as_micros() as i64,
        }
    }

    pub fn from_micros_since_epoch(micros: i64) -> Timestamp {
        Timestamp {
            micros_since_epoch: micros,
        }
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }

    pub fn seconds_since_epoch(&self) -> f64 {
        self.micros_since_epoch as f64 / MICROS_PER_SECOND as f64
    }

    pub fn valid(&self) -> bool {
        self.micros_since_epoch > 0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::INVALID
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timestamp({}.{:06})",
            self.micros_since_epoch / MICROS_PER_SECOND,
            self.micros_since_epoch % MICROS_PER_SECOND
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_micros() {
        let a = Timestamp::from_micros_since_epoch(100);
        let b = Timestamp::from_micros_since_epoch(200);
        assert!(a < b);
    }

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Timestamp::INVALID.valid());
        assert!(Timestamp::now().valid());
    }
}
