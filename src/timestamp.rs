use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in wall-clock time, expressed as microseconds since the Unix
/// epoch. Cheap to copy and compare; used both for the timestamp handed to
/// message callbacks and for timer scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    pub const MICROS_PER_SECOND: i64 = 1_000_000;

    pub fn now() -> Timestamp {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            micros_since_epoch: dur.as_micros() as i64,
        }
    }

    pub fn invalid() -> Timestamp {
        Timestamp {
            micros_since_epoch: 0,
        }
    }

    pub fn micros_since_epoch(self) -> i64 {
        self.micros_since_epoch
    }

    pub fn valid(self) -> bool {
        self.micros_since_epoch > 0
    }

    /// `self + delay`, saturating rather than panicking on overflow since
    /// this only ever feeds a kernel timer, never an allocation size.
    pub fn add(self, delay: Duration) -> Timestamp {
        Timestamp {
            micros_since_epoch: self
                .micros_since_epoch
                .saturating_add(delay.as_micros() as i64),
        }
    }

    /// Duration from `self` until `self`, floored at zero when `self` is
    /// already in the past relative to `now`.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let delta = self.micros_since_epoch - earlier.micros_since_epoch;
        if delta <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(delta as u64)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros_since_epoch / Self::MICROS_PER_SECOND,
            self.micros_since_epoch.rem_euclid(Self::MICROS_PER_SECOND)
        )
    }
}
