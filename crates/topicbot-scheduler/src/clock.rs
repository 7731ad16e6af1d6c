//! Injectable wall-clock source.

use chrono::{DateTime, Utc};

/// Source of the current time. The scheduler loop reads the clock at its
/// top level only; everything below takes `now` as an explicit argument.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
