//! Wall-clock and monotonic time behind a seam so schedulers and windows can
//! be driven deterministically in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Manually-advanced clock for tests.
pub struct ManualClock {
    wall: RwLock<DateTime<Utc>>,
    base: Instant,
    offset: RwLock<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            wall: RwLock::new(start),
            base: Instant::now(),
            offset: RwLock::new(Duration::ZERO),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut wall = self.wall.write();
        *wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *self.offset.write() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.wall.write() = to;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.wall.read()
    }

    fn monotonic(&self) -> Instant {
        self.base + *self.offset.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let before = clock.monotonic();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.monotonic() - before, Duration::from_secs(90));
    }
}
