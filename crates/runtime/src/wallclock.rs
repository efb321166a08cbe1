//! Wall-clock time for scheduling concerns only: heartbeats, timeouts, expiry.
//! Simulated time never reads from here.

use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Settable clock for tests. With a non-zero `tick_ms` every read advances the
/// clock, which lets timeouts fire without sleeping.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicI64,
    tick_ms: i64,
}

impl ManualTimeSource {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            tick_ms: 0,
        }
    }

    pub fn ticking(start_ms: i64, tick_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            tick_ms,
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> i64 {
        self.now_ms.fetch_add(self.tick_ms, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{ManualTimeSource, SystemTimeSource, TimeSource};

    #[test]
    fn system_time_is_after_2020() {
        assert!(SystemTimeSource.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn manual_time_only_moves_when_told() {
        let clock = ManualTimeSource::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn ticking_time_advances_per_read() {
        let clock = ManualTimeSource::ticking(0, 7);
        assert_eq!(clock.now_ms(), 0);
        assert_eq!(clock.now_ms(), 7);
        assert_eq!(clock.now_ms(), 14);
    }
}
