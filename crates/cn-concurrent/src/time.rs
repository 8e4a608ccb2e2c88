//! Clocks.
//!
//! Agents read the monotonic clock once per duty cycle and cache it so the
//! many time checks within a cycle cost a relaxed load.  Cached values are
//! shared between components via `Arc<CachedClock>`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Monotonic nanosecond clock anchored at process start.
pub struct NanoClock {
    origin: Instant,
}

impl Default for NanoClock {
    fn default() -> Self {
        NanoClock {
            origin: Instant::now(),
        }
    }
}

impl NanoClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Wall-clock milliseconds since the UNIX epoch.
pub struct EpochClock;

impl EpochClock {
    pub fn millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock value updated by one agent and read by many.
#[derive(Default)]
pub struct CachedClock {
    value: AtomicI64,
}

impl CachedClock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn update(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nano_clock_is_monotonic() {
        let clock = NanoClock::new();
        let a = clock.nanos();
        let b = clock.nanos();
        assert!(b >= a);
    }

    #[test]
    fn cached_clock_round_trips() {
        let cached = CachedClock::new();
        cached.update(12345);
        assert_eq!(cached.get(), 12345);
    }
}
