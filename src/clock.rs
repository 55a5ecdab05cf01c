use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Injectable time source. Production code uses [`SystemClock`]; tests use [`FakeClock`]
/// so debounce, backoff, echo-window and status-debounce timing can be asserted
/// deterministically instead of by sleeping (Design Notes: "tests inject a fake clock").
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A manually-advanced clock for tests.
pub struct FakeClock {
    millis: AtomicI64,
    // serializes advance() against concurrent reads in case a future caller spawns
    // threads; the engine itself is single-threaded per spec.md §5.
    guard: Mutex<()>,
}

impl FakeClock {
    pub fn new(start_ms: i64) -> Self {
        Self { millis: AtomicI64::new(start_ms), guard: Mutex::new(()) }
    }

    pub fn advance_ms(&self, delta: i64) {
        let _lock = self.guard.lock().unwrap();
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: i64) {
        let _lock = self.guard.lock().unwrap();
        self.millis.store(value, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set_ms(10_000);
        assert_eq!(clock.now_ms(), 10_000);
    }
}
