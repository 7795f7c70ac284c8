use std::fmt::Debug;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source used for duration polling and busy-wait pacing.
///
/// `now` is measured from an origin fixed when the clock is created and never
/// goes backwards.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/**
Deterministic clock: every reading returns the current time and then moves it
forward by `step`.

Loops polling a `ManualClock` therefore always make progress without any real
time passing. With a zero step only `advance` moves time, and a busy-wait on a
future deadline would never return.
*/
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
    step: u64,
}

impl ManualClock {
    pub fn new(step: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(0),
            step: step.as_nanos() as u64,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Current time, without stepping.
    pub fn peek(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.fetch_add(self.step, Ordering::SeqCst))
    }
}

/// Spins until `clock` reaches `deadline`. Sleeping is far too coarse for
/// microsecond pacing, hence the busy loop.
pub fn busy_wait_until(clock: &dyn Clock, deadline: Duration) {
    while clock.now() < deadline {
        spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_steps_on_read() {
        let clock = ManualClock::new(Duration::from_nanos(10));
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(clock.now(), Duration::from_nanos(10));
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.peek(), Duration::from_nanos(1020));
    }

    #[test]
    fn busy_wait_reaches_deadline() {
        let clock = ManualClock::new(Duration::from_nanos(100));
        busy_wait_until(&clock, Duration::from_micros(5));
        assert!(clock.peek() >= Duration::from_micros(5));
        // A deadline in the past returns after a single reading.
        let before = clock.peek();
        busy_wait_until(&clock, Duration::ZERO);
        assert_eq!(clock.peek(), before + Duration::from_nanos(100));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
