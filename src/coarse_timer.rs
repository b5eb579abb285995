//! The coarse time source used for backoff, timeouts and lamp cadence.
//!
//! A hardware timer interrupt calls [CoarseTimer::tick] every 100µs; everyone
//! else reads. The counter wraps after about five days, and all elapsed-time
//! arithmetic is performed with wrapping unsigned math so a single wrap is
//! handled correctly.

use core::sync::atomic::{AtomicU32, Ordering};

/// An opaque timestamp captured from [CoarseTimer::now].
pub type TimerValue = u32;

/// Ticks per millisecond of the coarse timer.
pub const TICKS_PER_MILLI: u32 = 10;

pub const fn ticks_from_millis(millis: u32) -> u32 {
    millis * TICKS_PER_MILLI
}

pub struct CoarseTimer {
    counter: AtomicU32,
}

impl CoarseTimer {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Advance the counter by one tick. Called from the timer interrupt;
    /// this is the only writer.
    pub fn tick(&self) {
        // Single-writer, so load + store does not lose ticks. The release
        // store pairs with the acquire load in now().
        let count = self.counter.load(Ordering::Relaxed);
        self.counter.store(count.wrapping_add(1), Ordering::Release);
    }

    pub fn now(&self) -> TimerValue {
        self.counter.load(Ordering::Acquire)
    }

    /// Ticks since `start`, correct across one counter wrap.
    pub fn elapsed(&self, start: TimerValue) -> u32 {
        self.now().wrapping_sub(start)
    }

    /// Ticks between two captured values.
    pub fn delta(&self, start: TimerValue, end: TimerValue) -> u32 {
        end.wrapping_sub(start)
    }

    /// True once strictly more than `duration` ticks have passed since
    /// `start`. The strict comparison matters: with >=, arming just before
    /// a tick boundary would fire almost a full tick early.
    pub fn has_elapsed(&self, start: TimerValue, duration: u32) -> bool {
        if duration == 0 {
            return true;
        }
        self.now().wrapping_sub(start) > duration
    }

    /// Test injection point.
    pub fn set_counter(&self, count: u32) {
        self.counter.store(count, Ordering::Release);
    }
}

impl Default for CoarseTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_elapsed_is_strict() {
        let clock = CoarseTimer::new();
        clock.set_counter(100);

        assert!(!clock.has_elapsed(100, 5));
        clock.set_counter(105);
        assert!(!clock.has_elapsed(100, 5));
        clock.set_counter(106);
        assert!(clock.has_elapsed(100, 5));
    }

    #[test]
    fn zero_duration_has_always_elapsed() {
        let clock = CoarseTimer::new();
        assert!(clock.has_elapsed(0, 0));
        assert!(clock.has_elapsed(u32::MAX, 0));
    }

    #[test]
    fn elapsed_across_wrap() {
        let clock = CoarseTimer::new();
        clock.set_counter(u32::MAX - 1);
        let start = clock.now();

        for _ in 0..4 {
            clock.tick();
        }

        assert_eq!(clock.now(), 2);
        assert_eq!(clock.elapsed(start), 4);
        assert!(clock.has_elapsed(start, 3));
        assert!(!clock.has_elapsed(start, 4));
    }

    #[test]
    fn delta_across_wrap() {
        let clock = CoarseTimer::new();
        assert_eq!(clock.delta(u32::MAX - 2, 7), 10);
        assert_eq!(clock.delta(5, 15), 10);
    }

    #[test]
    fn tick_conversion() {
        assert_eq!(ticks_from_millis(1), 10);
        assert_eq!(ticks_from_millis(1000), 10_000);
    }
}
