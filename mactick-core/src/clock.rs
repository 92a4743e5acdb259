//! Monotonic clocks and cooperative cancellation
//!
//! The tick and watchdog loops never touch `Instant` or `thread::sleep`
//! directly. They go through [`Clock`] so tests can drive them with a
//! [`ManualClock`] whose sleeps advance virtual time instantly.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic time source that can also put the calling thread to sleep.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Block the caller for `duration`.
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

// ============================================================================
// Host clock
// ============================================================================

/// Wall-clock backed monotonic clock.
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

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// Simulated clock
// ============================================================================

/// Virtual clock: `sleep` returns immediately after advancing `now`.
///
/// Clones share the same timeline, so a test can hold one handle and jump
/// time forward while a loop sleeps on another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jump the timeline forward without anyone sleeping (host suspend).
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag shared between a loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.sleep(Duration::from_micros(16625));
        assert_eq!(other.now(), Duration::from_micros(16625));

        other.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_micros(5_016_625));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        clock.sleep(Duration::from_millis(1));
        assert!(clock.now() > a);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let seen_by_loop = token.clone();
        assert!(!seen_by_loop.is_cancelled());
        token.cancel();
        assert!(seen_by_loop.is_cancelled());
    }
}
