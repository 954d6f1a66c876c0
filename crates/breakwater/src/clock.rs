//! Time abstraction shared by every time-sensitive policy
//!
//! Policies never read the system clock directly. They go through the [`Clock`]
//! trait so production code uses real time while tests drive timeout behavior
//! deterministically with [`MockClock`], without actual delays.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Trait for time operations to enable deterministic testing
pub trait Clock: Send + Sync {
    /// Get current instant (monotonic time)
    fn now(&self) -> Instant;

    /// Get current system time (wall clock)
    fn system_time(&self) -> SystemTime;

    /// Get milliseconds since UNIX epoch
    fn millis_since_epoch(&self) -> u64 {
        self.system_time().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

/// Real system clock implementation for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn system_time(&self) -> SystemTime {
        (**self).system_time()
    }
}

/// Mock clock for deterministic testing
///
/// Allows tests to control time progression without actual delays. Clones
/// share the same elapsed counter, so a test can keep one handle and hand
/// another to the policy under test.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += duration;
        }
    }

    /// Advance the mock clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Set the mock clock to a specific elapsed time
    pub fn set_elapsed(&self, duration: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed = duration;
        }
    }

    /// Get the current elapsed time
    pub fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or(Duration::ZERO)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let elapsed = self.elapsed.lock().map(|e| *e).unwrap_or(Duration::ZERO);
        self.start + elapsed
    }

    fn system_time(&self) -> SystemTime {
        let elapsed = self.elapsed.lock().map(|e| *e).unwrap_or(Duration::ZERO);
        SystemTime::UNIX_EPOCH + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let now1 = clock.now();
        let now2 = clock.now();
        assert!(now2 >= now1, "System clock should advance");
    }

    #[test]
    fn test_system_clock_system_time() {
        let clock = SystemClock;
        let time = clock.system_time();
        assert!(time > SystemTime::UNIX_EPOCH, "System time should be after Unix epoch");
    }

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(5));
        let after = clock.now();

        assert_eq!(
            after.duration_since(start),
            Duration::from_secs(5),
            "Mock clock should advance by specified duration"
        );
    }

    #[test]
    fn test_mock_clock_set_elapsed() {
        let clock = MockClock::new();

        clock.set_elapsed(Duration::from_secs(10));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));

        clock.set_elapsed(Duration::from_secs(20));
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn test_mock_clock_millis_since_epoch() {
        let clock = MockClock::new();
        clock.set_elapsed(Duration::from_millis(5000));
        assert_eq!(clock.millis_since_epoch(), 5000);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock1 = MockClock::new();
        clock1.advance(Duration::from_secs(10));

        let clock2 = clock1.clone();
        assert_eq!(clock2.elapsed(), Duration::from_secs(10));

        clock2.advance(Duration::from_secs(5));
        assert_eq!(clock1.elapsed(), Duration::from_secs(15));
        assert_eq!(clock2.elapsed(), Duration::from_secs(15));
    }
}
