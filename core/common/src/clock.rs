//! Wall-clock abstraction so expiry and timestamps can be driven in tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the given epoch milliseconds.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Move the clock forward, stopping at the latest representable time.
    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        let next = Duration::from_std(by)
            .ok()
            .and_then(|by| now.checked_add_signed(by))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        *now = next;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_millis(1_000);
        clock.advance(std::time::Duration::from_millis(500));
        assert_eq!(clock.now_millis(), 1_500);
    }

    #[test]
    fn test_manual_clock_advance_saturates() {
        let clock = ManualClock::at_millis(0);
        clock.advance(std::time::Duration::from_secs(10_000_000_000_000));
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
        clock.advance(std::time::Duration::from_secs(1));
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::at_millis(0);
        let other = clock.clone();
        clock.advance(std::time::Duration::from_secs(2));
        assert_eq!(other.now_millis(), 2_000);
    }
}
