//! Wall-clock abstraction so TOTP, token and session expiry math can be
//! exercised against a fake clock in tests (see SPEC_FULL.md section 3,
//! Design Notes "Clock").

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of the current time. `SystemClock` is used in production;
/// tests inject `FixedClock` so expiry windows are deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn unix_seconds(&self) -> i64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64
    }
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Test clock that only moves when told to. Never used outside `#[cfg(test)]`.
pub struct FixedClock {
    current: std::sync::Mutex<SystemTime>,
}

impl FixedClock {
    pub fn new(at: SystemTime) -> Self {
        FixedClock {
            current: std::sync::Mutex::new(at),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.current.lock().unwrap();
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        *self.current.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_on_demand() {
        let clock = FixedClock::new(UNIX_EPOCH + Duration::from_secs(1_000));
        assert_eq!(clock.unix_seconds(), 1_000);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.unix_seconds(), 1_030);
    }
}
