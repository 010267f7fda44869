//! Time source abstraction.
//!
//! Freshness checks and retry eligibility are all computed against an injected
//! clock so tests can advance time explicitly instead of sleeping.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

/// Source of "now" for cache freshness and task eligibility.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time. The default for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Manually advanced clock for tests.
///
/// Starts at a fixed epoch; `advance_ms` moves it forward. Never moves on its
/// own.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  /// Create a clock starting at the given instant.
  pub fn at(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Create a clock at a fixed, arbitrary epoch.
  pub fn new() -> Self {
    Self::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
  }

  /// Move the clock forward by the given number of milliseconds.
  pub fn advance_ms(&self, ms: i64) {
    let mut now = self.now.lock().expect("clock lock poisoned");
    *now += Duration::milliseconds(ms);
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().expect("clock lock poisoned")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manual_clock_advances() {
    let clock = ManualClock::new();
    let t0 = clock.now();
    clock.advance_ms(1500);
    assert_eq!(clock.now() - t0, Duration::milliseconds(1500));
  }

  #[test]
  fn system_clock_moves_forward() {
    let clock = SystemClock;
    let t0 = clock.now();
    assert!(clock.now() >= t0);
  }
}
