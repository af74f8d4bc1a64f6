//! Injectable clock for hysteresis, guard, and session timers.
//!
//! The control loop never reads `Instant::now()` directly; everything goes
//! through a [`Clock`] so tests can drive time explicitly.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use gridpilot::core::clock::Clock;
//!
//! let clock = Clock::manual();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(30));
//! assert_eq!(clock.since(start), Duration::from_secs(30));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A monotonic clock, either backed by the system or manually advanced.
#[derive(Clone)]
pub enum Clock {
    /// Reads `Instant::now()`.
    System,
    /// Fixed instant advanced explicitly via [`Clock::advance`].
    Manual(Arc<Mutex<Instant>>),
}

impl Clock {
    /// Creates a system-backed clock.
    pub fn system() -> Self {
        Clock::System
    }

    /// Creates a manual clock frozen at the current instant.
    pub fn manual() -> Self {
        Clock::Manual(Arc::new(Mutex::new(Instant::now())))
    }

    /// Returns the current instant.
    pub fn now(&self) -> Instant {
        match self {
            Clock::System => Instant::now(),
            Clock::Manual(t) => *t.lock(),
        }
    }

    /// Returns the time elapsed since `earlier`, zero if `earlier` is in
    /// the future.
    pub fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }

    /// Advances a manual clock.
    ///
    /// # Panics
    ///
    /// Panics when called on a system clock.
    pub fn advance(&self, d: Duration) {
        match self {
            Clock::System => panic!("cannot advance the system clock"),
            Clock::Manual(t) => {
                let mut t = t.lock();
                *t += d;
            }
        }
    }
}
