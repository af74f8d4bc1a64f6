//! Time-bounded memoization for expensive device reads.
//!
//! Polled capabilities behind slow protocols (HTTP, Modbus) are wrapped so
//! the tick cadence does not amplify request load: the first caller in a
//! TTL window performs the real read, everyone else gets the same result —
//! including the same error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{DeviceError, Meter};
use crate::core::clock::Clock;

type Fetch<T> = Box<dyn Fn() -> Result<T, DeviceError> + Send + Sync>;

/// A TTL-bounded memoizer around a fallible fetch.
pub struct Cached<T: Clone> {
    clock: Clock,
    ttl: Duration,
    fetch: Fetch<T>,
    state: Mutex<Option<(Instant, Result<T, DeviceError>)>>,
}

impl<T: Clone> Cached<T> {
    /// Wraps `fetch` with a `ttl`-bounded cache.
    pub fn new(
        clock: Clock,
        ttl: Duration,
        fetch: impl Fn() -> Result<T, DeviceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            clock,
            ttl,
            fetch: Box::new(fetch),
            state: Mutex::new(None),
        }
    }

    /// Returns the cached value if fresh, otherwise fetches and caches.
    ///
    /// The internal lock is held across the fetch, so concurrent callers in
    /// the same window observe a single in-flight request per resource.
    pub fn get(&self) -> Result<T, DeviceError> {
        let mut state = self.state.lock();

        if let Some((at, value)) = state.as_ref() {
            if self.clock.since(*at) < self.ttl {
                return value.clone();
            }
        }

        let value = (self.fetch)();
        *state = Some((self.clock.now(), value.clone()));
        value
    }
}

/// A power meter wrapped in a [`Cached`] provider.
pub struct CachedMeter {
    inner: Cached<f64>,
}

impl CachedMeter {
    /// Wraps `meter` so reads within `ttl` share one underlying request.
    pub fn new(clock: Clock, ttl: Duration, meter: Arc<dyn Meter>) -> Self {
        Self {
            inner: Cached::new(clock, ttl, move || meter.current_power()),
        }
    }
}

impl Meter for CachedMeter {
    fn current_power(&self) -> Result<f64, DeviceError> {
        self.inner.get()
    }
}
