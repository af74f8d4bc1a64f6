//! Bounded retry with capped exponential backoff.
//!
//! Deliberately policy-free: callers decide which operations are worth
//! retrying, this helper only bounds attempts and paces them.

use std::thread;
use std::time::Duration;

use super::DeviceError;

/// Ceiling for a single backoff pause.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Runs `op` up to `attempts` times, sleeping `backoff` (doubling, capped
/// at one second) between attempts. Returns the first success or the last
/// error.
///
/// # Panics
///
/// Panics if `attempts` is zero.
pub fn retry<T>(
    attempts: u32,
    backoff: Duration,
    mut op: impl FnMut() -> Result<T, DeviceError>,
) -> Result<T, DeviceError> {
    assert!(attempts > 0, "attempts must be > 0");

    let mut delay = backoff;
    let mut last = DeviceError::NotAvailable;

    for attempt in 0..attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => last = e,
        }

        if attempt + 1 < attempts {
            thread::sleep(delay);
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_success() {
        let mut calls = 0;
        let result = retry(3, Duration::ZERO, || {
            calls += 1;
            Ok::<_, DeviceError>(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_until_success() {
        let mut calls = 0;
        let result = retry(3, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(DeviceError::Timeout)
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausts_attempts_and_returns_last_error() {
        let mut calls = 0;
        let result: Result<(), _> = retry(3, Duration::ZERO, || {
            calls += 1;
            Err(DeviceError::Transient(format!("attempt {calls}")))
        });
        assert_eq!(calls, 3);
        assert_eq!(result, Err(DeviceError::Transient("attempt 3".into())));
    }

    #[test]
    #[should_panic]
    fn zero_attempts_panics() {
        let _ = retry(0, Duration::ZERO, || Ok::<_, DeviceError>(()));
    }
}
