//! Synthetic charge meter, rater, and timer.
//!
//! When the charger hardware lacks a capability, one of these wrappers is
//! attached to the loadpoint bus and synthesizes it from published events:
//! the meter from the commanded current, the rater by integrating charge
//! power over wall-clock time, the timer from start/stop edges.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::clock::Clock;
use crate::device::{self, DeviceError, Meter};

/// Synthetic charge meter fed from commanded current.
///
/// The publisher converts the effective current to power (`current × phases
/// × voltage`) before it arrives here; a disabled charger or a pilot state
/// other than `C` publishes zero.
#[derive(Default)]
pub struct ChargeMeter {
    power: Mutex<f64>,
}

impl ChargeMeter {
    /// Creates a meter reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the synthesized power in watts.
    pub fn set_power(&self, watts: f64) {
        *self.power.lock() = watts;
    }
}

impl Meter for ChargeMeter {
    fn current_power(&self) -> Result<f64, DeviceError> {
        Ok(*self.power.lock())
    }
}

struct RaterState {
    charging: bool,
    power_w: f64,
    last: Option<Instant>,
    energy_wh: f64,
}

/// Synthetic charge rater: integrates published charge power between the
/// start and stop edges of a charge cycle.
pub struct ChargeRater {
    clock: Clock,
    state: Mutex<RaterState>,
}

impl ChargeRater {
    /// Creates a rater with no energy accumulated.
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            state: Mutex::new(RaterState {
                charging: false,
                power_w: 0.0,
                last: None,
                energy_wh: 0.0,
            }),
        }
    }

    /// Begins a charge cycle, resetting the accumulated energy.
    pub fn start_charge(&self) {
        let mut state = self.state.lock();
        state.charging = true;
        state.energy_wh = 0.0;
        state.last = Some(self.clock.now());
    }

    /// Ends the charge cycle. The accumulated energy remains readable
    /// until the next start.
    pub fn stop_charge(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        integrate(&mut state, now);
        state.charging = false;
        state.last = None;
    }

    /// Records a new charge power sample in watts.
    ///
    /// The previous sample is held constant over the elapsed interval.
    pub fn set_charge_power(&self, watts: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        integrate(&mut state, now);
        state.power_w = watts;
        state.last = Some(now);
    }
}

/// Accumulates the held power over the interval since the last sample.
fn integrate(state: &mut RaterState, now: Instant) {
    if state.charging {
        if let Some(last) = state.last {
            let hours = now.saturating_duration_since(last).as_secs_f64() / 3600.0;
            state.energy_wh += state.power_w * hours;
        }
    }
}

impl device::ChargeRater for ChargeRater {
    fn charged_energy(&self) -> Result<f64, DeviceError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        integrate(&mut state, now);
        if state.charging {
            state.last = Some(now);
        }
        Ok(state.energy_wh / 1e3)
    }
}

struct TimerState {
    started: Option<Instant>,
    accumulated: Duration,
}

/// Synthetic charge timer: wall-clock duration of the current charge
/// cycle.
pub struct ChargeTimer {
    clock: Clock,
    state: Mutex<TimerState>,
}

impl ChargeTimer {
    /// Creates a timer with no time accumulated.
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            state: Mutex::new(TimerState {
                started: None,
                accumulated: Duration::ZERO,
            }),
        }
    }

    /// Begins a charge cycle, resetting the accumulated duration.
    pub fn start_charge(&self) {
        let mut state = self.state.lock();
        state.accumulated = Duration::ZERO;
        state.started = Some(self.clock.now());
    }

    /// Ends the charge cycle, folding the running interval into the total.
    pub fn stop_charge(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(started) = state.started.take() {
            state.accumulated += now.saturating_duration_since(started);
        }
    }
}

impl device::ChargeTimer for ChargeTimer {
    fn charging_time(&self) -> Result<Duration, DeviceError> {
        let state = self.state.lock();
        let mut total = state.accumulated;
        if let Some(started) = state.started {
            total += self.clock.since(started);
        }
        Ok(total)
    }
}
