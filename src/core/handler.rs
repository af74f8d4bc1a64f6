//! Charger command discipline: cached enable state, setpoint tracking,
//! guard timing, and ramping.
//!
//! The handler is the only writer to its charger. Each ramp call issues at
//! most one device write; enable transitions always pass through the
//! minimum-current setpoint so the contactor never switches under high
//! load.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::types::ChargeStatus;
use crate::device::{ChargerDevice, DeviceError};

/// Static handler parameters, copied from the loadpoint configuration and
/// overridden by device-reported limits where available.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Minimum charge current in amperes.
    pub min_current: i64,
    /// Maximum charge current in amperes.
    pub max_current: i64,
    /// Smallest setpoint delta worth a device write, in amperes.
    pub sensitivity: i64,
    /// Minimum interval between two non-forced device writes.
    pub guard_duration: Duration,
}

/// Owns a charger and mediates all commands to it.
pub struct ChargerHandler {
    clock: Clock,
    charger: ChargerDevice,
    cfg: HandlerConfig,

    enabled: bool,
    setpoint: i64,
    guard_updated: Option<Instant>,
}

impl ChargerHandler {
    /// Creates a handler around `charger`.
    pub fn new(clock: Clock, charger: ChargerDevice, cfg: HandlerConfig) -> Self {
        Self {
            clock,
            charger,
            cfg,
            enabled: false,
            setpoint: 0,
            guard_updated: None,
        }
    }

    /// Synchronizes the cached state with the device at startup.
    ///
    /// Reads the device enable flag and writes the minimum-current setpoint
    /// so later enable transitions start from a known value. An enabled
    /// charger stamps the guard to avoid toggling right after restart.
    pub fn prepare(&mut self) {
        match self.charger.enabled() {
            Ok(enabled) => {
                self.enabled = enabled;
                info!(enabled, "charger state");
                if enabled {
                    self.guard_updated = Some(self.clock.now());
                }
            }
            Err(err) => warn!("charger enabled state: {err}"),
        }

        if let Err(err) = self.write_current(self.cfg.min_current) {
            warn!("charger setpoint: {err}");
        }
    }

    /// Reads the pilot state from the device.
    pub fn status(&self) -> Result<ChargeStatus, DeviceError> {
        self.charger.status()
    }

    /// Whether the charger is commanded enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The effective target current in amperes: the last written setpoint,
    /// or zero while the charger is commanded disabled.
    pub fn target_current(&self) -> i64 {
        if self.enabled {
            self.setpoint
        } else {
            0
        }
    }

    /// Effective current limits after device overrides.
    pub fn limits(&self) -> (i64, i64) {
        (self.cfg.min_current, self.cfg.max_current)
    }

    /// Applies configured limits, e.g. after a settings change.
    pub fn set_limits(&mut self, min_current: i64, max_current: i64) {
        self.cfg.min_current = min_current;
        self.cfg.max_current = max_current;
    }

    /// Copies device-side runtime settings into the cached state: the
    /// enable flag, and current limits when the device reports them.
    pub fn sync_settings(&mut self) -> Result<(), DeviceError> {
        let enabled = self.charger.enabled()?;
        if enabled != self.enabled {
            warn!(
                cached = self.enabled,
                device = enabled,
                "enabled state changed on device, adopting"
            );
            self.enabled = enabled;
        }

        if let Some(limiter) = &self.charger.caps.limiter {
            let (min, max) = limiter.min_max_current()?;
            if (min, max) != (self.cfg.min_current, self.cfg.max_current) {
                debug!(min, max, "device current limits");
                self.cfg.min_current = min;
                self.cfg.max_current = max;
            }
        }

        Ok(())
    }

    /// Ramps towards `target` amperes; zero disables the charger.
    ///
    /// At most one device write per call. Non-forced writes wait for the
    /// guard to elapse and for the setpoint delta to reach the sensitivity
    /// threshold; `force` clears the guard (status or mode edge). A device
    /// answering `MustRetry` leaves all cached state untouched so the next
    /// cycle reissues the command.
    pub fn ramp(&mut self, target: i64, force: bool) -> Result<(), DeviceError> {
        let want_enabled = target > 0;
        let target = if want_enabled {
            target.clamp(self.cfg.min_current, self.cfg.max_current)
        } else {
            0
        };

        if force {
            self.guard_updated = None;
        }

        if want_enabled != self.enabled {
            if !self.guard_elapsed() {
                debug!(
                    enable = want_enabled,
                    remaining = ?self.guard_remaining(),
                    "enable deferred, guard active"
                );
                return Ok(());
            }

            // switch through the minimum-current setpoint
            if self.setpoint != self.cfg.min_current {
                return self.write_current(self.cfg.min_current);
            }
            return self.write_enable(want_enabled);
        }

        if self.enabled {
            let delta = (target - self.setpoint).abs();
            if delta == 0 {
                return Ok(());
            }

            if force || (self.guard_elapsed() && delta >= self.cfg.sensitivity) {
                return self.write_current(target);
            }

            debug!(target, delta, "setpoint deferred");
        }

        Ok(())
    }

    fn guard_elapsed(&self) -> bool {
        self.guard_updated
            .is_none_or(|at| self.clock.since(at) >= self.cfg.guard_duration)
    }

    fn guard_remaining(&self) -> Duration {
        self.guard_updated.map_or(Duration::ZERO, |at| {
            self.cfg.guard_duration.saturating_sub(self.clock.since(at))
        })
    }

    fn write_current(&mut self, amps: i64) -> Result<(), DeviceError> {
        match self.charger.set_current(amps) {
            Ok(()) => {
                self.setpoint = amps;
                self.guard_updated = Some(self.clock.now());
                info!(amps, "max charge current");
                Ok(())
            }
            Err(DeviceError::MustRetry) => {
                debug!(amps, "charger not ready, retrying next cycle");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn write_enable(&mut self, enable: bool) -> Result<(), DeviceError> {
        match self.charger.enable(enable) {
            Ok(()) => {
                self.enabled = enable;
                self.guard_updated = Some(self.clock.now());
                info!(enable, "charger enable");
                Ok(())
            }
            Err(DeviceError::MustRetry) => {
                debug!(enable, "charger not ready, retrying next cycle");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
