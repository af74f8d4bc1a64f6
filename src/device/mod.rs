//! Device abstraction layer: capability traits, capability-descriptor
//! records, and the error taxonomy shared by all drivers.
//!
//! A driver constructor returns its mandatory handle together with a record
//! of optional capability handles. Consumers probe the record; the loadpoint
//! synthesizes the semantics of any absent capability.

pub mod cache;
pub mod registry;
pub mod retry;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::core::types::ChargeStatus;

/// Error kinds distinguished by the control core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Capability not supported or data not ready; not retried.
    #[error("not available")]
    NotAvailable,
    /// Driver exceeded its deadline.
    #[error("timeout")]
    Timeout,
    /// Command valid but device not ready; reissue on the next cycle.
    #[error("must retry")]
    MustRetry,
    /// Generic transient I/O failure.
    #[error("transient: {0}")]
    Transient(String),
    /// Configuration invariant violated; aborts construction.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Instantaneous power reading in watts.
///
/// Positive is consumption; generation meters report negative values.
pub trait Meter: Send + Sync {
    fn current_power(&self) -> Result<f64, DeviceError>;
}

/// Cumulative energy reading in kWh.
pub trait MeterEnergy: Send + Sync {
    fn total_energy(&self) -> Result<f64, DeviceError>;
}

/// Per-phase current readings in amperes.
pub trait PhaseCurrents: Send + Sync {
    fn currents(&self) -> Result<(f64, f64, f64), DeviceError>;
}

/// Battery state of charge in percent.
pub trait BatterySoc: Send + Sync {
    fn soc(&self) -> Result<f64, DeviceError>;
}

/// Energy charged within the current charge cycle, in kWh.
pub trait ChargeRater: Send + Sync {
    fn charged_energy(&self) -> Result<f64, DeviceError>;
}

/// Duration of the current charge cycle.
pub trait ChargeTimer: Send + Sync {
    fn charging_time(&self) -> Result<Duration, DeviceError>;
}

/// Device-reported current limits, overriding static configuration.
pub trait CurrentLimiter: Send + Sync {
    fn min_max_current(&self) -> Result<(i64, i64), DeviceError>;
}

/// Vehicle identification, e.g. an ISO 15118 contract id or RFID tag.
///
/// May return [`DeviceError::MustRetry`] for a bounded window after connect
/// while identification negotiates.
pub trait Identifier: Send + Sync {
    fn identify(&self) -> Result<String, DeviceError>;
}

/// A vehicle known to the site, queried read-only.
pub trait Vehicle: Send + Sync {
    /// Human-readable vehicle name.
    fn title(&self) -> &str;
    /// Battery capacity in kWh.
    fn capacity_kwh(&self) -> f64;
    /// State of charge in percent.
    fn soc(&self) -> Result<f64, DeviceError>;
    /// Identification tags this vehicle answers to.
    fn identifiers(&self) -> &[String];
}

/// Mandatory charger operations.
///
/// Drivers use interior mutability; all receivers are shared so a single
/// driver instance can also back its optional capability handles.
pub trait Charger: Send + Sync {
    /// Current pilot state.
    fn status(&self) -> Result<ChargeStatus, DeviceError>;
    /// Device-reported enable flag.
    fn enabled(&self) -> Result<bool, DeviceError>;
    /// Enables or disables charging. Idempotent.
    fn enable(&self, enable: bool) -> Result<(), DeviceError>;
    /// Sets the maximum charge current in whole amperes.
    fn max_current(&self, current: i64) -> Result<(), DeviceError>;
    /// Sets a fractional maximum charge current in amperes.
    ///
    /// Only called when the capability record advertises fractional
    /// support.
    fn max_current_millis(&self, current: f64) -> Result<(), DeviceError> {
        let _ = current;
        Err(DeviceError::NotAvailable)
    }
}

/// Optional capability handles reported by a charger driver.
///
/// Absent handles are synthesized by the loadpoint where synthesis is
/// possible (meter, rater, timer) and skipped otherwise.
#[derive(Default)]
pub struct ChargerCapabilities {
    /// Charger-side power meter.
    pub meter: Option<Arc<dyn Meter>>,
    /// Per-phase charge currents.
    pub phase_currents: Option<Arc<dyn PhaseCurrents>>,
    /// Session energy as reported by the device.
    pub rater: Option<Arc<dyn ChargeRater>>,
    /// Session duration as reported by the device.
    pub timer: Option<Arc<dyn ChargeTimer>>,
    /// Device-reported current limits.
    pub limiter: Option<Arc<dyn CurrentLimiter>>,
    /// Vehicle identification.
    pub identifier: Option<Arc<dyn Identifier>>,
    /// Vehicle state of charge reported through the charger.
    pub soc: Option<Arc<dyn BatterySoc>>,
    /// Whether fractional ampere setpoints are supported.
    pub fractional: bool,
}

/// A charger handle: mandatory operations plus the capability record.
///
/// Write operations are serialized through an internal mutex so at most one
/// command per device is ever in flight.
pub struct ChargerDevice {
    api: Arc<dyn Charger>,
    /// Optional capabilities advertised by the driver.
    pub caps: ChargerCapabilities,
    cmd: Mutex<()>,
}

impl ChargerDevice {
    /// Wraps a driver handle and its capability record.
    pub fn new(api: Arc<dyn Charger>, caps: ChargerCapabilities) -> Self {
        Self {
            api,
            caps,
            cmd: Mutex::new(()),
        }
    }

    /// Reads the pilot state.
    pub fn status(&self) -> Result<ChargeStatus, DeviceError> {
        self.api.status()
    }

    /// Reads the device enable flag.
    pub fn enabled(&self) -> Result<bool, DeviceError> {
        self.api.enabled()
    }

    /// Enables or disables charging.
    pub fn enable(&self, enable: bool) -> Result<(), DeviceError> {
        let _cmd = self.cmd.lock();
        self.api.enable(enable)
    }

    /// Writes a current setpoint, preferring the fractional form when the
    /// device supports it.
    pub fn set_current(&self, current: i64) -> Result<(), DeviceError> {
        let _cmd = self.cmd.lock();
        if self.caps.fractional {
            self.api.max_current_millis(current as f64)
        } else {
            self.api.max_current(current)
        }
    }
}

/// A meter handle: power reading plus optional capability handles.
pub struct MeterDevice {
    /// Instantaneous power.
    pub power: Arc<dyn Meter>,
    /// Cumulative energy.
    pub energy: Option<Arc<dyn MeterEnergy>>,
    /// Per-phase currents.
    pub currents: Option<Arc<dyn PhaseCurrents>>,
    /// Battery state of charge.
    pub soc: Option<Arc<dyn BatterySoc>>,
}

impl MeterDevice {
    /// Creates a meter handle with no optional capabilities.
    pub fn from_power(power: Arc<dyn Meter>) -> Self {
        Self {
            power,
            energy: None,
            currents: None,
            soc: None,
        }
    }

    /// Reads the instantaneous power in watts.
    pub fn current_power(&self) -> Result<f64, DeviceError> {
        self.power.current_power()
    }
}
