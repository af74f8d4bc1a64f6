//! Simulated reference drivers.
//!
//! Deterministic, seeded device models so the controller runs end-to-end
//! without hardware: a profile-driven meter (daily sinusoid plus a solar
//! shape and Gaussian noise), a charger with configurable capabilities,
//! and a static vehicle. Registered under the `simulated` driver type.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use super::{
    BatterySoc, Charger, ChargerCapabilities, ChargerDevice, CurrentLimiter, DeviceError,
    Identifier, Meter, MeterDevice, MeterEnergy, PhaseCurrents, Vehicle,
};
use crate::core::clock::Clock;
use crate::core::types::ChargeStatus;
use crate::device::cache::CachedMeter;

/// Fraction of daylight intensity at a given hour of day: a squared
/// sine arc rising from sunrise to solar noon and back down to sunset.
fn daylight_frac(hour: f64, sunrise: f64, sunset: f64) -> f64 {
    if sunset <= sunrise {
        return 0.0;
    }

    let progress = (hour - sunrise) / (sunset - sunrise);
    if !(0.0..1.0).contains(&progress) {
        return 0.0;
    }
    (PI * progress).sin().powi(2)
}

/// Gaussian noise sample (Box-Muller, sine variant).
fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }

    let radius = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let angle = std::f64::consts::TAU * rng.random::<f64>();
    std_dev * (-2.0 * radius.ln()).sqrt() * angle.sin()
}

/// Simulated meter parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimMeterConfig {
    /// Baseline power (W, positive = consumption).
    pub base_power: f64,
    /// Daily sinusoidal swing (W).
    pub amplitude: f64,
    /// Phase offset of the sinusoid (radians).
    pub phase_rad: f64,
    /// Gaussian noise standard deviation (W).
    pub noise_std: f64,
    /// Peak solar contribution (W, subtracted around midday).
    pub solar_peak: f64,
    /// Sunrise hour (inclusive).
    pub sunrise_hour: f64,
    /// Sunset hour (exclusive).
    pub sunset_hour: f64,
    /// Random seed for the noise sequence.
    pub seed: u64,
    /// Wrap reads in a TTL cache of this many seconds.
    pub cache_secs: Option<u64>,
    /// Fail every Nth read with a transient error.
    pub fail_every: Option<u64>,
    /// Report this battery state of charge (percent).
    pub soc: Option<f64>,
    /// Expose a cumulative energy reading.
    pub energy: bool,
}

impl Default for SimMeterConfig {
    fn default() -> Self {
        Self {
            base_power: 0.0,
            amplitude: 0.0,
            phase_rad: 0.0,
            noise_std: 0.0,
            solar_peak: 0.0,
            sunrise_hour: 6.0,
            sunset_hour: 18.0,
            seed: 0,
            cache_secs: None,
            fail_every: None,
            soc: None,
            energy: false,
        }
    }
}

struct SimMeterState {
    rng: StdRng,
    reads: u64,
    last_power: f64,
    last_read: Option<Instant>,
    energy_wh: f64,
}

/// Profile-driven power meter.
pub struct SimMeter {
    cfg: SimMeterConfig,
    state: Mutex<SimMeterState>,
}

impl SimMeter {
    /// Creates a meter from its configuration.
    pub fn new(cfg: SimMeterConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self {
            cfg,
            state: Mutex::new(SimMeterState {
                rng,
                reads: 0,
                last_power: 0.0,
                last_read: None,
                energy_wh: 0.0,
            }),
        }
    }

    /// Deterministic profile power at an hour of day, before noise.
    fn profile_power(&self, hour: f64) -> f64 {
        let daily = self.cfg.amplitude * (2.0 * PI * hour / 24.0 + self.cfg.phase_rad).sin();
        let solar =
            self.cfg.solar_peak * daylight_frac(hour, self.cfg.sunrise_hour, self.cfg.sunset_hour);
        self.cfg.base_power + daily - solar
    }
}

impl Meter for SimMeter {
    fn current_power(&self) -> Result<f64, DeviceError> {
        let mut state = self.state.lock();
        state.reads += 1;

        if let Some(every) = self.cfg.fail_every {
            if every > 0 && state.reads % every == 0 {
                return Err(DeviceError::Transient("simulated read failure".into()));
            }
        }

        let now = chrono::Local::now();
        let hour = f64::from(now.hour()) + f64::from(now.minute()) / 60.0;
        let power = self.profile_power(hour) + gaussian_noise(&mut state.rng, self.cfg.noise_std);

        // accumulate the held power since the previous read
        let instant = Instant::now();
        if let Some(last) = state.last_read {
            let hours = instant.saturating_duration_since(last).as_secs_f64() / 3600.0;
            state.energy_wh += state.last_power.abs() * hours;
        }
        state.last_read = Some(instant);
        state.last_power = power;

        Ok(power)
    }
}

impl MeterEnergy for SimMeter {
    fn total_energy(&self) -> Result<f64, DeviceError> {
        Ok(self.state.lock().energy_wh / 1e3)
    }
}

impl BatterySoc for SimMeter {
    fn soc(&self) -> Result<f64, DeviceError> {
        self.cfg.soc.ok_or(DeviceError::NotAvailable)
    }
}

/// Builds a [`MeterDevice`] from a free-form `simulated` config table.
pub fn meter_from_config(table: &toml::Table) -> Result<MeterDevice, DeviceError> {
    let cfg: SimMeterConfig = toml::Value::Table(table.clone())
        .try_into()
        .map_err(|err| DeviceError::Fatal(format!("simulated meter config: {err}")))?;

    let cache = cfg.cache_secs;
    let soc = cfg.soc.is_some();
    let energy = cfg.energy;
    let meter = Arc::new(SimMeter::new(cfg));

    let power: Arc<dyn Meter> = match cache {
        Some(secs) => Arc::new(CachedMeter::new(
            Clock::system(),
            Duration::from_secs(secs),
            meter.clone(),
        )),
        None => meter.clone(),
    };

    Ok(MeterDevice {
        power,
        energy: energy.then(|| meter.clone() as Arc<dyn MeterEnergy>),
        currents: None,
        soc: soc.then(|| meter as Arc<dyn BatterySoc>),
    })
}

/// Simulated charger parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimChargerConfig {
    /// Device minimum current (A).
    pub min_current: i64,
    /// Device maximum current (A).
    pub max_current: i64,
    /// Phases used for the simulated charge power.
    pub phases: u32,
    /// Nominal voltage for the simulated charge power.
    pub voltage: f64,
    /// Whether a vehicle is plugged in from the start.
    pub connected: bool,
    /// Plug in this many seconds after construction.
    pub connect_after_secs: Option<u64>,
    /// Expose a charger-side power meter.
    pub has_meter: bool,
    /// Expose per-phase currents.
    pub has_phase_currents: bool,
    /// Expose device current limits.
    pub has_limiter: bool,
    /// Accept fractional ampere setpoints.
    pub fractional: bool,
    /// Identification tag reported after the negotiation delay.
    pub identity: Option<String>,
    /// Seconds of `MustRetry` before identification answers.
    pub identify_delay_secs: u64,
}

impl Default for SimChargerConfig {
    fn default() -> Self {
        Self {
            min_current: 6,
            max_current: 32,
            phases: 3,
            voltage: 230.0,
            connected: true,
            connect_after_secs: None,
            has_meter: false,
            has_phase_currents: false,
            has_limiter: false,
            fractional: false,
            identity: None,
            identify_delay_secs: 0,
        }
    }
}

struct SimChargerState {
    enabled: bool,
    current: f64,
}

/// Charger model honoring enable and current setpoints.
pub struct SimCharger {
    cfg: SimChargerConfig,
    started: Instant,
    state: Mutex<SimChargerState>,
}

impl SimCharger {
    /// Creates a charger from its configuration.
    pub fn new(cfg: SimChargerConfig) -> Self {
        let min = cfg.min_current as f64;
        Self {
            cfg,
            started: Instant::now(),
            state: Mutex::new(SimChargerState {
                enabled: false,
                current: min,
            }),
        }
    }

    fn connected(&self) -> bool {
        match self.cfg.connect_after_secs {
            Some(secs) => self.started.elapsed() >= Duration::from_secs(secs),
            None => self.cfg.connected,
        }
    }

    fn charging(&self) -> bool {
        self.connected() && self.state.lock().enabled
    }
}

impl Charger for SimCharger {
    fn status(&self) -> Result<ChargeStatus, DeviceError> {
        if !self.connected() {
            return Ok(ChargeStatus::A);
        }
        if self.charging() {
            Ok(ChargeStatus::C)
        } else {
            Ok(ChargeStatus::B)
        }
    }

    fn enabled(&self) -> Result<bool, DeviceError> {
        Ok(self.state.lock().enabled)
    }

    fn enable(&self, enable: bool) -> Result<(), DeviceError> {
        self.state.lock().enabled = enable;
        Ok(())
    }

    fn max_current(&self, current: i64) -> Result<(), DeviceError> {
        // devices clamp to their own floor rather than reject
        self.state.lock().current = current.max(self.cfg.min_current) as f64;
        Ok(())
    }

    fn max_current_millis(&self, current: f64) -> Result<(), DeviceError> {
        if !self.cfg.fractional {
            return Err(DeviceError::NotAvailable);
        }
        self.state.lock().current = current.max(self.cfg.min_current as f64);
        Ok(())
    }
}

impl Meter for SimCharger {
    fn current_power(&self) -> Result<f64, DeviceError> {
        if !self.charging() {
            return Ok(0.0);
        }
        let state = self.state.lock();
        Ok(state.current * self.cfg.voltage * f64::from(self.cfg.phases))
    }
}

impl PhaseCurrents for SimCharger {
    fn currents(&self) -> Result<(f64, f64, f64), DeviceError> {
        if !self.charging() {
            return Ok((0.0, 0.0, 0.0));
        }
        let amps = self.state.lock().current;
        let per_phase = |n: u32| if self.cfg.phases >= n { amps } else { 0.0 };
        Ok((per_phase(1), per_phase(2), per_phase(3)))
    }
}

impl CurrentLimiter for SimCharger {
    fn min_max_current(&self) -> Result<(i64, i64), DeviceError> {
        Ok((self.cfg.min_current, self.cfg.max_current))
    }
}

impl Identifier for SimCharger {
    fn identify(&self) -> Result<String, DeviceError> {
        if !self.connected() {
            return Err(DeviceError::NotAvailable);
        }
        if self.started.elapsed() < Duration::from_secs(self.cfg.identify_delay_secs) {
            return Err(DeviceError::MustRetry);
        }
        Ok(self.cfg.identity.clone().unwrap_or_default())
    }
}

/// Builds a [`ChargerDevice`] from a free-form `simulated` config table.
pub fn charger_from_config(table: &toml::Table) -> Result<ChargerDevice, DeviceError> {
    let cfg: SimChargerConfig = toml::Value::Table(table.clone())
        .try_into()
        .map_err(|err| DeviceError::Fatal(format!("simulated charger config: {err}")))?;

    if cfg.min_current > cfg.max_current {
        return Err(DeviceError::Fatal(format!(
            "simulated charger: min_current {} > max_current {}",
            cfg.min_current, cfg.max_current
        )));
    }

    let charger = Arc::new(SimCharger::new(cfg.clone()));
    let caps = ChargerCapabilities {
        meter: cfg
            .has_meter
            .then(|| charger.clone() as Arc<dyn Meter>),
        phase_currents: cfg
            .has_phase_currents
            .then(|| charger.clone() as Arc<dyn PhaseCurrents>),
        rater: None,
        timer: None,
        limiter: cfg
            .has_limiter
            .then(|| charger.clone() as Arc<dyn CurrentLimiter>),
        identifier: cfg
            .identity
            .is_some()
            .then(|| charger.clone() as Arc<dyn Identifier>),
        soc: None,
        fractional: cfg.fractional,
    };

    Ok(ChargerDevice::new(charger, caps))
}

/// Simulated vehicle parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimVehicleConfig {
    /// Vehicle name.
    pub title: String,
    /// Battery capacity in kWh.
    pub capacity_kwh: f64,
    /// Initial state of charge in percent.
    pub soc: f64,
    /// Assumed charge power while the vehicle is connected (W). Zero
    /// keeps the SoC static.
    pub charge_power: f64,
    /// Identification tags.
    pub identifiers: Vec<String>,
}

impl Default for SimVehicleConfig {
    fn default() -> Self {
        Self {
            title: "vehicle".to_string(),
            capacity_kwh: 50.0,
            soc: 40.0,
            charge_power: 0.0,
            identifiers: Vec::new(),
        }
    }
}

struct SimVehicleState {
    soc: f64,
    last_poll: Option<Instant>,
}

/// Vehicle model with a linear SoC ramp.
///
/// A loadpoint polls the SoC only while the vehicle is connected; between
/// two polls the SoC rises as if `charge_power` had been flowing into the
/// battery, clamped at 100 %.
pub struct SimVehicle {
    cfg: SimVehicleConfig,
    clock: Clock,
    state: Mutex<SimVehicleState>,
}

impl SimVehicle {
    /// Creates a vehicle from its configuration.
    pub fn new(cfg: SimVehicleConfig) -> Self {
        Self::with_clock(cfg, Clock::system())
    }

    /// Creates a vehicle with an injected clock for the SoC ramp.
    pub fn with_clock(cfg: SimVehicleConfig, clock: Clock) -> Self {
        let soc = cfg.soc;
        Self {
            cfg,
            clock,
            state: Mutex::new(SimVehicleState {
                soc,
                last_poll: None,
            }),
        }
    }
}

impl Vehicle for SimVehicle {
    fn title(&self) -> &str {
        &self.cfg.title
    }

    fn capacity_kwh(&self) -> f64 {
        self.cfg.capacity_kwh
    }

    fn soc(&self) -> Result<f64, DeviceError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if self.cfg.charge_power > 0.0 && self.cfg.capacity_kwh > 0.0 {
            if let Some(last) = state.last_poll {
                let hours = now.saturating_duration_since(last).as_secs_f64() / 3600.0;
                let charged_kwh = self.cfg.charge_power / 1e3 * hours;
                state.soc =
                    (state.soc + 100.0 * charged_kwh / self.cfg.capacity_kwh).min(100.0);
            }
        }
        state.last_poll = Some(now);

        Ok(state.soc)
    }

    fn identifiers(&self) -> &[String] {
        &self.cfg.identifiers
    }
}

/// Builds a vehicle from a free-form `simulated` config table.
pub fn vehicle_from_config(table: &toml::Table) -> Result<Arc<dyn Vehicle>, DeviceError> {
    let cfg: SimVehicleConfig = toml::Value::Table(table.clone())
        .try_into()
        .map_err(|err| DeviceError::Fatal(format!("simulated vehicle config: {err}")))?;

    Ok(Arc::new(SimVehicle::new(cfg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daylight_zero_at_night_peak_at_noon() {
        assert_eq!(daylight_frac(0.0, 6.0, 18.0), 0.0);
        assert_eq!(daylight_frac(5.9, 6.0, 18.0), 0.0);
        assert_eq!(daylight_frac(18.0, 6.0, 18.0), 0.0);
        assert!((daylight_frac(12.0, 6.0, 18.0) - 1.0).abs() < 1e-9);
        assert!(daylight_frac(9.0, 6.0, 18.0) > 0.0);
    }

    #[test]
    fn meter_profile_without_noise_is_deterministic() {
        let meter = SimMeter::new(SimMeterConfig {
            base_power: 400.0,
            solar_peak: 4000.0,
            ..SimMeterConfig::default()
        });
        assert_eq!(meter.profile_power(0.0), 400.0);
        assert!((meter.profile_power(12.0) - (400.0 - 4000.0)).abs() < 1e-9);
    }

    #[test]
    fn meter_fail_every_injects_transient_errors() {
        let meter = SimMeter::new(SimMeterConfig {
            base_power: 100.0,
            fail_every: Some(2),
            ..SimMeterConfig::default()
        });
        assert!(meter.current_power().is_ok());
        assert!(matches!(
            meter.current_power(),
            Err(DeviceError::Transient(_))
        ));
        assert!(meter.current_power().is_ok());
    }

    #[test]
    fn charger_reports_c_only_when_enabled() {
        let charger = SimCharger::new(SimChargerConfig::default());
        assert_eq!(charger.status(), Ok(ChargeStatus::B));

        charger.enable(true).unwrap();
        assert_eq!(charger.status(), Ok(ChargeStatus::C));
        assert_eq!(charger.enabled(), Ok(true));

        charger.enable(false).unwrap();
        assert_eq!(charger.status(), Ok(ChargeStatus::B));
    }

    #[test]
    fn charger_power_tracks_setpoint() {
        let charger = SimCharger::new(SimChargerConfig::default());
        charger.enable(true).unwrap();
        charger.max_current(10).unwrap();
        assert_eq!(charger.current_power(), Ok(10.0 * 230.0 * 3.0));

        // below the device floor: clamped up, not rejected
        charger.max_current(2).unwrap();
        assert_eq!(charger.current_power(), Ok(6.0 * 230.0 * 3.0));
    }

    #[test]
    fn charger_unplugged_reports_a() {
        let charger = SimCharger::new(SimChargerConfig {
            connected: false,
            ..SimChargerConfig::default()
        });
        assert_eq!(charger.status(), Ok(ChargeStatus::A));
        assert_eq!(charger.current_power(), Ok(0.0));
    }

    #[test]
    fn identify_retries_until_negotiated() {
        let charger = SimCharger::new(SimChargerConfig {
            identity: Some("tag-1".into()),
            identify_delay_secs: 3600,
            ..SimChargerConfig::default()
        });
        assert_eq!(charger.identify(), Err(DeviceError::MustRetry));

        let instant = SimCharger::new(SimChargerConfig {
            identity: Some("tag-1".into()),
            ..SimChargerConfig::default()
        });
        assert_eq!(instant.identify(), Ok("tag-1".into()));
    }

    #[test]
    fn charger_config_rejects_inverted_limits() {
        let mut table = toml::Table::new();
        table.insert("min_current".into(), 20i64.into());
        table.insert("max_current".into(), 10i64.into());
        assert!(matches!(
            charger_from_config(&table),
            Err(DeviceError::Fatal(_))
        ));
    }

    #[test]
    fn vehicle_from_config_defaults() {
        let vehicle = vehicle_from_config(&toml::Table::new()).unwrap();
        assert_eq!(vehicle.title(), "vehicle");
        assert_eq!(vehicle.capacity_kwh(), 50.0);
        assert_eq!(vehicle.soc(), Ok(40.0));
    }

    #[test]
    fn vehicle_soc_ramps_between_polls() {
        let clock = Clock::manual();
        let vehicle = SimVehicle::with_clock(
            SimVehicleConfig {
                capacity_kwh: 50.0,
                soc: 40.0,
                charge_power: 5000.0,
                ..SimVehicleConfig::default()
            },
            clock.clone(),
        );

        assert_eq!(vehicle.soc(), Ok(40.0));

        // one hour at 5 kW charges 5 kWh into 50 kWh: +10 %
        clock.advance(Duration::from_secs(3600));
        assert_eq!(vehicle.soc(), Ok(50.0));

        // a long interval clamps at full
        clock.advance(Duration::from_secs(20 * 3600));
        assert_eq!(vehicle.soc(), Ok(100.0));
    }

    #[test]
    fn vehicle_soc_static_without_charge_power() {
        let clock = Clock::manual();
        let vehicle =
            SimVehicle::with_clock(SimVehicleConfig::default(), clock.clone());

        assert_eq!(vehicle.soc(), Ok(40.0));
        clock.advance(Duration::from_secs(3600));
        assert_eq!(vehicle.soc(), Ok(40.0));
    }
}
