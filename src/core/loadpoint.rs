//! Loadpoint controller: one charger + optional vehicle behind a single
//! connection point.
//!
//! Each tick the loadpoint refreshes its charge meter and pilot status,
//! runs the connection state machine, evaluates the charge-mode policy
//! against the site power budget, and issues at most one charger command
//! through the handler.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::core::bus::EventBus;
use crate::core::clock::Clock;
use crate::core::handler::{ChargerHandler, HandlerConfig};
use crate::core::types::{
    current_to_power, power_to_current, ChargeMode, ChargeStatus, Param, PushEvent, PushKind,
};
use crate::core::wrapper;
use crate::device::{
    self, retry::retry, ChargerDevice, DeviceError, Identifier, Meter, MeterDevice, PhaseCurrents,
    Vehicle,
};

/// Fraction of the minimum charge power (or summed minimum current)
/// below which an observed draw counts as "not really charging".
const IDLE_FACTOR: f64 = 0.6;

/// Minimum interval between two evaluations of the charging-active
/// heuristic; the previous result is sticky in between.
const ACTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How long after a connect edge vehicle identification may keep answering
/// `MustRetry` before the loadpoint gives up.
const IDENT_WINDOW: Duration = Duration::from_secs(120);

/// Per-operation read retries and initial backoff.
const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(100);

/// Enable/disable hysteresis parameters.
#[derive(Debug, Clone, Copy)]
pub struct Threshold {
    /// Site power threshold in watts.
    pub threshold: f64,
    /// Dwell time the threshold must hold before toggling.
    pub delay: Duration,
}

impl Default for Threshold {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            delay: Duration::from_secs(60),
        }
    }
}

/// Static loadpoint configuration.
#[derive(Debug, Clone)]
pub struct LoadpointConfig {
    /// Human-readable loadpoint name.
    pub title: String,
    /// Number of connected phases (1..=3).
    pub phases: u32,
    /// Minimum charge current in amperes.
    pub min_current: i64,
    /// Maximum charge current in amperes.
    pub max_current: i64,
    /// Budget priority; higher values are served first.
    pub priority: i32,
    /// Smallest setpoint delta worth a device write, in amperes.
    pub sensitivity: i64,
    /// Minimum interval between two non-forced charger writes.
    pub guard_duration: Duration,
    /// Enable hysteresis.
    pub enable: Threshold,
    /// Disable hysteresis.
    pub disable: Threshold,
}

impl Default for LoadpointConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            phases: 1,
            min_current: 6,
            max_current: 16,
            priority: 0,
            sensitivity: 1,
            guard_duration: Duration::from_secs(30),
            enable: Threshold::default(),
            disable: Threshold::default(),
        }
    }
}

/// Runtime-adjustable loadpoint settings, shared with API readers.
#[derive(Debug, Clone, Serialize)]
pub struct LoadpointSettings {
    /// Number of connected phases.
    pub phases: u32,
    /// Minimum charge current in amperes.
    pub min_current: i64,
    /// Maximum charge current in amperes.
    pub max_current: i64,
    /// Budget priority; higher values are served first.
    pub priority: i32,
    /// Target time for a charging plan, published only.
    pub plan_time: Option<DateTime<Utc>>,
    /// Target SoC for a charging plan, published only.
    pub plan_soc: Option<i64>,
    /// Stop charging once the vehicle SoC reaches this percentage.
    pub limit_soc: Option<f64>,
    /// Stop charging once the session energy reaches this many kWh.
    pub limit_energy: Option<f64>,
}

/// Shared handle to a loadpoint's runtime settings.
pub type SharedSettings = Arc<RwLock<LoadpointSettings>>;

impl From<&LoadpointConfig> for LoadpointSettings {
    fn from(cfg: &LoadpointConfig) -> Self {
        Self {
            phases: cfg.phases,
            min_current: cfg.min_current,
            max_current: cfg.max_current,
            priority: cfg.priority,
            plan_time: None,
            plan_soc: None,
            limit_soc: None,
            limit_energy: None,
        }
    }
}

/// Controls charging for one charger + optional vehicle pair.
pub struct Loadpoint {
    title: String,
    clock: Clock,
    voltage: f64,
    enable: Threshold,
    disable: Threshold,

    bus: EventBus,
    handler: ChargerHandler,
    charge_meter: Arc<dyn Meter>,
    physical_meter: bool,
    rater: Arc<dyn device::ChargeRater>,
    timer: Arc<dyn device::ChargeTimer>,
    phase_currents: Option<Arc<dyn PhaseCurrents>>,
    identifier: Option<Arc<dyn Identifier>>,
    charger_soc: Option<Arc<dyn device::BatterySoc>>,

    default_vehicle: Option<Arc<dyn Vehicle>>,
    candidates: Vec<Arc<dyn Vehicle>>,
    vehicle: Option<Arc<dyn Vehicle>>,

    settings: SharedSettings,
    ui: Option<UnboundedSender<Param>>,
    push: Option<UnboundedSender<PushEvent>>,

    // cached state
    status: ChargeStatus,
    charging: bool,
    charge_power: f64,
    site_power: f64,
    connected_at: Option<Instant>,
    ident_until: Option<Instant>,
    identified: bool,
    pv_timer: Option<Instant>,
    status_changed: bool,
    active_checked: Option<Instant>,
    active: bool,
    last_soc: Option<f64>,
    was_limited: bool,
}

impl Loadpoint {
    /// Creates a loadpoint, attaching synthetic wrappers for every charger
    /// capability the hardware lacks.
    ///
    /// A configured charge meter takes precedence over a charger-reported
    /// one; with neither, power is synthesized from the commanded current.
    pub fn new(
        clock: Clock,
        cfg: LoadpointConfig,
        voltage: f64,
        charger: ChargerDevice,
        charge_meter: Option<MeterDevice>,
        vehicle: Option<Arc<dyn Vehicle>>,
        candidates: Vec<Arc<dyn Vehicle>>,
    ) -> Self {
        let settings: SharedSettings = Arc::new(RwLock::new(LoadpointSettings::from(&cfg)));
        let mut bus = EventBus::new();

        let mut physical_meter = true;
        let mut meter_currents = None;
        let meter: Arc<dyn Meter> = if let Some(m) = charge_meter {
            meter_currents = m.currents.clone();
            m.power
        } else if let Some(m) = charger.caps.meter.clone() {
            m
        } else {
            physical_meter = false;
            let synth = Arc::new(wrapper::ChargeMeter::new());
            let sink = synth.clone();
            let shared = settings.clone();
            bus.subscribe_current(move |amps| {
                let phases = shared.read().phases;
                sink.set_power(current_to_power(amps, voltage, phases));
            });
            let sink = synth.clone();
            bus.subscribe_stop(move || sink.set_power(0.0));
            synth
        };

        let rater: Arc<dyn device::ChargeRater> = match charger.caps.rater.clone() {
            Some(rater) => rater,
            None => {
                let synth = Arc::new(wrapper::ChargeRater::new(clock.clone()));
                let sink = synth.clone();
                bus.subscribe_power(move |watts| sink.set_charge_power(watts));
                let sink = synth.clone();
                bus.subscribe_start(move || sink.start_charge());
                let sink = synth.clone();
                bus.subscribe_stop(move || sink.stop_charge());
                synth
            }
        };

        let timer: Arc<dyn device::ChargeTimer> = match charger.caps.timer.clone() {
            Some(timer) => timer,
            None => {
                let synth = Arc::new(wrapper::ChargeTimer::new(clock.clone()));
                let sink = synth.clone();
                bus.subscribe_start(move || sink.start_charge());
                let sink = synth.clone();
                bus.subscribe_stop(move || sink.stop_charge());
                synth
            }
        };

        let phase_currents = charger.caps.phase_currents.clone().or(meter_currents);
        let identifier = charger.caps.identifier.clone();
        let charger_soc = charger.caps.soc.clone();

        let handler = ChargerHandler::new(
            clock.clone(),
            charger,
            HandlerConfig {
                min_current: cfg.min_current,
                max_current: cfg.max_current,
                sensitivity: cfg.sensitivity,
                guard_duration: cfg.guard_duration,
            },
        );

        Self {
            title: cfg.title,
            clock,
            voltage,
            enable: cfg.enable,
            disable: cfg.disable,
            bus,
            handler,
            charge_meter: meter,
            physical_meter,
            rater,
            timer,
            phase_currents,
            identifier,
            charger_soc,
            default_vehicle: vehicle.clone(),
            candidates,
            vehicle,
            settings,
            ui: None,
            push: None,
            status: ChargeStatus::None,
            charging: false,
            charge_power: 0.0,
            site_power: 0.0,
            connected_at: None,
            ident_until: None,
            identified: false,
            pv_timer: None,
            status_changed: false,
            active_checked: None,
            active: false,
            last_soc: None,
            was_limited: false,
        }
    }

    /// Attaches the UI and push channels and synchronizes charger state.
    pub fn prepare(&mut self, ui: UnboundedSender<Param>, push: UnboundedSender<PushEvent>) {
        self.ui = Some(ui);
        self.push = Some(push);

        self.handler.prepare();
        self.publish("title", &self.title);
        self.publish_effective_current();
    }

    /// Loadpoint name.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Shared handle to the runtime settings.
    pub fn settings(&self) -> SharedSettings {
        self.settings.clone()
    }

    /// Last observed pilot state.
    pub fn status(&self) -> ChargeStatus {
        self.status
    }

    /// Whether a charge cycle is running.
    pub fn charging(&self) -> bool {
        self.charging
    }

    /// Last known charge power in watts.
    pub fn charge_power(&self) -> f64 {
        self.charge_power
    }

    /// Whether the charger is commanded enabled.
    pub fn enabled(&self) -> bool {
        self.handler.enabled()
    }

    fn connected(&self) -> bool {
        self.status.connected()
    }

    /// Main control function, called once per site tick. Returns the
    /// charge power drawn so the site can reduce the remaining budget.
    pub fn update(&mut self, mode: ChargeMode, site_power: f64) -> f64 {
        self.site_power = site_power;

        // adopt runtime settings; device-reported limits may override below
        {
            let settings = self.settings.read();
            self.handler
                .set_limits(settings.min_current, settings.max_current);
        }

        // 1. refresh the charge meter; keep the stale value on failure
        let meter = self.charge_meter.clone();
        match retry(READ_ATTEMPTS, READ_BACKOFF, || meter.current_power()) {
            Ok(power) => self.charge_power = power,
            Err(err) => error!(loadpoint = %self.title, "charge meter: {err}"),
        }
        self.publish("chargePower", self.charge_power);

        // 2. feed the synthetic wrappers before anything else runs
        self.publish_effective_current();
        self.bus.publish_power(self.charge_power);

        // 3. progress and soc, based on the previous cycle state
        self.publish_charge_progress();
        self.publish_soc();

        // 4. refresh pilot status and run the transition machine
        match self.refresh_status() {
            Ok(mut status) => {
                if status == ChargeStatus::C && !self.charging_active() {
                    debug!(loadpoint = %self.title, "charger reports charging, draw is idle");
                    status = ChargeStatus::B;
                }
                self.transition(status);
                self.publish("chargerStatus", self.status.to_string());
            }
            Err(err) => {
                error!(loadpoint = %self.title, "charger status: {err}");
                self.publish("chargerStatus", ChargeStatus::None.to_string());
                return self.charge_power;
            }
        }
        self.publish("connected", self.connected());
        self.publish("charging", self.charging);
        self.publish(
            "connectedDuration",
            self.connected_at
                .map_or(0, |at| self.clock.since(at).as_secs()),
        );

        // 5. adopt device-side runtime settings while a vehicle is present
        if self.status != ChargeStatus::A {
            if let Err(err) = self.handler.sync_settings() {
                warn!(loadpoint = %self.title, "settings sync: {err}");
            }
        }
        self.identify_vehicle();
        self.publish_settings();

        // 6. evaluate the mode policy and ramp
        let (min_current, max_current) = self.handler.limits();
        let limited = self.limit_reached();
        let target = if limited {
            0
        } else {
            match mode {
                ChargeMode::Off => 0,
                ChargeMode::Now => {
                    if self.connected() {
                        max_current
                    } else {
                        min_current
                    }
                }
                ChargeMode::MinPv | ChargeMode::Pv => {
                    let target = self.pv_current(mode);
                    if self.connected() {
                        target
                    } else {
                        // new connections start at minimum current
                        target.min(min_current)
                    }
                }
            }
        };
        debug!(loadpoint = %self.title, target, "target charge current");

        let force =
            matches!(mode, ChargeMode::Off | ChargeMode::Now) || self.status_changed || limited;
        if let Err(err) = self.handler.ramp(target, force) {
            error!(loadpoint = %self.title, "charge controller: {err}");
        }
        self.publish_effective_current();
        self.status_changed = false;

        self.charge_power
    }

    /// Reads the pilot status with retries. An unknown reading is retried
    /// like an error and only adopted when it persists through the whole
    /// retry window.
    fn refresh_status(&self) -> Result<ChargeStatus, DeviceError> {
        let mut last = Err(DeviceError::NotAvailable);
        let mut delay = READ_BACKOFF;

        for attempt in 0..READ_ATTEMPTS {
            last = self.handler.status();
            match last {
                Ok(ChargeStatus::None) | Err(_) => {
                    if attempt + 1 < READ_ATTEMPTS {
                        thread::sleep(delay);
                        delay = (delay * 2).min(Duration::from_secs(1));
                    }
                }
                Ok(_) => break,
            }
        }

        last
    }

    /// Runs the connection state machine for a freshly observed status.
    fn transition(&mut self, status: ChargeStatus) {
        if status == self.status {
            return;
        }
        let prev = self.status;
        self.status = status;
        self.status_changed = true;
        info!(loadpoint = %self.title, from = %prev, to = %status, "charger status");

        if status == ChargeStatus::F {
            // enable state stays untouched until the fault clears
            warn!(loadpoint = %self.title, "charger fault");
        }

        // connected: a session begins
        if prev == ChargeStatus::A && status.connected() {
            info!(loadpoint = %self.title, "vehicle connected");
            self.connected_at = Some(self.clock.now());
            self.ident_until = Some(self.clock.now() + IDENT_WINDOW);
            self.identified = false;
        }

        // disconnected: the session ends
        if status == ChargeStatus::A && prev != ChargeStatus::None {
            info!(loadpoint = %self.title, "vehicle disconnected");
            self.connected_at = None;
            self.ident_until = None;
            self.identified = false;
            self.vehicle = self.default_vehicle.clone();
        }

        // keep the synthetic meter in step with the new state
        self.publish_effective_current();

        let was_charging = self.charging;
        self.charging = status.charging();
        if self.charging != was_charging {
            if self.charging {
                info!(loadpoint = %self.title, "start charging");
                self.bus.publish_start();
                self.notify(PushKind::Start);
            } else {
                info!(loadpoint = %self.title, "stop charging");
                self.bus.publish_stop();
                self.publish_charge_progress();
                self.notify(PushKind::Stop);
            }
        }
    }

    /// Whether the charger is actually drawing charge power.
    ///
    /// Some chargers report `C` whenever enabled; when a physical meter or
    /// phase currents are available, an idle draw demotes the reading.
    /// Without evidence the pilot state is trusted.
    fn charging_active(&mut self) -> bool {
        if let Some(at) = self.active_checked {
            if self.clock.since(at) < ACTIVE_CHECK_INTERVAL {
                return self.active;
            }
        }

        let (min_current, _) = self.handler.limits();
        let phases = self.settings.read().phases;
        let active = if self.physical_meter {
            let min_power = current_to_power(min_current as f64, self.voltage, phases);
            self.charge_power > IDLE_FACTOR * min_power
        } else if let Some(currents) = &self.phase_currents {
            match currents.currents() {
                Ok((l1, l2, l3)) => l1 + l2 + l3 > IDLE_FACTOR * min_current as f64,
                Err(_) => true,
            }
        } else {
            true
        };

        self.active_checked = Some(self.clock.now());
        self.active = active;
        active
    }

    /// Computes the PV-mode target current from the available surplus,
    /// applying enable/disable hysteresis.
    fn pv_current(&mut self, mode: ChargeMode) -> i64 {
        let (min_current, max_current) = self.handler.limits();
        let phases = self.settings.read().phases;

        // power the charger could keep drawing if we consumed the surplus
        let available = self.charge_power - self.site_power;
        let target = power_to_current(available, self.voltage, phases).clamp(0, max_current);
        debug!(
            loadpoint = %self.title,
            available, charge = self.charge_power, site = self.site_power,
            "available power"
        );

        if !self.connected() {
            self.pv_timer = None;
            if mode == ChargeMode::MinPv || target >= min_current {
                return min_current;
            }
            return 0;
        }

        // never below minimum current while connected
        if mode == ChargeMode::MinPv && target < min_current {
            return min_current;
        }

        let enabled = self.handler.enabled();

        if mode == ChargeMode::Pv && enabled && target < min_current {
            if self.site_power >= self.disable.threshold {
                if self.pv_timer.is_none() {
                    debug!(loadpoint = %self.title, "pv disable timer started");
                    self.pv_timer = Some(self.clock.now());
                }
                if let Some(start) = self.pv_timer {
                    if self.clock.since(start) >= self.disable.delay {
                        debug!(loadpoint = %self.title, "pv disable timer elapsed");
                        return 0;
                    }
                }
            } else {
                // restarted below the threshold, deliberately not cleared
                self.pv_timer = Some(self.clock.now());
            }
            return min_current;
        }

        if mode == ChargeMode::Pv && !enabled {
            let threshold_met =
                self.enable.threshold != 0.0 && self.site_power <= self.enable.threshold;
            if target >= min_current || threshold_met {
                if self.pv_timer.is_none() {
                    debug!(loadpoint = %self.title, "pv enable timer started");
                    self.pv_timer = Some(self.clock.now());
                }
                if let Some(start) = self.pv_timer {
                    if self.clock.since(start) >= self.enable.delay {
                        debug!(loadpoint = %self.title, "pv enable timer elapsed");
                        return min_current;
                    }
                }
            } else {
                self.pv_timer = Some(self.clock.now());
            }
            return 0;
        }

        self.pv_timer = None;
        target
    }

    /// Polls vehicle identification inside the post-connect window.
    fn identify_vehicle(&mut self) {
        if !self.connected() || self.identified {
            return;
        }
        let Some(identifier) = self.identifier.clone() else {
            return;
        };
        let Some(until) = self.ident_until else {
            return;
        };
        if self.clock.now() > until {
            return;
        }

        match identifier.identify() {
            Ok(id) if !id.is_empty() => {
                info!(loadpoint = %self.title, id, "vehicle identified");
                self.identified = true;
                self.publish("vehicleIdentity", &id);

                if let Some(vehicle) = self
                    .candidates
                    .iter()
                    .find(|v| v.identifiers().iter().any(|known| known == &id))
                {
                    self.vehicle = Some(vehicle.clone());
                }
            }
            Ok(_) => {} // nothing reported yet, window stays open
            Err(DeviceError::MustRetry) => {} // identification negotiating
            Err(err) => {
                debug!(loadpoint = %self.title, "vehicle identification: {err}");
                self.ident_until = None;
            }
        }
    }

    /// Whether a configured session limit has been reached.
    fn limit_reached(&mut self) -> bool {
        let settings = self.settings.read().clone();
        let mut limited = false;

        if self.connected() {
            if let Some(limit) = settings.limit_energy {
                if self.charged_energy() >= limit {
                    limited = true;
                }
            }
            if let (Some(limit), Some(soc)) = (settings.limit_soc, self.last_soc) {
                if soc >= limit {
                    limited = true;
                }
            }
        }

        if limited && !self.was_limited {
            info!(loadpoint = %self.title, "session limit reached");
        }
        self.was_limited = limited;
        self.publish("limitReached", limited);
        limited
    }

    /// Session energy in kWh from the (physical or synthetic) rater.
    fn charged_energy(&self) -> f64 {
        match self.rater.charged_energy() {
            Ok(energy) => energy,
            Err(err) => {
                error!(loadpoint = %self.title, "charge rater: {err}");
                0.0
            }
        }
    }

    /// Charge cycle duration from the (physical or synthetic) timer.
    fn charge_duration(&self) -> Duration {
        match self.timer.charging_time() {
            Ok(duration) => duration,
            Err(err) => {
                error!(loadpoint = %self.title, "charge timer: {err}");
                Duration::ZERO
            }
        }
    }

    /// Effective charge current in amperes: the commanded setpoint while
    /// actually charging, zero otherwise.
    fn effective_current(&self) -> i64 {
        if self.status == ChargeStatus::C {
            self.handler.target_current()
        } else {
            0
        }
    }

    fn publish_effective_current(&self) {
        let amps = self.effective_current();
        self.bus.publish_current(amps as f64);
        self.publish("chargeCurrent", amps);
    }

    fn publish_charge_progress(&self) {
        self.publish("chargedEnergy", 1e3 * self.charged_energy()); // Wh for the UI
        self.publish("chargeDuration", self.charge_duration().as_secs());
    }

    /// Publishes vehicle SoC and the remaining-charge estimate.
    fn publish_soc(&mut self) {
        let soc = if self.connected() {
            if let Some(vehicle) = &self.vehicle {
                match vehicle.soc() {
                    Ok(soc) => Some(soc),
                    Err(err) => {
                        debug!(loadpoint = %self.title, "vehicle soc: {err}");
                        None
                    }
                }
            } else {
                self.charger_soc
                    .as_ref()
                    .and_then(|charger| charger.soc().ok())
            }
        } else {
            None
        };
        self.last_soc = soc;

        match soc {
            Some(soc) => {
                self.publish("socCharge", soc);
                self.publish("chargeEstimate", self.remaining_charge_secs(soc));
            }
            None => {
                self.publish("socCharge", -1);
                self.publish("chargeEstimate", -1);
            }
        }
    }

    /// Estimated seconds until full at the current charge power, `-1` when
    /// unknown.
    fn remaining_charge_secs(&self, soc: f64) -> i64 {
        if !self.charging || self.charge_power <= 0.0 {
            return -1;
        }
        let Some(vehicle) = &self.vehicle else {
            return -1;
        };

        let wh_remaining = (1.0 - soc / 100.0) * 1e3 * vehicle.capacity_kwh();
        (3600.0 * wh_remaining / self.charge_power) as i64
    }

    fn publish_settings(&self) {
        let settings = self.settings.read().clone();
        let (min_current, max_current) = self.handler.limits();

        self.publish("phases", settings.phases);
        self.publish("minCurrent", min_current);
        self.publish("maxCurrent", max_current);
        self.publish("priority", settings.priority);
        self.publish("planTime", settings.plan_time.map(|t| t.to_rfc3339()));
        self.publish("planSoc", settings.plan_soc);
        self.publish("limitSoc", settings.limit_soc);
        self.publish("limitEnergy", settings.limit_energy);
        if let Some(vehicle) = &self.vehicle {
            self.publish("vehicleTitle", vehicle.title());
            self.publish("vehicleCapacity", vehicle.capacity_kwh());
        }
    }

    fn publish(&self, key: &str, val: impl Serialize) {
        if let Some(ui) = &self.ui {
            let _ = ui.send(Param::new(key, val));
        }
    }

    fn notify(&self, kind: PushKind) {
        if let Some(push) = &self.push {
            let _ = push.send(PushEvent {
                loadpoint: None,
                kind,
            });
        }
    }
}
