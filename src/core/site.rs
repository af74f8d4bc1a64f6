//! Site orchestrator: owns the household meters and all loadpoints, runs
//! the periodic control loop, and fans loadpoint messages into the global
//! channels.
//!
//! Each tick the site reads grid, PV, and battery power (with bounded
//! retries), computes the available site power, and dispatches the
//! loadpoints in priority order. Every loadpoint reports the charge power
//! it draws, which shrinks the budget handed to the next one.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::loadpoint::{Loadpoint, SharedSettings};
use crate::core::types::{ChargeMode, Param, PushEvent};
use crate::device::{retry::retry, DeviceError, MeterDevice};

/// Per-meter read retries and initial backoff.
const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(100);

/// Static site parameters.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Human-readable site name.
    pub title: String,
    /// Nominal grid voltage in volts.
    pub voltage: f64,
    /// Household safety margin subtracted from the surplus, in watts.
    pub residual_power: f64,
    /// Control loop interval.
    pub interval: Duration,
    /// Initial charge mode.
    pub mode: ChargeMode,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            voltage: 230.0,
            residual_power: 0.0,
            interval: Duration::from_secs(10),
            mode: ChargeMode::Off,
        }
    }
}

/// Runtime-adjustable site settings, shared with API readers.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Charge mode applied to all loadpoints.
    pub mode: ChargeMode,
}

/// Owns meters and loadpoints and runs the control loop.
pub struct Site {
    title: String,
    residual_power: f64,
    interval: Duration,

    settings: Arc<RwLock<SiteSettings>>,

    grid_meter: MeterDevice,
    pv_meter: Option<MeterDevice>,
    battery_meter: Option<MeterDevice>,
    loadpoints: Vec<Loadpoint>,

    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Option<mpsc::Receiver<()>>,
    ui: Option<mpsc::UnboundedSender<Param>>,

    // cached state
    grid_power: f64,
    pv_power: f64,
    battery_power: f64,
}

impl Site {
    /// Creates a site. The grid meter is mandatory; PV and battery meters
    /// are read as zero when absent.
    pub fn new(
        cfg: SiteConfig,
        grid_meter: MeterDevice,
        pv_meter: Option<MeterDevice>,
        battery_meter: Option<MeterDevice>,
        loadpoints: Vec<Loadpoint>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        Self {
            title: cfg.title,
            residual_power: cfg.residual_power,
            interval: cfg.interval,
            settings: Arc::new(RwLock::new(SiteSettings { mode: cfg.mode })),
            grid_meter,
            pv_meter,
            battery_meter,
            loadpoints,
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            ui: None,
            grid_power: 0.0,
            pv_power: 0.0,
            battery_power: 0.0,
        }
    }

    /// Returns a clonable handle for mode changes, loadpoint settings, and
    /// manual re-evaluation triggers.
    pub fn handle(&self) -> SiteHandle {
        SiteHandle {
            settings: self.settings.clone(),
            loadpoints: self
                .loadpoints
                .iter()
                .map(|lp| LoadpointHandle {
                    title: lp.title().to_string(),
                    settings: lp.settings(),
                    trigger: self.trigger_tx.clone(),
                })
                .collect(),
            trigger: self.trigger_tx.clone(),
        }
    }

    /// Attaches the global UI/push channels and prepares every loadpoint.
    ///
    /// Each loadpoint gets a dedicated channel pair; one forwarder task per
    /// loadpoint stamps the loadpoint index onto messages and re-emits them
    /// on the global channels. Must run inside a tokio runtime.
    pub fn prepare(
        &mut self,
        ui: mpsc::UnboundedSender<Param>,
        push: mpsc::UnboundedSender<PushEvent>,
    ) {
        self.ui = Some(ui.clone());

        for (id, loadpoint) in self.loadpoints.iter_mut().enumerate() {
            let (lp_ui_tx, mut lp_ui_rx) = mpsc::unbounded_channel::<Param>();
            let (lp_push_tx, mut lp_push_rx) = mpsc::unbounded_channel::<PushEvent>();

            let ui = ui.clone();
            let push = push.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        param = lp_ui_rx.recv() => match param {
                            Some(mut param) => {
                                param.loadpoint = Some(id);
                                if ui.send(param).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        event = lp_push_rx.recv() => match event {
                            Some(mut event) => {
                                event.loadpoint = Some(id);
                                if push.send(event).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });

            loadpoint.prepare(lp_ui_tx, lp_push_tx);
        }
    }

    /// Number of configured loadpoints.
    pub fn loadpoint_count(&self) -> usize {
        self.loadpoints.len()
    }

    /// Site name.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Runs one control cycle: meters, budget, loadpoint dispatch.
    ///
    /// A meter failure aborts the cycle so the caller can retrigger
    /// without losing a sample; loadpoint errors never propagate.
    pub fn update(&mut self) -> Result<(), DeviceError> {
        let mode = self.settings.read().mode;
        self.publish("mode", mode.to_string());

        let mut site_power = self.site_power()?;

        // dispatch order: priority first, declaration order on ties
        let mut order: Vec<(i32, usize)> = self
            .loadpoints
            .iter()
            .enumerate()
            .map(|(id, lp)| (lp.settings().read().priority, id))
            .collect();
        order.sort_by_key(|&(priority, _)| Reverse(priority));

        for (_, id) in order {
            let used = self.loadpoints[id].update(mode, site_power);
            let remaining = site_power + used;
            debug!(
                loadpoint = id,
                site = site_power,
                used,
                remaining,
                "remaining power"
            );
            site_power = remaining;
        }

        Ok(())
    }

    /// Returns the net power available to charging: `grid + battery −
    /// residual`. Negative values are surplus.
    fn site_power(&mut self) -> Result<f64, DeviceError> {
        self.update_meters()?;

        let site_power = self.grid_power + self.battery_power - self.residual_power;
        debug!(
            grid = self.grid_power,
            pv = self.pv_power,
            battery = self.battery_power,
            site_power,
            "site power"
        );
        self.publish("sitePower", site_power);

        Ok(site_power)
    }

    /// Reads all meters with bounded retries. Missing optional meters keep
    /// reading zero.
    fn update_meters(&mut self) -> Result<(), DeviceError> {
        self.grid_power = self.read_meter("grid", &self.grid_meter)?;

        if let Some(meter) = &self.pv_meter {
            self.pv_power = self.read_meter("pv", meter)?;
        }

        if let Some(meter) = &self.battery_meter {
            self.battery_power = self.read_meter("battery", meter)?;

            if let Some(soc) = &meter.soc {
                match soc.soc() {
                    Ok(soc) => self.publish("batterySoc", soc),
                    Err(err) => debug!("battery soc: {err}"),
                }
            }
        }

        Ok(())
    }

    fn read_meter(&self, name: &str, meter: &MeterDevice) -> Result<f64, DeviceError> {
        let power = retry(READ_ATTEMPTS, READ_BACKOFF, || meter.current_power())
            .inspect_err(|err| error!("updating {name} meter: {err}"))?;

        debug!(name, power, "meter power");
        self.publish(&format!("{name}Power"), power);

        if let Some(energy) = &meter.energy {
            if let Ok(energy) = energy.total_energy() {
                self.publish(&format!("{name}Energy"), energy);
            }
        }

        Ok(power)
    }

    /// Main control loop: periodic ticks, immediate re-evaluation on
    /// trigger, termination on shutdown.
    ///
    /// A failed periodic cycle retriggers immediately so the sample is not
    /// lost; the ticker is reset after every triggered cycle so the next
    /// periodic one is a full interval later.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut trigger_rx) = self.trigger_rx.take() else {
            warn!("site control loop already running");
            return;
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "site control loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.update().is_err() {
                        // retrigger immediately to avoid losing a sample
                        let _ = self.trigger_tx.try_send(());
                    }
                }
                Some(()) = trigger_rx.recv() => {
                    let _ = self.update();
                    ticker.reset();
                }
                _ = shutdown.changed() => {
                    info!("site control loop stopped");
                    break;
                }
            }
        }
    }

    fn publish(&self, key: &str, val: impl Serialize) {
        if let Some(ui) = &self.ui {
            let _ = ui.send(Param::new(key, val));
        }
    }
}

/// Clonable handle for external actors: UI, API, HEMS.
#[derive(Clone)]
pub struct SiteHandle {
    settings: Arc<RwLock<SiteSettings>>,
    loadpoints: Vec<LoadpointHandle>,
    trigger: mpsc::Sender<()>,
}

impl SiteHandle {
    /// Current charge mode.
    pub fn mode(&self) -> ChargeMode {
        self.settings.read().mode
    }

    /// Sets the charge mode; a change triggers an immediate control cycle.
    pub fn set_mode(&self, mode: ChargeMode) {
        let changed = {
            let mut settings = self.settings.write();
            let changed = settings.mode != mode;
            settings.mode = mode;
            changed
        };

        if changed {
            info!(%mode, "set charge mode");
            self.poke();
        }
    }

    /// Requests an immediate control cycle. Non-blocking; collapses into
    /// an already-pending trigger.
    pub fn poke(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Per-loadpoint setting handles, in declaration order.
    pub fn loadpoints(&self) -> &[LoadpointHandle] {
        &self.loadpoints
    }
}

/// Clonable handle to one loadpoint's runtime settings.
#[derive(Clone)]
pub struct LoadpointHandle {
    title: String,
    settings: SharedSettings,
    trigger: mpsc::Sender<()>,
}

impl LoadpointHandle {
    /// Loadpoint name.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Shared settings record for readers.
    pub fn settings(&self) -> SharedSettings {
        self.settings.clone()
    }

    /// Sets the phase count. Values outside 1..=3 are rejected.
    pub fn set_phases(&self, phases: u32) -> Result<(), String> {
        if !(1..=3).contains(&phases) {
            return Err(format!("phases must be 1..=3, got {phases}"));
        }
        self.settings.write().phases = phases;
        self.poke();
        Ok(())
    }

    /// Sets the minimum charge current in amperes.
    pub fn set_min_current(&self, amps: i64) {
        self.settings.write().min_current = amps;
        self.poke();
    }

    /// Sets the maximum charge current in amperes.
    pub fn set_max_current(&self, amps: i64) {
        self.settings.write().max_current = amps;
        self.poke();
    }

    /// Sets the budget priority.
    pub fn set_priority(&self, priority: i32) {
        self.settings.write().priority = priority;
        self.poke();
    }

    /// Sets or clears the session SoC limit in percent.
    pub fn set_limit_soc(&self, soc: Option<f64>) {
        self.settings.write().limit_soc = soc;
        self.poke();
    }

    /// Sets or clears the session energy limit in kWh.
    pub fn set_limit_energy(&self, kwh: Option<f64>) {
        self.settings.write().limit_energy = kwh;
        self.poke();
    }

    /// Sets or clears the charging plan target.
    pub fn set_plan(&self, plan: Option<(chrono::DateTime<chrono::Utc>, i64)>) {
        let mut settings = self.settings.write();
        settings.plan_time = plan.map(|(time, _)| time);
        settings.plan_soc = plan.map(|(_, soc)| soc);
        drop(settings);
        self.poke();
    }

    fn poke(&self) {
        let _ = self.trigger.try_send(());
    }
}
