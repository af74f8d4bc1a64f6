//! Shared test fixtures for integration tests.

#![allow(dead_code)] // not every test crate uses every fixture

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use gridpilot::core::clock::Clock;
use gridpilot::core::loadpoint::{Loadpoint, LoadpointConfig, Threshold};
use gridpilot::core::types::{ChargeStatus, Param, PushEvent, PushKind};
use gridpilot::device::{
    Charger, ChargerCapabilities, ChargerDevice, DeviceError, Identifier, Meter, MeterDevice,
};

/// A device write recorded by [`TestCharger`], stamped with the test
/// clock.
#[derive(Debug, Clone)]
pub struct Command {
    pub at: Instant,
    pub op: String,
}

struct TestChargerState {
    status: Result<ChargeStatus, DeviceError>,
    enabled: bool,
    power: f64,
    commands: Vec<Command>,
    retry_enable: u32,
    retry_identify: u32,
    identity: Option<String>,
}

/// Scriptable charger: pilot status and failures are set by the test,
/// every write is recorded with its timestamp.
pub struct TestCharger {
    clock: Clock,
    state: Mutex<TestChargerState>,
}

impl TestCharger {
    pub fn new(clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(TestChargerState {
                status: Ok(ChargeStatus::A),
                enabled: false,
                power: 0.0,
                commands: Vec::new(),
                retry_enable: 0,
                retry_identify: 0,
                identity: None,
            }),
        })
    }

    pub fn set_status(&self, status: ChargeStatus) {
        self.state.lock().status = Ok(status);
    }

    pub fn fail_status(&self) {
        self.state.lock().status = Err(DeviceError::Timeout);
    }

    /// Makes the next `n` enable writes answer `MustRetry`.
    pub fn retry_enable(&self, n: u32) {
        self.state.lock().retry_enable = n;
    }

    /// Reports `identity` after `n` `MustRetry` answers.
    pub fn set_identity(&self, identity: &str, n: u32) {
        let mut state = self.state.lock();
        state.identity = Some(identity.to_string());
        state.retry_identify = n;
    }

    /// Sets the power reported through the charger-side meter capability.
    pub fn set_power(&self, watts: f64) {
        self.state.lock().power = watts;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|c| c.op.clone())
            .collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn device_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

impl Charger for TestCharger {
    fn status(&self) -> Result<ChargeStatus, DeviceError> {
        self.state.lock().status.clone()
    }

    fn enabled(&self) -> Result<bool, DeviceError> {
        Ok(self.state.lock().enabled)
    }

    fn enable(&self, enable: bool) -> Result<(), DeviceError> {
        let at = self.clock.now();
        let mut state = self.state.lock();
        if state.retry_enable > 0 {
            state.retry_enable -= 1;
            return Err(DeviceError::MustRetry);
        }
        state.enabled = enable;
        state.commands.push(Command {
            at,
            op: format!("enable {enable}"),
        });
        Ok(())
    }

    fn max_current(&self, current: i64) -> Result<(), DeviceError> {
        let at = self.clock.now();
        let mut state = self.state.lock();
        state.commands.push(Command {
            at,
            op: format!("current {current}"),
        });
        Ok(())
    }
}

impl Meter for TestCharger {
    fn current_power(&self) -> Result<f64, DeviceError> {
        Ok(self.state.lock().power)
    }
}

impl Identifier for TestCharger {
    fn identify(&self) -> Result<String, DeviceError> {
        let mut state = self.state.lock();
        if state.retry_identify > 0 {
            state.retry_identify -= 1;
            return Err(DeviceError::MustRetry);
        }
        state
            .identity
            .clone()
            .ok_or(DeviceError::NotAvailable)
    }
}

/// A meter with settable power and injectable failures.
pub struct TestMeter {
    power: Mutex<f64>,
    failures: Mutex<u32>,
}

impl TestMeter {
    pub fn new(watts: f64) -> Arc<Self> {
        Arc::new(Self {
            power: Mutex::new(watts),
            failures: Mutex::new(0),
        })
    }

    pub fn set_power(&self, watts: f64) {
        *self.power.lock() = watts;
    }

    /// Makes the next `n` reads fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }
}

impl Meter for TestMeter {
    fn current_power(&self) -> Result<f64, DeviceError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(DeviceError::Transient("injected".into()));
        }
        Ok(*self.power.lock())
    }
}

/// Wraps a [`TestMeter`] as a plain power-only meter device.
pub fn meter_device(meter: Arc<TestMeter>) -> MeterDevice {
    MeterDevice::from_power(meter)
}

/// Loadpoint config used by most tests: 3 phases, 6..16 A, no guard.
pub fn test_config() -> LoadpointConfig {
    LoadpointConfig {
        title: "test".into(),
        phases: 3,
        min_current: 6,
        max_current: 16,
        sensitivity: 1,
        guard_duration: Duration::ZERO,
        ..LoadpointConfig::default()
    }
}

/// Builds a prepared loadpoint around a scripted charger.
///
/// `with_meter` attaches the charger's own meter capability; without it,
/// charge power is synthesized from the commanded current.
pub fn build_loadpoint(
    charger: Arc<TestCharger>,
    clock: Clock,
    cfg: LoadpointConfig,
    with_meter: bool,
    identifier: bool,
) -> (
    Loadpoint,
    UnboundedReceiver<Param>,
    UnboundedReceiver<PushEvent>,
) {
    let caps = ChargerCapabilities {
        meter: with_meter.then(|| charger.clone() as Arc<dyn Meter>),
        identifier: identifier.then(|| charger.clone() as Arc<dyn Identifier>),
        ..Default::default()
    };
    let device = ChargerDevice::new(charger, caps);
    let mut lp = Loadpoint::new(clock, cfg, 230.0, device, None, None, Vec::new());

    let (ui_tx, ui_rx) = unbounded_channel();
    let (push_tx, push_rx) = unbounded_channel();
    lp.prepare(ui_tx, push_tx);
    (lp, ui_rx, push_rx)
}

/// Builds an unprepared loadpoint for site-level tests; the site wires
/// the channels in `Site::prepare`.
pub fn build_loadpoint_raw(
    charger: Arc<TestCharger>,
    clock: Clock,
    cfg: LoadpointConfig,
    with_meter: bool,
) -> Loadpoint {
    let caps = ChargerCapabilities {
        meter: with_meter.then(|| charger.clone() as Arc<dyn Meter>),
        ..Default::default()
    };
    let device = ChargerDevice::new(charger, caps);
    Loadpoint::new(clock, cfg, 230.0, device, None, None, Vec::new())
}

/// Hysteresis thresholds in the shape used by the PV scenarios.
pub fn threshold(threshold: f64, delay_secs: u64) -> Threshold {
    Threshold {
        threshold,
        delay: Duration::from_secs(delay_secs),
    }
}

/// Drains every pending push event kind.
pub fn push_kinds(rx: &mut UnboundedReceiver<PushEvent>) -> Vec<PushKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

/// Drains pending UI params into `(key, value)` pairs.
pub fn drain_params(rx: &mut UnboundedReceiver<Param>) -> Vec<(String, serde_json::Value)> {
    let mut params = Vec::new();
    while let Ok(param) = rx.try_recv() {
        params.push((param.key, param.val));
    }
    params
}
